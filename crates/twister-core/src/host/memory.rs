//! In-process host used by tests and local adapter development.
//!
//! Implements every host contract with plain maps. Scheduled tasks are queued
//! and only run when [`MemoryHost::run_pending`] drains them, which keeps
//! multi-batch syncs deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{Callback, CallbackToken, Callbacks, Integrations, Network, Store, TaskHandle, Tasks};
use crate::auth::{AuthToken, Provider};
use crate::model::{
    Action, LinkFilter, LinkMeta, LinkStatus, NewContact, NewLinkWithNotes, NewNote, NewOccurrence,
};
use crate::registry::{CallbackHandler, CallbackRegistry};
use crate::webhook::{WebhookRequest, WebhookResponse};

/// Guard against runaway self-scheduling in tests.
const MAX_DRAIN: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub handle: TaskHandle,
    pub token: CallbackToken,
    pub run_at: Option<DateTime<Utc>>,
}

/// A thread as the host would store it after applying upserts.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedLink {
    pub source: String,
    pub link_type: String,
    pub title: String,
    pub author: Option<NewContact>,
    pub assignee: Option<NewContact>,
    pub status: Option<LinkStatus>,
    pub done: Option<bool>,
    pub meta: LinkMeta,
    pub notes: Vec<NewNote>,
    pub actions: Vec<Action>,
    pub preview: Option<String>,
    pub unread: Option<bool>,
    pub archived: Option<bool>,
    pub occurrences: Vec<NewOccurrence>,
}

impl SavedLink {
    fn create(link: NewLinkWithNotes) -> Self {
        let mut saved = Self {
            source: link.source.clone(),
            link_type: link.link_type.clone(),
            title: link.title.clone().unwrap_or_default(),
            author: None,
            assignee: None,
            status: None,
            done: None,
            meta: LinkMeta::default(),
            notes: Vec::new(),
            actions: Vec::new(),
            preview: None,
            unread: None,
            archived: None,
            occurrences: Vec::new(),
        };
        saved.apply(link);
        saved
    }

    /// Upsert semantics: `None` keeps, notes merge by key, occurrences by original start.
    fn apply(&mut self, link: NewLinkWithNotes) {
        self.link_type = link.link_type;
        if let Some(title) = link.title {
            self.title = title;
        }
        if link.author.is_some() {
            self.author = link.author;
        }
        if link.assignee.is_some() {
            self.assignee = link.assignee;
        }
        if link.status.is_some() {
            self.status = link.status;
        }
        if link.done.is_some() {
            self.done = link.done;
        }
        if link.preview.is_some() {
            self.preview = link.preview;
        }
        if link.unread.is_some() {
            self.unread = link.unread;
        }
        if link.archived.is_some() {
            self.archived = link.archived;
        }
        if link.meta.sync_provider.is_some() {
            self.meta.sync_provider = link.meta.sync_provider;
        }
        if link.meta.syncable_id.is_some() {
            self.meta.syncable_id = link.meta.syncable_id;
        }
        self.meta.extra.extend(link.meta.extra);
        if !link.actions.is_empty() {
            self.actions = link.actions;
        }
        for note in link.notes {
            match self.notes.iter_mut().find(|n| n.key == note.key) {
                Some(existing) => *existing = note,
                None => self.notes.push(note),
            }
        }
        for occurrence in link.occurrences {
            match self
                .occurrences
                .iter_mut()
                .find(|o| o.original_start == occurrence.original_start)
            {
                Some(existing) => *existing = occurrence,
                None => self.occurrences.push(occurrence),
            }
        }
    }
}

pub struct MemoryHost {
    store: Mutex<BTreeMap<String, Value>>,
    callbacks: Mutex<HashMap<CallbackToken, Callback>>,
    registry: RwLock<CallbackRegistry>,
    tasks: Mutex<VecDeque<ScheduledTask>>,
    webhooks: Mutex<BTreeMap<String, CallbackToken>>,
    tokens: Mutex<HashMap<(Provider, String), AuthToken>>,
    links: Mutex<BTreeMap<String, SavedLink>>,
    saves: Mutex<Vec<NewLinkWithNotes>>,
    save_count: AtomicUsize,
    next_id: AtomicU64,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(BTreeMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            registry: RwLock::new(CallbackRegistry::new()),
            tasks: Mutex::new(VecDeque::new()),
            webhooks: Mutex::new(BTreeMap::new()),
            tokens: Mutex::new(HashMap::new()),
            links: Mutex::new(BTreeMap::new()),
            saves: Mutex::new(Vec::new()),
            save_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub async fn register(&self, handler: Arc<dyn CallbackHandler>) {
        self.registry.write().await.register(handler);
    }

    pub async fn set_token(&self, channel_id: &str, token: AuthToken) {
        self.tokens
            .lock()
            .await
            .insert((token.provider, channel_id.to_string()), token);
    }

    pub async fn revoke_token(&self, provider: Provider, channel_id: &str) {
        self.tokens
            .lock()
            .await
            .remove(&(provider, channel_id.to_string()));
    }

    /// All store keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.store.lock().await.keys().cloned().collect()
    }

    pub async fn pending_tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().await.iter().cloned().collect()
    }

    pub async fn callback(&self, token: &CallbackToken) -> Option<Callback> {
        self.callbacks.lock().await.get(token).cloned()
    }

    /// Run the oldest task that is due. Returns `None` when nothing is due.
    pub async fn run_next(&self) -> Result<Option<Value>> {
        let now = Utc::now();
        let task = {
            let mut tasks = self.tasks.lock().await;
            tasks
                .iter()
                .position(|t| t.run_at.map(|at| at <= now).unwrap_or(true))
                .and_then(|i| tasks.remove(i))
        };
        match task {
            Some(task) => {
                debug!("running task {}", task.handle.0);
                self.finish(&task).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Run a queued task now, whether or not it is due.
    pub async fn run_scheduled(&self, handle: &TaskHandle) -> Result<Value> {
        let task = {
            let mut tasks = self.tasks.lock().await;
            tasks
                .iter()
                .position(|t| &t.handle == handle)
                .and_then(|i| tasks.remove(i))
        };
        let task = task.ok_or_else(|| anyhow!("no queued task {}", handle.0))?;
        self.finish(&task).await
    }

    /// Tasks are never retried here, so the callback goes once the task has run.
    async fn finish(&self, task: &ScheduledTask) -> Result<Value> {
        let result = self.run(&task.token, Vec::new()).await;
        self.callbacks.lock().await.remove(&task.token);
        result
    }

    /// Callbacks still stored, whether bound to a task, a webhook or nothing.
    pub async fn callback_count(&self) -> usize {
        self.callbacks.lock().await.len()
    }

    /// Drain every due task, including tasks scheduled while draining.
    pub async fn run_pending(&self) -> Result<usize> {
        let mut ran = 0;
        while self.run_next().await?.is_some() {
            ran += 1;
            if ran >= MAX_DRAIN {
                return Err(anyhow!("task queue did not drain after {} runs", ran));
            }
        }
        Ok(ran)
    }

    pub async fn webhook_urls(&self) -> Vec<String> {
        self.webhooks.lock().await.keys().cloned().collect()
    }

    /// Simulate the host's HTTP bridge delivering a request to a provisioned webhook.
    pub async fn deliver_webhook(&self, url: &str, request: &WebhookRequest) -> Result<WebhookResponse> {
        let token = self
            .webhooks
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no webhook at {}", url))?;
        let response = self.run(&token, vec![serde_json::to_value(request)?]).await?;
        Ok(serde_json::from_value(response)?)
    }

    pub async fn link(&self, source: &str) -> Option<SavedLink> {
        self.links.lock().await.get(source).cloned()
    }

    pub async fn saved_links(&self) -> Vec<SavedLink> {
        self.links.lock().await.values().cloned().collect()
    }

    /// Every upsert request received, in order.
    pub async fn saves(&self) -> Vec<NewLinkWithNotes> {
        self.saves.lock().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryHost {
    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.store.lock().await.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.store.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.store.lock().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl Callbacks for MemoryHost {
    async fn create(&self, callback: Callback) -> Result<CallbackToken> {
        let token = CallbackToken(self.next_id("cb"));
        self.callbacks.lock().await.insert(token.clone(), callback);
        Ok(token)
    }

    async fn run(&self, token: &CallbackToken, extra: Vec<Value>) -> Result<Value> {
        let callback = self
            .callback(token)
            .await
            .ok_or_else(|| anyhow!("unknown callback token {}", token.0))?;
        let registry = self.registry.read().await.clone();
        registry.dispatch(&callback, extra).await
    }

    async fn delete(&self, token: &CallbackToken) -> Result<()> {
        self.callbacks.lock().await.remove(token);
        Ok(())
    }
}

#[async_trait]
impl Tasks for MemoryHost {
    async fn run_task(&self, token: CallbackToken, run_at: Option<DateTime<Utc>>) -> Result<TaskHandle> {
        let handle = TaskHandle(self.next_id("task"));
        self.tasks.lock().await.push_back(ScheduledTask {
            handle: handle.clone(),
            token,
            run_at,
        });
        Ok(handle)
    }

    async fn cancel_task(&self, handle: &TaskHandle) -> Result<()> {
        let cancelled: Vec<CallbackToken> = {
            let mut tasks = self.tasks.lock().await;
            let tokens = tasks
                .iter()
                .filter(|t| &t.handle == handle)
                .map(|t| t.token.clone())
                .collect();
            tasks.retain(|t| &t.handle != handle);
            tokens
        };
        let mut callbacks = self.callbacks.lock().await;
        for token in cancelled {
            callbacks.remove(&token);
        }
        Ok(())
    }
}

#[async_trait]
impl Network for MemoryHost {
    async fn create_webhook(&self, token: CallbackToken) -> Result<String> {
        let url = format!("https://hooks.local/{}", self.next_id("hook"));
        self.webhooks.lock().await.insert(url.clone(), token);
        Ok(url)
    }

    async fn delete_webhook(&self, url: &str) -> Result<()> {
        self.webhooks.lock().await.remove(url);
        Ok(())
    }
}

#[async_trait]
impl Integrations for MemoryHost {
    async fn get_token(&self, provider: Provider, channel_id: &str) -> Result<Option<AuthToken>> {
        Ok(self
            .tokens
            .lock()
            .await
            .get(&(provider, channel_id.to_string()))
            .cloned())
    }

    async fn save_link(&self, link: NewLinkWithNotes) -> Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.saves.lock().await.push(link.clone());
        let mut links = self.links.lock().await;
        match links.get_mut(&link.source) {
            Some(existing) => existing.apply(link),
            None => {
                links.insert(link.source.clone(), SavedLink::create(link));
            }
        }
        Ok(())
    }

    async fn archive_links(&self, filter: &LinkFilter) -> Result<usize> {
        let mut count = 0;
        for link in self.links.lock().await.values_mut() {
            if filter.matches(&link.meta) && link.archived != Some(true) {
                link.archived = Some(true);
                count += 1;
            }
        }
        Ok(count)
    }
}
