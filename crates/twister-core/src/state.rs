//! Per-channel sync bookkeeping persisted in the host store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Start,
    Offset(u64),
    /// 1-based page number.
    Page(u32),
    /// Opaque provider token (`after`, `pageToken`, `offset`, `cursor`).
    Token(String),
}

impl Cursor {
    pub fn page_number(&self) -> u32 {
        match self {
            Cursor::Page(n) => *n,
            _ => 1,
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Cursor::Offset(n) => *n,
            _ => 0,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Cursor::Token(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// Cursor record for one in-flight sync run of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub cursor: Cursor,
    pub batch_number: u32,
    pub items_processed: u64,
    pub initial_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Server-side change token (history id, sync token) seeding an incremental run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_min: Option<DateTime<Utc>>,
    /// Consecutive failed attempts at the current batch.
    #[serde(default)]
    pub failures: u32,
    /// Identifies the run; a batch whose run id no longer matches the stored
    /// state belongs to a replaced run and must not write.
    #[serde(default)]
    pub run_id: String,
}

impl SyncState {
    pub fn new(options: &SyncOptions) -> Self {
        Self {
            cursor: Cursor::Start,
            batch_number: 1,
            items_processed: 0,
            initial_sync: options.initial_sync,
            phase: None,
            change_token: options.change_token.clone(),
            time_min: options.time_min,
            failures: 0,
            run_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Whether `stored` is still this run's state.
    pub fn same_run(&self, stored: &SyncState) -> bool {
        self.run_id == stored.run_id
    }

    pub fn phase_is(&self, phase: &str) -> bool {
        self.phase.as_deref() == Some(phase)
    }
}

/// How a sync run is started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOptions {
    pub initial_sync: bool,
    pub change_token: Option<String>,
    pub time_min: Option<DateTime<Utc>>,
}

impl SyncOptions {
    pub fn initial() -> Self {
        Self {
            initial_sync: true,
            ..Default::default()
        }
    }

    pub fn incremental(change_token: Option<String>) -> Self {
        Self {
            initial_sync: false,
            change_token,
            time_min: None,
        }
    }

    pub fn since(mut self, time_min: Option<DateTime<Utc>>) -> Self {
        self.time_min = time_min;
        self
    }
}

/// A provisioned provider-side webhook or watch subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub webhook_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider resource handle needed to tear the subscription down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl WebhookRegistration {
    pub fn new(webhook_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            url: url.into(),
            expires_at: None,
            resource_id: None,
        }
    }

    pub fn expiring_within(&self, lead: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at - now <= lead).unwrap_or(false)
    }

    /// When a proactive renewal should run.
    pub fn renew_at(&self, lead: Duration) -> Option<DateTime<Utc>> {
        self.expires_at.map(|at| at - lead)
    }
}

/// Best-effort guard against two runs starting for one channel.
///
/// Stored with a plain get-then-set, so two concurrent starts can both win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLock {
    pub acquired_at: DateTime<Utc>,
}

impl SyncLock {
    pub fn now() -> Self {
        Self {
            acquired_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.acquired_at > ttl
    }
}

/// Store keys owned by one channel.
#[derive(Debug, Clone)]
pub struct ChannelKeys {
    pub sync_enabled: String,
    pub sync_state: String,
    pub sync_lock: String,
    pub webhook_id: String,
    pub webhook_secret: String,
    pub last_sync_token: String,
    pub renewal_task: String,
    pub disable_callback: String,
    pub webhook_callback: String,
}

impl ChannelKeys {
    pub fn new(channel_id: &str) -> Self {
        Self {
            sync_enabled: format!("sync_enabled_{}", channel_id),
            sync_state: format!("sync_state_{}", channel_id),
            sync_lock: format!("sync_lock_{}", channel_id),
            webhook_id: format!("webhook_id_{}", channel_id),
            webhook_secret: format!("webhook_secret_{}", channel_id),
            last_sync_token: format!("last_sync_token_{}", channel_id),
            renewal_task: format!("renewal_task_{}", channel_id),
            disable_callback: format!("disable_callback_{}", channel_id),
            webhook_callback: format!("webhook_callback_{}", channel_id),
        }
    }

    pub fn all(&self) -> [&str; 9] {
        [
            &self.sync_enabled,
            &self.sync_state,
            &self.sync_lock,
            &self.webhook_id,
            &self.webhook_secret,
            &self.last_sync_token,
            &self.renewal_task,
            &self.disable_callback,
            &self.webhook_callback,
        ]
    }
}
