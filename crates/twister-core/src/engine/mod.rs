//! The sync engine shared by every source adapter.
//!
//! One `SyncEngine` wraps one [`SyncSource`] and owns everything that is the
//! same across providers:
//! - channel enable/disable and the per-channel store keys (`controller`)
//! - the self-scheduling batch loop (`batch`)
//! - webhook verification, routing and subscription renewal (`ingest`)
//!
//! The engine is itself a [`CallbackHandler`]; every task and webhook it
//! schedules is a [`Callback`] addressed to `source.name()`.

mod batch;
mod controller;
mod ingest;


pub use batch::BatchOutcome;
pub use ingest::IngestOutcome;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::redirect::Policy;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::TokenResolver;
use crate::error::SyncError;
use crate::host::{Callback, Host, TaskHandle};
use crate::model::{LinkFilter, NewLinkWithNotes};
use crate::providers::{SourceContext, SyncSettings, SyncSource};
use crate::registry::{arg, CallbackHandler};
use crate::webhook::WebhookRequest;

pub const SYNC_BATCH: &str = "sync_batch";
pub const ON_WEBHOOK: &str = "on_webhook";
pub const RENEW_WEBHOOK: &str = "renew_webhook";

pub struct SyncEngine<S: SyncSource> {
    source: Arc<S>,
    host: Host,
    settings: SyncSettings,
    resolver: TokenResolver,
    http: reqwest::Client,
    /// Handler notified with the channel's `LinkFilter` when a channel is disabled.
    disable_handler: Option<(String, String)>,
}

impl<S: SyncSource> SyncEngine<S> {
    /// `host` is scoped to the source name so adapters never share store keys.
    pub fn new(source: S, host: &Host, settings: SyncSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("twister")
            .timeout(Duration::from_secs(30))
            .redirect(Policy::limited(5))
            .build()?;

        let resolver = TokenResolver::new(source.provider(), host.integrations.clone());
        let host = host.scoped(source.name());

        Ok(Self {
            source: Arc::new(source),
            host,
            settings,
            resolver,
            http,
            disable_handler: None,
        })
    }

    /// Notify `handler.method(filter)` once whenever a channel is disabled.
    pub fn on_disabled(mut self, handler: impl Into<String>, method: impl Into<String>) -> Self {
        self.disable_handler = Some((handler.into(), method.into()));
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Resolve a fresh credential and build the adapter context for `channel_id`.
    async fn context(&self, channel_id: &str) -> Result<SourceContext> {
        let token = self.resolver.resolve(channel_id).await?;
        Ok(SourceContext::new(channel_id, token, self.http.clone(), &self.settings))
    }

    fn filter(&self, channel_id: &str) -> LinkFilter {
        LinkFilter {
            sync_provider: self.source.provider().as_str().to_string(),
            syncable_id: channel_id.to_string(),
        }
    }

    /// Tag a thread with the channel it came from.
    fn stamp(&self, channel_id: &str, link: &mut NewLinkWithNotes) {
        link.meta.sync_provider = Some(self.source.provider().as_str().to_string());
        link.meta.syncable_id = Some(channel_id.to_string());
    }

    fn callback(&self, method: &str, channel_id: &str) -> Callback {
        Callback::new(self.source.name(), method, vec![json!(channel_id)])
    }

    /// Queue a callback on this engine via the host's task primitive.
    async fn schedule(&self, method: &str, channel_id: &str, run_at: Option<DateTime<Utc>>) -> Result<TaskHandle> {
        let token = self.host.callbacks.create(self.callback(method, channel_id)).await?;
        debug!("{}: scheduling {} for channel {}", self.source.name(), method, channel_id);
        self.host.tasks.run_task(token, run_at).await
    }
}

#[async_trait]
impl<S: SyncSource> CallbackHandler for SyncEngine<S> {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value> {
        let channel_id: String = arg(args, 0)?;
        match method {
            SYNC_BATCH => {
                let outcome = self.sync_batch(&channel_id).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            ON_WEBHOOK => {
                let request: WebhookRequest = arg(args, 1)?;
                let outcome = self.on_webhook(&channel_id, &request).await?;
                Ok(serde_json::to_value(outcome.into_response())?)
            }
            RENEW_WEBHOOK => {
                self.renew_webhook(&channel_id).await?;
                Ok(Value::Null)
            }
            other => Err(SyncError::InvalidCallback(format!(
                "{} has no method {}",
                self.source.name(),
                other
            ))
            .into()),
        }
    }
}
