//! Named dispatch for persisted callbacks.
//!
//! A [`Callback`] names a handler and a method. When the host fires it, the
//! registry looks the handler up and forwards the bound plus extra arguments.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::info;

use crate::error::SyncError;
use crate::host::{Callback, Integrations};
use crate::model::LinkFilter;

/// Anything that can be the target of a persisted callback.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// Registry name, matched against [`Callback::handler`].
    fn name(&self) -> &str;

    async fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct CallbackRegistry {
    handlers: HashMap<String, Arc<dyn CallbackHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn CallbackHandler>) {
        info!("registering callback handler {}", handler.name());
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CallbackHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub async fn dispatch(&self, callback: &Callback, extra: Vec<Value>) -> Result<Value> {
        let handler = self.get(&callback.handler).ok_or_else(|| {
            SyncError::InvalidCallback(format!("no handler named {}", callback.handler))
        })?;
        let mut args = callback.args.clone();
        args.extend(extra);
        handler.dispatch(&callback.method, &args).await
    }
}

/// Decode positional argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| SyncError::InvalidCallback(format!("missing argument {}", index)))?;
    serde_json::from_value(value).with_context(|| format!("decoding callback argument {}", index))
}

/// Disable handler that archives every thread synced from the channel.
pub struct ArchiveOnDisable {
    name: String,
    integrations: Arc<dyn Integrations>,
}

impl ArchiveOnDisable {
    pub const METHOD: &'static str = "channel_disabled";

    pub fn new(name: impl Into<String>, integrations: Arc<dyn Integrations>) -> Self {
        Self {
            name: name.into(),
            integrations,
        }
    }
}

#[async_trait]
impl CallbackHandler for ArchiveOnDisable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, method: &str, args: &[Value]) -> Result<Value> {
        if method != Self::METHOD {
            return Err(SyncError::InvalidCallback(format!("{} has no method {}", self.name, method)).into());
        }
        let filter: LinkFilter = arg(args, 0)?;
        let archived = self.integrations.archive_links(&filter).await?;
        info!(
            "archived {} threads from {} channel {}",
            archived, filter.sync_provider, filter.syncable_id
        );
        Ok(Value::from(archived))
    }
}
