//! Contracts for the primitives the host runtime provides to plugins.
//!
//! Storage, scheduling, callback persistence, webhook provisioning and
//! integration access all live outside this crate. Adapters see them only
//! through these traits, bundled in [`Host`].

pub mod memory;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{AuthToken, Provider};
use crate::model::{LinkFilter, NewLinkWithNotes};

/// Per-instance key/value persistence of JSON values.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_value(&self, key: &str) -> Result<Option<Value>>;
    async fn set_value(&self, key: &str, value: Value) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

/// Typed access on top of [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key).await? {
            Some(Value::Null) | None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .with_context(|| format!("decoding stored value for {}", key)),
        }
    }

    async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        self.set_value(key, serde_json::to_value(value)?).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// A durable reference to "call `method` on `handler` with `args`".
///
/// This replaces closure serialization: handlers are looked up by name in a
/// [`crate::registry::CallbackRegistry`] when the callback fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub handler: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Callback {
    pub fn new(handler: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            handler: handler.into(),
            method: method.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(pub String);

#[async_trait]
pub trait Callbacks: Send + Sync {
    async fn create(&self, callback: Callback) -> Result<CallbackToken>;
    /// Invoke a stored callback, appending `extra` to its bound arguments.
    async fn run(&self, token: &CallbackToken, extra: Vec<Value>) -> Result<Value>;
    async fn delete(&self, token: &CallbackToken) -> Result<()>;
}

/// At-least-once delayed invocation of a callback.
///
/// A task owns its callback: the host deletes it once the task's last attempt
/// has run, or when the task is cancelled.
#[async_trait]
pub trait Tasks: Send + Sync {
    /// Runs immediately when `run_at` is `None`.
    async fn run_task(&self, token: CallbackToken, run_at: Option<DateTime<Utc>>) -> Result<TaskHandle>;
    async fn cancel_task(&self, handle: &TaskHandle) -> Result<()>;
}

#[async_trait]
pub trait Network: Send + Sync {
    /// Provision an inbound endpoint bound to a callback. Returns its URL (or topic name).
    async fn create_webhook(&self, token: CallbackToken) -> Result<String>;
    async fn delete_webhook(&self, url: &str) -> Result<()>;
}

#[async_trait]
pub trait Integrations: Send + Sync {
    async fn get_token(&self, provider: Provider, channel_id: &str) -> Result<Option<AuthToken>>;
    /// Upsert a thread by its `source`.
    async fn save_link(&self, link: NewLinkWithNotes) -> Result<()>;
    /// Mark every thread matching `filter` as archived. Returns how many changed.
    async fn archive_links(&self, filter: &LinkFilter) -> Result<usize>;
}

/// Everything an adapter instance may touch.
#[derive(Clone)]
pub struct Host {
    pub store: Arc<dyn Store>,
    pub tasks: Arc<dyn Tasks>,
    pub callbacks: Arc<dyn Callbacks>,
    pub network: Arc<dyn Network>,
    pub integrations: Arc<dyn Integrations>,
}

impl Host {
    /// Build a host whose every primitive is served by one implementation.
    pub fn from_shared<H>(host: Arc<H>) -> Self
    where
        H: Store + Tasks + Callbacks + Network + Integrations + 'static,
    {
        Self {
            store: host.clone(),
            tasks: host.clone(),
            callbacks: host.clone(),
            network: host.clone(),
            integrations: host,
        }
    }

    /// Same host with store keys prefixed by `namespace`.
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            store: Arc::new(ScopedStore {
                prefix: format!("{}:", namespace),
                inner: self.store.clone(),
            }),
            ..self.clone()
        }
    }
}

struct ScopedStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

#[async_trait]
impl Store for ScopedStore {
    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get_value(&format!("{}{}", self.prefix, key)).await
    }

    async fn set_value(&self, key: &str, value: Value) -> Result<()> {
        self.inner.set_value(&format!("{}{}", self.prefix, key), value).await
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.inner.clear(&format!("{}{}", self.prefix, key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryHost;

    #[tokio::test]
    async fn test_scoped_store_prefixes_keys() {
        let mem = MemoryHost::new();
        let host = Host::from_shared(mem.clone());
        let scoped = host.scoped("github-issues");

        scoped.store.set("sync_state_1", &42u32).await.unwrap();
        assert_eq!(scoped.store.get::<u32>("sync_state_1").await.unwrap(), Some(42));
        assert_eq!(host.store.get::<u32>("sync_state_1").await.unwrap(), None);
        assert!(mem.keys().await.contains(&"github-issues:sync_state_1".to_string()));

        scoped.store.clear("sync_state_1").await.unwrap();
        assert!(mem.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_ext_treats_null_as_absent() {
        let mem = MemoryHost::new();
        mem.set_value("k", Value::Null).await.unwrap();
        assert_eq!(mem.get::<String>("k").await.unwrap(), None);
    }
}
