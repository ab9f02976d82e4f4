//! Credential resolution for source adapters.
//!
//! Tokens are issued and refreshed by the host. Adapters only ask for the
//! current token of a (provider, channel) pair, once per invocation.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::host::Integrations;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Linear,
    Asana,
    Google,
    Slack,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Linear => "linear",
            Provider::Asana => "asana",
            Provider::Google => "google",
            Provider::Slack => "slack",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub provider: Provider,
    pub access_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    pub fn new(provider: Provider, access_token: impl Into<String>) -> Self {
        Self {
            provider,
            access_token: access_token.into(),
            scopes: Vec::new(),
            expires_at: None,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Resolves a channel's credential through the host on every call.
///
/// Nothing is cached: a revoked integration must fail the very next batch.
#[derive(Clone)]
pub struct TokenResolver {
    provider: Provider,
    integrations: Arc<dyn Integrations>,
}

impl TokenResolver {
    pub fn new(provider: Provider, integrations: Arc<dyn Integrations>) -> Self {
        Self {
            provider,
            integrations,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub async fn resolve(&self, channel_id: &str) -> Result<AuthToken> {
        debug!("resolving {} token for channel {}", self.provider, channel_id);
        match self.integrations.get_token(self.provider, channel_id).await? {
            Some(token) if !token.access_token.is_empty() => Ok(token),
            _ => Err(SyncError::AuthUnavailable {
                provider: self.provider,
                channel_id: channel_id.to_string(),
            }
            .into()),
        }
    }
}
