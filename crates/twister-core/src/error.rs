//! Failure taxonomy shared by the sync engine and source adapters.
//!
//! Functions return `anyhow::Result`; these variants ride inside the
//! `anyhow::Error` so the engine can branch on them with `downcast_ref`.

use thiserror::Error;

use crate::auth::Provider;

#[derive(Debug, Error)]
pub enum SyncError {
    /// No usable credential for the (provider, channel) pair.
    #[error("no {provider} credential available for channel {channel_id}")]
    AuthUnavailable {
        provider: Provider,
        channel_id: String,
    },

    /// A single provider API call failed (network, rate limit, 5xx).
    #[error("{provider}: request failed{}: {message}", status_suffix(.status))]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// The server-side change token (history id, sync token) is no longer valid.
    #[error("{provider}: change token expired, full resync required")]
    ChangeTokenExpired { provider: String },

    /// A persisted callback could not be decoded or has no registered handler.
    #[error("invalid callback: {0}")]
    InvalidCallback(String),
}

impl SyncError {
    pub fn provider(provider: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::Provider {
            provider: provider.to_string(),
            status,
            message: message.into(),
        }
    }

    /// HTTP status of a failed provider call, if there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Provider { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the error ends the current run instead of being retried by the host.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::AuthUnavailable { .. })
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with HTTP {s}")).unwrap_or_default()
}

/// Look for a `SyncError` anywhere in an `anyhow` chain.
pub fn sync_error(err: &anyhow::Error) -> Option<&SyncError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SyncError>())
}
