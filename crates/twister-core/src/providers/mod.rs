//! Source adapters and the contract they implement.
//!
//! This module provides:
//! - `SyncSource` trait that every adapter implements
//! - `SourceContext`, the per-invocation credential + HTTP bundle
//! - Configuration loading from TOML
//!
//! # Adding a New Source
//!
//! 1. Create a new file in `providers/` implementing `SyncSource`
//! 2. Wrap it in a `SyncEngine` and register the engine with the host's callback registry
//! 3. Optionally add a `[sources.<name>]` table to the config file

pub mod config;
pub mod http;

pub mod asana;
pub mod github;
pub mod github_issues;
pub mod github_pulls;
pub mod gmail;
pub mod google_calendar;
pub mod linear;
pub mod slack;

pub use asana::AsanaSource;
pub use config::{SourceConfig, SyncSettings, TwisterConfig};
pub use github_issues::GithubIssuesSource;
pub use github_pulls::GithubPullsSource;
pub use gmail::GmailSource;
pub use google_calendar::GoogleCalendarSource;
pub use http::call_with_backoff;
pub use linear::LinearSource;
pub use slack::SlackSource;

/// Names of the adapters shipped with this crate.
pub const BUILTIN_SOURCES: [&str; 7] = [
    asana::NAME,
    github_issues::NAME,
    github_pulls::NAME,
    gmail::NAME,
    google_calendar::NAME,
    linear::NAME,
    slack::NAME,
];

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use serde::de::DeserializeOwned;

use crate::auth::{AuthToken, Provider};
use crate::model::{Channel, NewLinkWithNotes};
use crate::state::{Cursor, SyncState, WebhookRegistration};
use crate::webhook::{WebhookRequest, WebhookResponse};

/// Everything an adapter needs for one invocation.
///
/// Built fresh by the engine for every batch and webhook so a revoked
/// credential is noticed immediately.
#[derive(Clone)]
pub struct SourceContext {
    /// Empty when listing channels.
    pub channel_id: String,
    pub token: AuthToken,
    pub http: reqwest::Client,
    pub page_size: u32,
    pub max_http_retries: u32,
}

impl SourceContext {
    pub fn new(channel_id: impl Into<String>, token: AuthToken, http: reqwest::Client, settings: &SyncSettings) -> Self {
        Self {
            channel_id: channel_id.into(),
            token,
            http,
            page_size: settings.page_size,
            max_http_retries: settings.max_http_retries,
        }
    }

    pub fn provider(&self) -> Provider {
        self.token.provider
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.access_token)
    }

    /// Send a request built by `builder_fn` with rate-limit retries.
    pub async fn send<F>(&self, builder_fn: F) -> Result<reqwest::Response>
    where
        F: FnMut() -> reqwest::RequestBuilder + Send,
    {
        call_with_backoff(self.provider(), &self.channel_id, self.max_http_retries, builder_fn).await
    }

    /// Send and decode a JSON response body.
    pub async fn json<T, F>(&self, what: &str, builder_fn: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder + Send,
    {
        let response = self.send(builder_fn).await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("{}: decoding {}", self.provider(), what))
    }
}

/// One fetched page plus where to go next.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Continuation,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Continuation) -> Self {
        Self { items, next }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// Same phase, next cursor.
    More(Cursor),
    /// Start `phase` at `cursor`.
    Phase { phase: String, cursor: Cursor },
    /// Run finished. `change_token` seeds later incremental runs.
    Done { change_token: Option<String> },
}

impl Continuation {
    pub fn done() -> Self {
        Continuation::Done { change_token: None }
    }

    /// A full page means there may be more; a short page ends the scan.
    pub fn by_page_size(returned: usize, requested: u32, next: Cursor) -> Self {
        if returned >= requested as usize && returned > 0 {
            Continuation::More(next)
        } else {
            Continuation::done()
        }
    }

    /// Follow an explicit next-page token when the API provides one.
    pub fn by_token(token: Option<String>) -> Self {
        match token.filter(|t| !t.is_empty()) {
            Some(t) => Continuation::More(Cursor::Token(t)),
            None => Continuation::done(),
        }
    }

    /// Turn a terminal continuation into a transition to `phase`.
    pub fn or_phase(self, phase: &str) -> Self {
        match self {
            Continuation::Done { .. } => Continuation::Phase {
                phase: phase.to_string(),
                cursor: Cursor::Start,
            },
            other => other,
        }
    }
}

/// Where a webhook signing secret comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum SecretPolicy {
    /// The engine generates one per channel and hands it to `create_webhook`.
    Generated,
    /// The provider delivers it during the subscription handshake.
    Handshake,
    /// One app-wide secret from configuration.
    Static(String),
}

/// Early-return reply to a subscription handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub response: WebhookResponse,
    /// Secret learned during the handshake, to be stored for the channel.
    pub secret: Option<String>,
}

impl Handshake {
    pub fn reply(response: WebhookResponse) -> Self {
        Self { response, secret: None }
    }
}

/// What a verified webhook asks the engine to do.
#[derive(Debug, Clone)]
pub enum WebhookAction {
    Upsert(Box<NewLinkWithNotes>),
    /// Run an incremental sync seeded from the stored change token.
    IncrementalSync,
    Ignore,
}

impl WebhookAction {
    pub fn upsert(link: NewLinkWithNotes) -> Self {
        WebhookAction::Upsert(Box::new(link))
    }
}

/// An external service whose entities are synced into threads.
///
/// Adapters only describe how to talk to their provider. Scheduling, state,
/// locking and verification order live in [`crate::engine::SyncEngine`].
#[async_trait]
pub trait SyncSource: Send + Sync + 'static {
    /// A provider entity as returned by `fetch_page`.
    type Item: Send;

    fn provider(&self) -> Provider;

    /// Source identifier, also the callback handler name (e.g., "github-issues").
    fn name(&self) -> &str;

    /// How far back a full scan reaches, for sources that filter by time.
    fn lookback(&self) -> Option<Duration> {
        None
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>>;

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<Self::Item>>;

    /// Map one entity. `Ok(None)` means intentionally filtered out.
    async fn transform(&self, ctx: &SourceContext, item: Self::Item) -> Result<Option<NewLinkWithNotes>>;

    fn secret_policy(&self) -> SecretPolicy {
        SecretPolicy::Generated
    }

    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookRegistration>;

    async fn delete_webhook(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()>;

    /// Re-subscribe an expiring registration. `None` means not renewable.
    async fn renew_webhook(
        &self,
        _ctx: &SourceContext,
        _registration: &WebhookRegistration,
        _secret: Option<&str>,
    ) -> Result<Option<WebhookRegistration>> {
        Ok(None)
    }

    fn handshake(&self, _request: &WebhookRequest) -> Option<Handshake> {
        None
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool;

    async fn route(&self, ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>>;
}

/// Resolve the API root, preferring a configured override.
pub(crate) fn base_url(config: &SourceConfig, default: &str) -> String {
    config
        .api_base_url
        .clone()
        .unwrap_or_else(|| default.to_string())
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_page_size() {
        assert_eq!(
            Continuation::by_page_size(50, 50, Cursor::Page(2)),
            Continuation::More(Cursor::Page(2))
        );
        assert_eq!(Continuation::by_page_size(20, 50, Cursor::Page(2)), Continuation::done());
        assert_eq!(Continuation::by_page_size(0, 50, Cursor::Page(2)), Continuation::done());
    }

    #[test]
    fn test_by_token_and_phase() {
        assert_eq!(Continuation::by_token(Some(String::new())), Continuation::done());
        assert_eq!(
            Continuation::by_token(Some("n1".to_string())),
            Continuation::More(Cursor::Token("n1".to_string()))
        );
        assert_eq!(
            Continuation::done().or_phase("recently_closed"),
            Continuation::Phase {
                phase: "recently_closed".to_string(),
                cursor: Cursor::Start
            }
        );
    }

    #[test]
    fn test_base_url_override() {
        let mut config = SourceConfig::default();
        assert_eq!(base_url(&config, "https://api.github.com"), "https://api.github.com");
        config.api_base_url = Some("http://127.0.0.1:1234/".to_string());
        assert_eq!(base_url(&config, "https://api.github.com"), "http://127.0.0.1:1234");
    }
}
