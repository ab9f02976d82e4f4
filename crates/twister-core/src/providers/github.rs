//! GitHub API plumbing shared by the issues and pull request sources.
//!
//! Channels are repositories, addressed by numeric id through the
//! `/repositories/{id}` routes so renames and transfers don't break them.

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{base_url, SourceConfig, SourceContext};
use crate::model::{Channel, NewContact, NewNote};
use crate::state::WebhookRegistration;
use crate::webhook::{verify_hmac_sha256, WebhookRequest, WebhookResponse};

pub const DEFAULT_API: &str = "https://api.github.com";

pub const EVENT_HEADER: &str = "x-github-event";
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Clone)]
pub struct GithubApi {
    base: String,
}

impl GithubApi {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base: base_url(config, DEFAULT_API),
        }
    }

    pub fn repo_url(&self, repo_id: &str, path: &str) -> String {
        format!("{}/repositories/{}{}", self.base, repo_id, path)
    }

    fn get(&self, ctx: &SourceContext, url: &str) -> reqwest::RequestBuilder {
        ctx.http
            .get(url)
            .header("Authorization", ctx.bearer())
            .header("Accept", "application/vnd.github+json")
    }

    /// GET a JSON resource with rate-limit handling.
    pub async fn fetch<T: serde::de::DeserializeOwned>(&self, ctx: &SourceContext, url: &str) -> Result<T> {
        ctx.json(url, || self.get(ctx, url)).await
    }

    /// Repositories the user can see, most recently pushed first.
    pub async fn list_repos(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{}/user/repos?per_page=100&sort=pushed&page={}",
                self.base, page
            );
            let batch: Vec<GithubRepo> = self.fetch(ctx, &url).await?;
            let done = batch.len() < 100;
            channels.extend(
                batch
                    .into_iter()
                    .map(|repo| Channel::new(repo.id.to_string(), repo.full_name)),
            );
            if done {
                break;
            }
            page += 1;
        }
        Ok(channels)
    }

    /// Every comment on an issue or pull request, oldest first.
    pub async fn comments(&self, ctx: &SourceContext, number: u64) -> Result<Vec<GithubComment>> {
        let mut comments = Vec::new();
        let mut page = 1;
        loop {
            let url = self.repo_url(
                &ctx.channel_id,
                &format!("/issues/{}/comments?per_page=100&page={}", number, page),
            );
            let batch: Vec<GithubComment> = self.fetch(ctx, &url).await?;
            let done = batch.len() < 100;
            comments.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(comments)
    }

    /// Comment notes for a thread. A failed fetch only loses the comments.
    pub async fn comment_notes(&self, ctx: &SourceContext, number: u64) -> Vec<NewNote> {
        match self.comments(ctx, number).await {
            Ok(comments) => comments.iter().map(GithubComment::note).collect(),
            Err(e) => {
                warn!(
                    "github: failed to fetch comments for #{} in repo {}: {:#}",
                    number, ctx.channel_id, e
                );
                Vec::new()
            }
        }
    }

    pub async fn create_hook(
        &self,
        ctx: &SourceContext,
        url: &str,
        secret: Option<&str>,
        events: &[&str],
    ) -> Result<WebhookRegistration> {
        let endpoint = self.repo_url(&ctx.channel_id, "/hooks");
        let payload = json!({
            "name": "web",
            "active": true,
            "events": events,
            "config": {
                "url": url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0"
            }
        });
        let hook: GithubHook = ctx
            .json("webhook", || {
                ctx.http
                    .post(&endpoint)
                    .header("Authorization", ctx.bearer())
                    .header("Accept", "application/vnd.github+json")
                    .json(&payload)
            })
            .await?;
        Ok(WebhookRegistration::new(hook.id.to_string(), url))
    }

    pub async fn delete_hook(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()> {
        let endpoint = self.repo_url(&ctx.channel_id, &format!("/hooks/{}", registration.webhook_id));
        ctx.send(|| {
            ctx.http
                .delete(&endpoint)
                .header("Authorization", ctx.bearer())
                .header("Accept", "application/vnd.github+json")
        })
        .await?;
        Ok(())
    }
}

/// `ping` is sent once when a hook is created; it needs no processing.
pub fn ping_handshake(request: &WebhookRequest) -> Option<WebhookResponse> {
    (request.header(EVENT_HEADER) == Some("ping")).then(|| WebhookResponse::text("pong"))
}

pub fn verify_signature(request: &WebhookRequest, secret: &str) -> bool {
    match request.header(SIGNATURE_HEADER) {
        Some(signature) => verify_hmac_sha256(secret, request.body.as_bytes(), signature, Some("sha256=")),
        None => false,
    }
}

pub fn event(request: &WebhookRequest) -> &str {
    request.header(EVENT_HEADER).unwrap_or_default()
}

// --- GitHub API Response Types ---

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRepo {
    pub id: u64,
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub id: u64,
    pub login: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl GithubUser {
    /// GitHub rarely exposes emails, so contacts use the noreply form.
    pub fn contact(&self) -> NewContact {
        NewContact::noreply("github.com", self.id, &self.login).with_avatar(self.avatar_url.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<GithubUser>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl GithubComment {
    pub fn note(&self) -> NewNote {
        NewNote::new(format!("comment-{}", self.id), self.body.clone())
            .by(self.user.as_ref().map(GithubUser::contact))
            .at(crate::model::parse_time(self.created_at.as_deref()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GithubHook {
    id: u64,
}

/// Envelope fields common to repository events.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    pub id: u64,
}
