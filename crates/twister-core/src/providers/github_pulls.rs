//! GitHub Pull Requests source.
//!
//! Pulls are listed most recently updated first; the scan stops at the first
//! closed pull request older than the lookback window. Reviews and
//! conversation comments both become notes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use tracing::{debug, warn};

use super::github::{self, GithubApi, GithubComment, GithubUser, RepositoryRef};
use super::{Continuation, Handshake, Page, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::model::{parse_time, preview, Action, Channel, LinkMeta, LinkStatus, NewLinkWithNotes, NewNote};
use crate::state::{Cursor, SyncState, WebhookRegistration};
use crate::webhook::WebhookRequest;

pub const NAME: &str = "github-pulls";

const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const EVENTS: &[&str] = &["pull_request", "pull_request_review", "issue_comment"];

pub struct GithubPullsSource {
    api: GithubApi,
    lookback_days: i64,
}

impl GithubPullsSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            api: GithubApi::new(config),
            lookback_days: config.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
        }
    }

    async fn get_pull(&self, ctx: &SourceContext, number: u64) -> Result<GithubPull> {
        let url = self.api.repo_url(&ctx.channel_id, &format!("/pulls/{}", number));
        self.api.fetch(ctx, &url).await
    }

    async fn reviews(&self, ctx: &SourceContext, number: u64) -> Result<Vec<GithubReview>> {
        let url = self
            .api
            .repo_url(&ctx.channel_id, &format!("/pulls/{}/reviews?per_page=100", number));
        self.api.fetch(ctx, &url).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubPull {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged_at: Option<String>,
    pub html_url: String,
    #[serde(default)]
    pub user: Option<GithubUser>,
    #[serde(default)]
    pub assignee: Option<GithubUser>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubReview {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub user: Option<GithubUser>,
    #[serde(default)]
    pub submitted_at: Option<String>,
}

impl GithubReview {
    fn note(&self) -> NewNote {
        // An approval without a comment still belongs in the thread.
        let content = match self.body.as_deref().map(str::trim) {
            Some(body) if !body.is_empty() => Some(body.to_string()),
            _ => review_verdict(&self.state).map(str::to_string),
        };
        NewNote::new(format!("review-{}", self.id), content)
            .by(self.user.as_ref().map(GithubUser::contact))
            .at(parse_time(self.submitted_at.as_deref()))
    }
}

fn review_verdict(state: &str) -> Option<&'static str> {
    match state.to_ascii_uppercase().as_str() {
        "APPROVED" => Some("Approved these changes"),
        "CHANGES_REQUESTED" => Some("Requested changes"),
        "DISMISSED" => Some("Review dismissed"),
        _ => None,
    }
}

fn pull_source(repo_id: &str, number: u64) -> String {
    format!("github:pull:{}:{}", repo_id, number)
}

fn pull_link(repo_id: &str, pull: &GithubPull) -> NewLinkWithNotes {
    let mut link = NewLinkWithNotes::new(pull_source(repo_id, pull.number), "pull_request", pull.title.clone());
    link.author = pull.user.as_ref().map(GithubUser::contact);
    link.assignee = pull.assignee.as_ref().map(GithubUser::contact);

    let (status, done) = if pull.merged_at.is_some() {
        (LinkStatus::Done, true)
    } else if pull.state == "closed" {
        (LinkStatus::Closed, false)
    } else if pull.draft {
        (LinkStatus::InProgress, false)
    } else {
        (LinkStatus::Open, false)
    };
    link.status = Some(status);
    link.done = Some(done);

    link.meta = LinkMeta::default()
        .with("repoId", repo_id)
        .with("number", pull.number);
    link.actions = vec![Action::open(pull.html_url.clone())];
    link.preview = preview(pull.body.as_deref(), 200);
    link.created = parse_time(pull.created_at.as_deref());
    link
}

fn description_note(pull: &GithubPull) -> NewNote {
    NewNote::description(pull.body.as_deref())
        .by(pull.user.as_ref().map(GithubUser::contact))
        .at(parse_time(pull.created_at.as_deref()))
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    pull_request: GithubPull,
    repository: RepositoryRef,
}

#[derive(Debug, Deserialize)]
struct PullRequestReviewEvent {
    action: String,
    review: GithubReview,
    pull_request: GithubPull,
    repository: RepositoryRef,
}

#[derive(Debug, Deserialize)]
struct CommentedIssue {
    number: u64,
    title: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IssueCommentEvent {
    action: String,
    issue: CommentedIssue,
    comment: GithubComment,
    repository: RepositoryRef,
}

#[async_trait]
impl SyncSource for GithubPullsSource {
    type Item = GithubPull;

    fn provider(&self) -> Provider {
        Provider::Github
    }

    fn name(&self) -> &str {
        NAME
    }

    fn lookback(&self) -> Option<Duration> {
        Some(Duration::days(self.lookback_days))
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        self.api.list_repos(ctx).await
    }

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<GithubPull>> {
        let page = state.cursor.page_number();
        let url = self.api.repo_url(
            &ctx.channel_id,
            &format!(
                "/pulls?state=all&sort=updated&direction=desc&per_page={}&page={}",
                ctx.page_size, page
            ),
        );
        let pulls: Vec<GithubPull> = self.api.fetch(ctx, &url).await?;
        let returned = pulls.len();

        // Open pulls are always kept; closed ones only inside the lookback window.
        let cutoff = state.time_min;
        let fresh: Vec<GithubPull> = pulls
            .into_iter()
            .filter(|pull| {
                let updated = parse_time(pull.updated_at.as_deref());
                match (cutoff, updated) {
                    (Some(cutoff), Some(updated)) => pull.state == "open" || updated >= cutoff,
                    _ => true,
                }
            })
            .collect();

        // A page of nothing but stale closed pulls means the rest of the history is stale too.
        let next = if returned > 0 && fresh.is_empty() {
            Continuation::done()
        } else {
            Continuation::by_page_size(returned, ctx.page_size, Cursor::Page(page + 1))
        };
        debug!(
            "github-pulls: repo {} page {} returned {} pulls ({} within window)",
            ctx.channel_id,
            page,
            returned,
            fresh.len()
        );
        Ok(Page::new(fresh, next))
    }

    async fn transform(&self, ctx: &SourceContext, pull: GithubPull) -> Result<Option<NewLinkWithNotes>> {
        let mut link = pull_link(&ctx.channel_id, &pull);
        link.notes.push(description_note(&pull));

        match self.reviews(ctx, pull.number).await {
            Ok(reviews) => link.notes.extend(
                reviews
                    .iter()
                    .filter(|review| !review.state.eq_ignore_ascii_case("PENDING"))
                    .map(GithubReview::note),
            ),
            Err(e) => warn!(
                "github-pulls: failed to fetch reviews for #{} in repo {}: {:#}",
                pull.number, ctx.channel_id, e
            ),
        }
        link.notes.extend(self.api.comment_notes(ctx, pull.number).await);
        Ok(Some(link))
    }

    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookRegistration> {
        self.api.create_hook(ctx, url, secret, EVENTS).await
    }

    async fn delete_webhook(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()> {
        self.api.delete_hook(ctx, registration).await
    }

    fn handshake(&self, request: &WebhookRequest) -> Option<Handshake> {
        github::ping_handshake(request).map(Handshake::reply)
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool {
        github::verify_signature(request, secret)
    }

    async fn route(&self, ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>> {
        let repo_matches = |repo: &RepositoryRef| repo.id.to_string() == ctx.channel_id;

        match github::event(request) {
            "pull_request" => {
                let event: PullRequestEvent = request.json().context("github: decoding pull_request event")?;
                if !repo_matches(&event.repository) {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                let pull = self.get_pull(ctx, event.pull_request.number).await?;
                let mut link = pull_link(&ctx.channel_id, &pull);
                if event.action == "opened" {
                    link.notes.push(description_note(&pull));
                }
                Ok(vec![WebhookAction::upsert(link)])
            }
            "pull_request_review" => {
                let event: PullRequestReviewEvent =
                    request.json().context("github: decoding pull_request_review event")?;
                if !repo_matches(&event.repository) || event.action != "submitted" {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                let mut link = pull_link(&ctx.channel_id, &event.pull_request);
                link.notes.push(event.review.note());
                Ok(vec![WebhookAction::upsert(link)])
            }
            "issue_comment" => {
                let event: IssueCommentEvent = request.json().context("github: decoding issue_comment event")?;
                if event.issue.pull_request.is_none() || event.action == "deleted" || !repo_matches(&event.repository)
                {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                // The issue payload lacks merge state; leave status to the stored thread.
                let mut link = NewLinkWithNotes::new(
                    pull_source(&ctx.channel_id, event.issue.number),
                    "pull_request",
                    event.issue.title,
                );
                link.meta = LinkMeta::default()
                    .with("repoId", ctx.channel_id.as_str())
                    .with("number", event.issue.number);
                link.notes.push(event.comment.note());
                Ok(vec![WebhookAction::upsert(link)])
            }
            other => {
                debug!("github-pulls: ignoring {} event", other);
                Ok(vec![WebhookAction::Ignore])
            }
        }
    }
}
