//! GitHub Issues source.
//!
//! A full scan walks open issues first, then issues closed within the
//! lookback window. Pull requests come back from the issues endpoint too and
//! are filtered out here; `github-pulls` owns them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, SecondsFormat};
use serde::Deserialize;
use tracing::debug;

use super::github::{self, GithubApi, GithubComment, GithubUser, RepositoryRef};
use super::{Continuation, Handshake, Page, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::model::{preview, Action, Channel, LinkMeta, LinkStatus, NewLinkWithNotes, NewNote};
use crate::state::{Cursor, SyncState, WebhookRegistration};
use crate::webhook::WebhookRequest;

pub const NAME: &str = "github-issues";

const PHASE_OPEN: &str = "open";
const PHASE_RECENTLY_CLOSED: &str = "recently_closed";
const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const EVENTS: &[&str] = &["issues", "issue_comment"];

pub struct GithubIssuesSource {
    api: GithubApi,
    lookback_days: i64,
}

impl GithubIssuesSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            api: GithubApi::new(config),
            lookback_days: config.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
        }
    }

    async fn get_issue(&self, ctx: &SourceContext, number: u64) -> Result<GithubIssue> {
        let url = self.api.repo_url(&ctx.channel_id, &format!("/issues/{}", number));
        self.api.fetch(ctx, &url).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub state_reason: Option<String>,
    pub html_url: String,
    #[serde(default)]
    pub user: Option<GithubUser>,
    #[serde(default)]
    pub assignee: Option<GithubUser>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl GithubIssue {
    fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

/// Thread fields only; callers decide which notes to attach.
fn issue_link(repo_id: &str, issue: &GithubIssue) -> NewLinkWithNotes {
    let mut link = NewLinkWithNotes::new(
        format!("github:issue:{}:{}", repo_id, issue.number),
        "issue",
        issue.title.clone(),
    );
    link.author = issue.user.as_ref().map(GithubUser::contact);
    link.assignee = issue.assignee.as_ref().map(GithubUser::contact);

    let (status, done) = match (issue.state.as_str(), issue.state_reason.as_deref()) {
        ("closed", Some("not_planned")) => (LinkStatus::Cancelled, true),
        ("closed", _) => (LinkStatus::Done, true),
        _ => (LinkStatus::Open, false),
    };
    link.status = Some(status);
    link.done = Some(done);

    link.meta = LinkMeta::default()
        .with("repoId", repo_id)
        .with("number", issue.number);
    link.actions = vec![Action::open(issue.html_url.clone())];
    link.preview = preview(issue.body.as_deref(), 200);
    link.created = crate::model::parse_time(issue.created_at.as_deref());
    link
}

fn description_note(issue: &GithubIssue) -> NewNote {
    NewNote::description(issue.body.as_deref())
        .by(issue.user.as_ref().map(GithubUser::contact))
        .at(crate::model::parse_time(issue.created_at.as_deref()))
}

#[derive(Debug, Deserialize)]
struct IssuesEvent {
    action: String,
    issue: GithubIssue,
    repository: RepositoryRef,
}

#[derive(Debug, Deserialize)]
struct IssueCommentEvent {
    action: String,
    issue: GithubIssue,
    comment: GithubComment,
    repository: RepositoryRef,
}

#[async_trait]
impl SyncSource for GithubIssuesSource {
    type Item = GithubIssue;

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

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<GithubIssue>> {
        let page = state.cursor.page_number();
        let closed_phase = state.phase_is(PHASE_RECENTLY_CLOSED);

        let mut path = format!(
            "/issues?state={}&per_page={}&page={}&sort=updated&direction=desc",
            if closed_phase { "closed" } else { "open" },
            ctx.page_size,
            page
        );
        if closed_phase {
            if let Some(since) = state.time_min {
                path.push_str(&format!("&since={}", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }
        }

        let url = self.api.repo_url(&ctx.channel_id, &path);
        let issues: Vec<GithubIssue> = self.api.fetch(ctx, &url).await?;

        // Page size is judged on the raw response; PRs are dropped later in `transform`.
        let next = Continuation::by_page_size(issues.len(), ctx.page_size, Cursor::Page(page + 1));
        let next = if closed_phase { next } else { next.or_phase(PHASE_RECENTLY_CLOSED) };
        debug!(
            "github-issues: repo {} phase {} page {} returned {} issues",
            ctx.channel_id,
            state.phase.as_deref().unwrap_or(PHASE_OPEN),
            page,
            issues.len()
        );
        Ok(Page::new(issues, next))
    }

    async fn transform(&self, ctx: &SourceContext, issue: GithubIssue) -> Result<Option<NewLinkWithNotes>> {
        if issue.is_pull_request() {
            return Ok(None);
        }
        let mut link = issue_link(&ctx.channel_id, &issue);
        link.notes.push(description_note(&issue));
        link.notes.extend(self.api.comment_notes(ctx, issue.number).await);
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
        match github::event(request) {
            "issues" => {
                let event: IssuesEvent = request.json().context("github: decoding issues event")?;
                if event.issue.is_pull_request() || event.repository.id.to_string() != ctx.channel_id {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                // Payload fields can be stale by the time we see them.
                let issue = self.get_issue(ctx, event.issue.number).await?;
                let mut link = issue_link(&ctx.channel_id, &issue);
                if event.action == "opened" {
                    link.notes.push(description_note(&issue));
                }
                Ok(vec![WebhookAction::upsert(link)])
            }
            "issue_comment" => {
                let event: IssueCommentEvent = request.json().context("github: decoding issue_comment event")?;
                if event.issue.is_pull_request()
                    || event.action == "deleted"
                    || event.repository.id.to_string() != ctx.channel_id
                {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                let mut link = issue_link(&ctx.channel_id, &event.issue);
                link.notes.push(event.comment.note());
                Ok(vec![WebhookAction::upsert(link)])
            }
            other => {
                debug!("github-issues: ignoring {} event", other);
                Ok(vec![WebhookAction::Ignore])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::providers::SyncSettings;
    use crate::state::SyncOptions;
    use mockito::Matcher;
    use serde_json::json;

    fn source(server: &mockito::Server) -> GithubIssuesSource {
        GithubIssuesSource::new(&SourceConfig {
            api_base_url: Some(server.url()),
            ..Default::default()
        })
    }

    fn context(page_size: u32) -> SourceContext {
        let settings = SyncSettings {
            page_size,
            max_http_retries: 1,
            ..Default::default()
        };
        SourceContext::new(
            "1296269",
            AuthToken::new(Provider::Github, "gho_test"),
            reqwest::Client::new(),
            &settings,
        )
    }

    fn issue_json(number: u64, state: &str) -> serde_json::Value {
        json!({
            "number": number,
            "title": format!("Issue {}", number),
            "body": "It breaks",
            "state": state,
            "html_url": format!("https://github.com/octocat/Hello-World/issues/{}", number),
            "user": { "id": 1, "login": "octocat" },
            "created_at": "2024-01-10T09:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_short_open_page_moves_to_closed_phase() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repositories/1296269/issues")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("state".into(), "open".into()),
                Matcher::UrlEncoded("page".into(), "1".into()),
            ]))
            .with_body(json!([issue_json(1, "open"), issue_json(2, "open")]).to_string())
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::initial());
        let page = source(&server).fetch_page(&context(10), &state).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(
            page.next,
            Continuation::Phase {
                phase: PHASE_RECENTLY_CLOSED.to_string(),
                cursor: Cursor::Start
            }
        );
    }

    #[tokio::test]
    async fn test_full_page_continues_and_closed_phase_ends() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repositories/1296269/issues")
            .match_query(Matcher::UrlEncoded("state".into(), "open".into()))
            .with_body(json!([issue_json(1, "open"), issue_json(2, "open")]).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/repositories/1296269/issues")
            .match_query(Matcher::UrlEncoded("state".into(), "closed".into()))
            .with_body(json!([issue_json(3, "closed")]).to_string())
            .create_async()
            .await;

        let source = source(&server);
        let mut state = SyncState::new(&SyncOptions::initial());
        let page = source.fetch_page(&context(2), &state).await.unwrap();
        assert_eq!(page.next, Continuation::More(Cursor::Page(2)));

        state.phase = Some(PHASE_RECENTLY_CLOSED.to_string());
        let page = source.fetch_page(&context(2), &state).await.unwrap();
        assert_eq!(page.next, Continuation::done());
    }

    #[tokio::test]
    async fn test_transform_skips_pull_requests() {
        let server = mockito::Server::new_async().await;
        let mut pr: GithubIssue = serde_json::from_value(issue_json(5, "open")).unwrap();
        pr.pull_request = Some(json!({ "url": "https://api.github.com/repos/octocat/Hello-World/pulls/5" }));
        let link = source(&server).transform(&context(10), pr).await.unwrap();
        assert!(link.is_none());
    }

    #[tokio::test]
    async fn test_transform_keeps_issue_when_comments_fail() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repositories/1296269/issues/7/comments")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let issue: GithubIssue = serde_json::from_value(issue_json(7, "open")).unwrap();
        let link = source(&server)
            .transform(&context(10), issue)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.source, "github:issue:1296269:7");
        assert_eq!(link.notes.len(), 1);
        assert_eq!(link.notes[0].key, "description");
    }

    #[tokio::test]
    async fn test_transform_includes_comments_and_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repositories/1296269/issues/8/comments")
            .match_query(Matcher::Any)
            .with_body(
                json!([
                    { "id": 11, "body": "+1", "user": { "id": 2, "login": "hubot" } },
                    { "id": 12, "body": "fixed in main", "user": { "id": 1, "login": "octocat" } }
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let mut issue: GithubIssue = serde_json::from_value(issue_json(8, "closed")).unwrap();
        issue.state_reason = Some("not_planned".to_string());
        let link = source(&server)
            .transform(&context(10), issue)
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<&str> = link.notes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["description", "comment-11", "comment-12"]);
        assert_eq!(link.status, Some(LinkStatus::Cancelled));
        assert_eq!(link.done, Some(true));
    }

    #[test]
    fn test_source_is_stable_across_title_changes() {
        let mut issue: GithubIssue = serde_json::from_value(issue_json(9, "open")).unwrap();
        let before = issue_link("1296269", &issue).source;
        issue.title = "Renamed".to_string();
        issue.html_url = "https://github.com/octocat/renamed/issues/9".to_string();
        assert_eq!(issue_link("1296269", &issue).source, before);
    }

    #[tokio::test]
    async fn test_route_comment_upserts_single_note() {
        let server = mockito::Server::new_async().await;
        let body = json!({
            "action": "created",
            "issue": issue_json(3, "open"),
            "comment": { "id": 99, "body": "Me too", "user": { "id": 2, "login": "hubot" } },
            "repository": { "id": 1296269 }
        })
        .to_string();
        let request = WebhookRequest::post(body).with_header("X-GitHub-Event", "issue_comment");

        let actions = source(&server).route(&context(10), &request).await.unwrap();
        match actions.as_slice() {
            [WebhookAction::Upsert(link)] => {
                assert_eq!(link.notes.len(), 1);
                assert_eq!(link.notes[0].key, "comment-99");
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_issue_event_refetches_metadata() {
        let mut server = mockito::Server::new_async().await;
        let fetched = server
            .mock("GET", "/repositories/1296269/issues/3")
            .with_body(issue_json(3, "closed").to_string())
            .create_async()
            .await;
        let body = json!({
            "action": "closed",
            "issue": issue_json(3, "open"),
            "repository": { "id": 1296269 }
        })
        .to_string();
        let request = WebhookRequest::post(body).with_header("X-GitHub-Event", "issues");

        let actions = source(&server).route(&context(10), &request).await.unwrap();
        fetched.assert_async().await;
        match actions.as_slice() {
            [WebhookAction::Upsert(link)] => {
                assert!(link.is_metadata_only());
                assert_eq!(link.status, Some(LinkStatus::Done));
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }
}
