//! Linear source.
//!
//! Syncs a team's issues over the GraphQL API, comments included.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{base_url, Continuation, Page, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::error::SyncError;
use crate::model::{parse_time, preview, Action, Channel, LinkMeta, LinkStatus, NewContact, NewLinkWithNotes, NewNote};
use crate::state::{SyncState, WebhookRegistration};
use crate::webhook::{verify_hmac_sha256, WebhookRequest};

pub const NAME: &str = "linear";

const DEFAULT_API: &str = "https://api.linear.app";
const SIGNATURE_HEADER: &str = "linear-signature";

const ISSUE_FIELDS: &str = r#"
    id
    identifier
    title
    description
    url
    createdAt
    state { type }
    assignee { id name email }
    creator { id name email }
"#;

const COMMENT_FIELDS: &str = "id body createdAt user { id name email }";
const COMMENTS_PER_PAGE: u32 = 50;

pub struct LinearSource {
    base: String,
}

impl LinearSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base: base_url(config, DEFAULT_API),
        }
    }

    /// Run a GraphQL operation. GraphQL errors arrive with HTTP 200 and are
    /// surfaced as provider errors.
    async fn graphql<T: DeserializeOwned>(&self, ctx: &SourceContext, query: &str, variables: Value) -> Result<T> {
        let url = format!("{}/graphql", self.base);
        let payload = json!({ "query": query, "variables": variables });
        let body: LinearResponse<T> = ctx
            .json("graphql response", || {
                ctx.http
                    .post(&url)
                    .header("Authorization", ctx.bearer())
                    .json(&payload)
            })
            .await?;

        if let Some(error) = body.errors.and_then(|errors| errors.into_iter().next()) {
            return Err(SyncError::provider(NAME, None, error.message).into());
        }
        body.data
            .ok_or_else(|| SyncError::provider(NAME, None, "response missing data").into())
    }

    async fn get_issue(&self, ctx: &SourceContext, id: &str) -> Result<LinearIssue> {
        let query = format!("query Issue($id: String!) {{ issue(id: $id) {{ {} team {{ id }} }} }}", ISSUE_FIELDS);
        let data: IssueData = self.graphql(ctx, &query, json!({ "id": id })).await?;
        Ok(data.issue)
    }

    /// Comment pages after the one embedded in the issue listing.
    async fn remaining_comments(
        &self,
        ctx: &SourceContext,
        issue_id: &str,
        mut after: Option<String>,
    ) -> Result<Vec<LinearComment>> {
        let query = format!(
            r#"query IssueComments($id: String!, $first: Int!, $after: String) {{
                issue(id: $id) {{
                    comments(first: $first, after: $after) {{
                        nodes {{ {} }}
                        pageInfo {{ hasNextPage endCursor }}
                    }}
                }}
            }}"#,
            COMMENT_FIELDS
        );

        let mut comments = Vec::new();
        while let Some(cursor) = after.take() {
            let variables = json!({ "id": issue_id, "first": COMMENTS_PER_PAGE, "after": cursor });
            let data: IssueCommentsData = self.graphql(ctx, &query, variables).await?;
            let page = data.issue.comments;
            comments.extend(page.nodes);
            if page.page_info.has_next_page {
                after = page.page_info.end_cursor;
            }
        }
        Ok(comments)
    }
}

fn contact(user: &LinearUser) -> NewContact {
    match &user.email {
        Some(email) => NewContact::new(email.clone(), Some(user.name.clone())),
        None => NewContact::noreply("linear.app", &user.id, &user.name),
    }
}

fn status(state: Option<&LinearState>) -> (LinkStatus, bool) {
    match state.map(|s| s.state_type.as_str()) {
        Some("completed") => (LinkStatus::Done, true),
        Some("canceled") => (LinkStatus::Cancelled, true),
        Some("started") => (LinkStatus::InProgress, false),
        _ => (LinkStatus::Open, false),
    }
}

fn issue_link(team_id: &str, issue: &LinearIssue) -> NewLinkWithNotes {
    let mut link = NewLinkWithNotes::new(format!("linear:issue:{}", issue.id), "issue", issue.title.clone());
    link.author = issue.creator.as_ref().map(contact);
    link.assignee = issue.assignee.as_ref().map(contact);
    let (status, done) = status(issue.state.as_ref());
    link.status = Some(status);
    link.done = Some(done);
    link.meta = LinkMeta::default()
        .with("teamId", team_id)
        .with("identifier", issue.identifier.as_str());
    link.actions = vec![Action::open(issue.url.clone())];
    link.preview = preview(issue.description.as_deref(), 200);
    link.created = parse_time(issue.created_at.as_deref());
    link
}

fn description_note(issue: &LinearIssue) -> NewNote {
    NewNote::description(issue.description.as_deref())
        .by(issue.creator.as_ref().map(contact))
        .at(parse_time(issue.created_at.as_deref()))
}

impl LinearComment {
    fn note(&self) -> NewNote {
        NewNote::new(format!("comment-{}", self.id), self.body.clone())
            .by(self.user.as_ref().map(contact))
            .at(parse_time(self.created_at.as_deref()))
    }
}

#[async_trait]
impl SyncSource for LinearSource {
    type Item = LinearIssue;

    fn provider(&self) -> Provider {
        Provider::Linear
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        let data: TeamsData = self
            .graphql(ctx, "query { teams { nodes { id name } } }", json!({}))
            .await?;
        Ok(data
            .teams
            .nodes
            .into_iter()
            .map(|team| Channel::new(team.id, team.name))
            .collect())
    }

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<LinearIssue>> {
        let query = format!(
            r#"query TeamIssues($team: String!, $first: Int!, $after: String, $filter: IssueFilter) {{
                team(id: $team) {{
                    issues(first: $first, after: $after, filter: $filter) {{
                        nodes {{
                            {}
                            comments(first: {}) {{
                                nodes {{ {} }}
                                pageInfo {{ hasNextPage endCursor }}
                            }}
                        }}
                        pageInfo {{ hasNextPage endCursor }}
                    }}
                }}
            }}"#,
            ISSUE_FIELDS, COMMENTS_PER_PAGE, COMMENT_FIELDS
        );
        let filter = state
            .time_min
            .map(|since| json!({ "updatedAt": { "gte": since.to_rfc3339() } }));
        let variables = json!({
            "team": ctx.channel_id,
            "first": ctx.page_size,
            "after": state.cursor.token(),
            "filter": filter,
        });

        let data: TeamIssuesData = self.graphql(ctx, &query, variables).await?;
        let issues = data.team.issues;
        let next = Continuation::by_token(if issues.page_info.has_next_page {
            issues.page_info.end_cursor
        } else {
            None
        });
        debug!("linear: team {} returned {} issues", ctx.channel_id, issues.nodes.len());
        Ok(Page::new(issues.nodes, next))
    }

    async fn transform(&self, ctx: &SourceContext, issue: LinearIssue) -> Result<Option<NewLinkWithNotes>> {
        let mut link = issue_link(&ctx.channel_id, &issue);
        link.notes.push(description_note(&issue));
        if let Some(comments) = &issue.comments {
            link.notes.extend(comments.nodes.iter().map(LinearComment::note));
            if comments.page_info.has_next_page {
                let rest = self
                    .remaining_comments(ctx, &issue.id, comments.page_info.end_cursor.clone())
                    .await
                    .with_context(|| format!("linear: fetching comments for {}", issue.identifier))?;
                link.notes.extend(rest.iter().map(LinearComment::note));
            }
        }
        Ok(Some(link))
    }

    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookRegistration> {
        let mutation = r#"mutation CreateWebhook($input: WebhookCreateInput!) {
            webhookCreate(input: $input) { success webhook { id } }
        }"#;
        let variables = json!({
            "input": {
                "url": url,
                "teamId": ctx.channel_id,
                "resourceTypes": ["Issue", "Comment"],
                "secret": secret,
                "label": "Plot",
            }
        });
        let data: WebhookCreateData = self.graphql(ctx, mutation, variables).await?;
        match data.webhook_create.webhook {
            Some(webhook) if data.webhook_create.success => Ok(WebhookRegistration::new(webhook.id, url)),
            _ => Err(SyncError::provider(NAME, None, "webhookCreate was not successful").into()),
        }
    }

    async fn delete_webhook(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()> {
        let mutation = "mutation DeleteWebhook($id: String!) { webhookDelete(id: $id) { success } }";
        let _: Value = self
            .graphql(ctx, mutation, json!({ "id": registration.webhook_id }))
            .await?;
        Ok(())
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool {
        match request.header(SIGNATURE_HEADER) {
            Some(signature) => verify_hmac_sha256(secret, request.body.as_bytes(), signature, None),
            None => false,
        }
    }

    async fn route(&self, ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>> {
        let event: LinearWebhook = request.json().context("linear: decoding webhook payload")?;
        if event.action == "remove" {
            return Ok(vec![WebhookAction::Ignore]);
        }

        match event.resource_type.as_str() {
            "Issue" => {
                let id = event.data["id"].as_str().unwrap_or_default();
                if id.is_empty() {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                let issue = self.get_issue(ctx, id).await?;
                if !issue.belongs_to(&ctx.channel_id) {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                let mut link = issue_link(&ctx.channel_id, &issue);
                if event.action == "create" {
                    link.notes.push(description_note(&issue));
                }
                Ok(vec![WebhookAction::upsert(link)])
            }
            "Comment" => {
                let comment: CommentPayload =
                    serde_json::from_value(event.data).context("linear: decoding comment payload")?;
                let issue = self.get_issue(ctx, &comment.issue_id).await?;
                if !issue.belongs_to(&ctx.channel_id) {
                    return Ok(vec![WebhookAction::Ignore]);
                }
                let mut link = issue_link(&ctx.channel_id, &issue);
                link.notes.push(comment.comment.note());
                Ok(vec![WebhookAction::upsert(link)])
            }
            other => {
                debug!("linear: ignoring {} webhook", other);
                Ok(vec![WebhookAction::Ignore])
            }
        }
    }
}

// --- Linear API Response Types ---

#[derive(Debug, Deserialize)]
struct LinearResponse<T> {
    data: Option<T>,
    errors: Option<Vec<LinearError>>,
}

#[derive(Debug, Deserialize)]
struct LinearError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TeamsData {
    teams: Connection<LinearTeam>,
}

#[derive(Debug, Deserialize)]
struct TeamIssuesData {
    team: TeamIssues,
}

#[derive(Debug, Deserialize)]
struct TeamIssues {
    issues: PagedConnection<LinearIssue>,
}

#[derive(Debug, Deserialize)]
struct IssueCommentsData {
    issue: IssueComments,
}

#[derive(Debug, Deserialize)]
struct IssueComments {
    comments: PagedConnection<LinearComment>,
}

#[derive(Debug, Deserialize)]
struct IssueData {
    issue: LinearIssue,
}

#[derive(Debug, Deserialize)]
struct WebhookCreateData {
    #[serde(rename = "webhookCreate")]
    webhook_create: WebhookCreatePayload,
}

#[derive(Debug, Deserialize)]
struct WebhookCreatePayload {
    success: bool,
    webhook: Option<LinearWebhookRef>,
}

#[derive(Debug, Deserialize)]
struct LinearWebhookRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct PagedConnection<T> {
    nodes: Vec<T>,
    #[serde(rename = "pageInfo", default)]
    page_info: LinearPageInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LinearPageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearIssue {
    id: String,
    identifier: String,
    title: String,
    description: Option<String>,
    url: String,
    #[serde(rename = "createdAt")]
    created_at: Option<String>,
    state: Option<LinearState>,
    assignee: Option<LinearUser>,
    creator: Option<LinearUser>,
    #[serde(default)]
    team: Option<LinearTeamRef>,
    #[serde(default)]
    comments: Option<PagedConnection<LinearComment>>,
}

impl LinearIssue {
    /// Issues fetched without their team are assumed to belong to the channel.
    fn belongs_to(&self, team_id: &str) -> bool {
        self.team.as_ref().map(|t| t.id == team_id).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LinearState {
    #[serde(rename = "type")]
    state_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LinearUser {
    id: String,
    name: String,
    email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LinearTeam {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LinearTeamRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LinearComment {
    id: String,
    body: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: Option<String>,
    #[serde(default)]
    user: Option<LinearUser>,
}

#[derive(Debug, Deserialize)]
struct LinearWebhook {
    action: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    #[serde(rename = "issueId")]
    issue_id: String,
    #[serde(flatten)]
    comment: LinearComment,
}
