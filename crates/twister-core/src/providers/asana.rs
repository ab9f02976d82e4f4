//! Asana source: tasks of a project, with comment stories as notes.
//!
//! Asana hands out the webhook secret itself: the subscription request is
//! answered with an `X-Hook-Secret` handshake that must be echoed back.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{base_url, Continuation, Handshake, Page, SecretPolicy, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::model::{parse_time, preview, Action, Channel, LinkMeta, LinkStatus, NewContact, NewLinkWithNotes, NewNote};
use crate::state::{SyncState, WebhookRegistration};
use crate::webhook::{verify_hmac_sha256, WebhookRequest, WebhookResponse};

pub const NAME: &str = "asana";

const DEFAULT_API: &str = "https://app.asana.com/api/1.0";
const SECRET_HEADER: &str = "x-hook-secret";
const SIGNATURE_HEADER: &str = "x-hook-signature";
const MAX_LIMIT: u32 = 100;

const TASK_FIELDS: &str =
    "name,notes,completed,permalink_url,created_at,assignee.name,assignee.email,created_by.name,created_by.email";
const STORY_FIELDS: &str = "resource_subtype,text,created_at,created_by.name,created_by.email,target.gid";

pub struct AsanaSource {
    base: String,
}

impl AsanaSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base: base_url(config, DEFAULT_API),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, ctx: &SourceContext, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let envelope: Envelope<T> = ctx
            .json(path, || ctx.http.get(&url).header("Authorization", ctx.bearer()))
            .await?;
        Ok(envelope.data)
    }

    async fn get_task(&self, ctx: &SourceContext, gid: &str) -> Result<AsanaTask> {
        self.get(ctx, &format!("/tasks/{}?opt_fields={}", gid, TASK_FIELDS)).await
    }

    async fn comment_stories(&self, ctx: &SourceContext, task_gid: &str) -> Result<Vec<AsanaStory>> {
        let stories: Vec<AsanaStory> = self
            .get(ctx, &format!("/tasks/{}/stories?opt_fields={}", task_gid, STORY_FIELDS))
            .await?;
        Ok(stories.into_iter().filter(AsanaStory::is_comment).collect())
    }
}

fn contact(user: &AsanaUser) -> NewContact {
    let name = user.name.clone().unwrap_or_else(|| user.gid.clone());
    match &user.email {
        Some(email) => NewContact::new(email.clone(), Some(name)),
        None => NewContact::noreply("asana.com", &user.gid, &name),
    }
}

fn task_link(project_gid: &str, task: &AsanaTask) -> NewLinkWithNotes {
    let mut link = NewLinkWithNotes::new(format!("asana:task:{}", task.gid), "task", task.name.clone());
    link.author = task.created_by.as_ref().map(contact);
    link.assignee = task.assignee.as_ref().map(contact);
    link.status = Some(if task.completed { LinkStatus::Done } else { LinkStatus::Open });
    link.done = Some(task.completed);
    link.meta = LinkMeta::default()
        .with("projectGid", project_gid)
        .with("taskGid", task.gid.as_str());
    if let Some(url) = &task.permalink_url {
        link.actions = vec![Action::open(url.clone())];
    }
    link.preview = preview(task.notes.as_deref(), 200);
    link.created = parse_time(task.created_at.as_deref());
    link
}

fn description_note(task: &AsanaTask) -> NewNote {
    NewNote::description(task.notes.as_deref())
        .by(task.created_by.as_ref().map(contact))
        .at(parse_time(task.created_at.as_deref()))
}

#[async_trait]
impl SyncSource for AsanaSource {
    type Item = AsanaTask;

    fn provider(&self) -> Provider {
        Provider::Asana
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        let workspaces: Vec<AsanaNamed> = self.get(ctx, "/workspaces").await?;
        let mut channels = Vec::new();
        for workspace in workspaces {
            let projects: Vec<AsanaNamed> = self
                .get(ctx, &format!("/projects?workspace={}&archived=false&limit=100", workspace.gid))
                .await?;
            channels.extend(
                projects
                    .into_iter()
                    .map(|p| Channel::new(p.gid, p.name.unwrap_or_default())),
            );
        }
        Ok(channels)
    }

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<AsanaTask>> {
        let url = format!("{}/tasks", self.base);
        let mut query = vec![
            ("project", ctx.channel_id.clone()),
            ("limit", ctx.page_size.min(MAX_LIMIT).to_string()),
            ("opt_fields", TASK_FIELDS.to_string()),
        ];
        if let Some(offset) = state.cursor.token() {
            query.push(("offset", offset.to_string()));
        }
        // RFC 3339 carries a `+00:00` offset, which must be percent-encoded.
        if let Some(since) = state.time_min {
            query.push(("modified_since", since.to_rfc3339()));
        }

        let list: TaskList = ctx
            .json("task list", || {
                ctx.http
                    .get(&url)
                    .header("Authorization", ctx.bearer())
                    .query(&query)
            })
            .await?;
        let next = Continuation::by_token(list.next_page.map(|p| p.offset));
        debug!("asana: project {} returned {} tasks", ctx.channel_id, list.data.len());
        Ok(Page::new(list.data, next))
    }

    async fn transform(&self, ctx: &SourceContext, task: AsanaTask) -> Result<Option<NewLinkWithNotes>> {
        let mut link = task_link(&ctx.channel_id, &task);
        link.notes.push(description_note(&task));
        match self.comment_stories(ctx, &task.gid).await {
            Ok(stories) => link.notes.extend(stories.iter().map(AsanaStory::note)),
            Err(e) => warn!("asana: failed to fetch stories for task {}: {:#}", task.gid, e),
        }
        Ok(Some(link))
    }

    fn secret_policy(&self) -> SecretPolicy {
        SecretPolicy::Handshake
    }

    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        _secret: Option<&str>,
    ) -> Result<WebhookRegistration> {
        let endpoint = format!("{}/webhooks", self.base);
        let payload = json!({
            "data": {
                "resource": ctx.channel_id,
                "target": url,
                "filters": [
                    { "resource_type": "task" },
                    { "resource_type": "story", "action": "added" }
                ]
            }
        });
        let created: Envelope<AsanaNamed> = ctx
            .json("webhook", || {
                ctx.http
                    .post(&endpoint)
                    .header("Authorization", ctx.bearer())
                    .json(&payload)
            })
            .await?;
        let mut registration = WebhookRegistration::new(created.data.gid, url);
        registration.resource_id = Some(ctx.channel_id.clone());
        Ok(registration)
    }

    async fn delete_webhook(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()> {
        let endpoint = format!("{}/webhooks/{}", self.base, registration.webhook_id);
        ctx.send(|| ctx.http.delete(&endpoint).header("Authorization", ctx.bearer()))
            .await?;
        Ok(())
    }

    fn handshake(&self, request: &WebhookRequest) -> Option<Handshake> {
        let secret = request.header(SECRET_HEADER)?;
        Some(Handshake {
            response: WebhookResponse::ok().with_header("X-Hook-Secret", secret),
            secret: Some(secret.to_string()),
        })
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool {
        match request.header(SIGNATURE_HEADER) {
            Some(signature) => verify_hmac_sha256(secret, request.body.as_bytes(), signature, None),
            None => false,
        }
    }

    async fn route(&self, ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>> {
        let payload: EventsPayload = request.json().context("asana: decoding webhook events")?;
        if payload.events.is_empty() {
            // Heartbeat.
            return Ok(vec![WebhookAction::Ignore]);
        }

        let mut actions = Vec::new();
        let mut refreshed: HashSet<String> = HashSet::new();
        for event in payload.events {
            match (event.resource.resource_type.as_str(), event.action.as_str()) {
                ("task", "deleted") | ("task", "removed") => actions.push(WebhookAction::Ignore),
                ("task", _) => {
                    if !refreshed.insert(event.resource.gid.clone()) {
                        continue;
                    }
                    let task = self.get_task(ctx, &event.resource.gid).await?;
                    actions.push(WebhookAction::upsert(task_link(&ctx.channel_id, &task)));
                }
                ("story", "added") if event.resource.resource_subtype.as_deref() == Some("comment_added") => {
                    let story: AsanaStory = self
                        .get(ctx, &format!("/stories/{}?opt_fields={}", event.resource.gid, STORY_FIELDS))
                        .await?;
                    let Some(task_gid) = story.target.as_ref().map(|t| t.gid.clone()) else {
                        actions.push(WebhookAction::Ignore);
                        continue;
                    };
                    let task = self.get_task(ctx, &task_gid).await?;
                    let mut link = task_link(&ctx.channel_id, &task);
                    link.notes.push(story.note());
                    actions.push(WebhookAction::upsert(link));
                }
                (resource_type, action) => {
                    debug!("asana: ignoring {} {} event", resource_type, action);
                    actions.push(WebhookAction::Ignore);
                }
            }
        }
        Ok(actions)
    }
}

// --- Asana API Response Types ---

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TaskList {
    data: Vec<AsanaTask>,
    next_page: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    offset: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AsanaNamed {
    gid: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AsanaUser {
    gid: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AsanaTask {
    gid: String,
    name: String,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    permalink_url: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    assignee: Option<AsanaUser>,
    #[serde(default)]
    created_by: Option<AsanaUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct AsanaStory {
    gid: String,
    #[serde(default)]
    resource_subtype: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    created_by: Option<AsanaUser>,
    #[serde(default)]
    target: Option<AsanaNamed>,
}

impl AsanaStory {
    fn is_comment(&self) -> bool {
        self.resource_subtype.as_deref() == Some("comment_added")
    }

    fn note(&self) -> NewNote {
        NewNote::new(format!("story-{}", self.gid), self.text.clone())
            .by(self.created_by.as_ref().map(contact))
            .at(parse_time(self.created_at.as_deref()))
    }
}

#[derive(Debug, Deserialize)]
struct EventsPayload {
    #[serde(default)]
    events: Vec<AsanaEvent>,
}

#[derive(Debug, Deserialize)]
struct AsanaEvent {
    action: String,
    resource: EventResource,
}

#[derive(Debug, Deserialize)]
struct EventResource {
    gid: String,
    resource_type: String,
    #[serde(default)]
    resource_subtype: Option<String>,
}
