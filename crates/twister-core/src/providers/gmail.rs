//! Gmail source: threads under a label, one note per message.
//!
//! Full scans list threads; incremental runs replay the History API from the
//! `historyId` stored at the end of the previous run. Push notifications come
//! through a Pub/Sub watch that expires after seven days.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{base_url, Continuation, Page, SecretPolicy, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::error::{sync_error, SyncError};
use crate::model::{preview, Action, Channel, LinkMeta, NewContact, NewLinkWithNotes, NewNote};
use crate::state::{SyncState, WebhookRegistration};
use crate::webhook::{constant_time_eq, WebhookRequest};

pub const NAME: &str = "gmail";

const DEFAULT_API: &str = "https://gmail.googleapis.com/gmail/v1";
const TOKEN_PARAM: &str = "token";
const MAX_RESULTS: u32 = 100;

pub struct GmailSource {
    base: String,
    push_token: Option<String>,
}

impl GmailSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base: base_url(config, DEFAULT_API),
            push_token: config.signing_secret.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me{}", self.base, path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, ctx: &SourceContext, path: &str) -> Result<T> {
        let url = self.url(path);
        ctx.json(path, || ctx.http.get(&url).header("Authorization", ctx.bearer()))
            .await
    }

    /// Full scan of the label. The mailbox's `historyId` is read before the
    /// first page and carried in the cursor as `<historyId>:<pageToken>`, so
    /// mail arriving mid-scan is replayed by the next incremental run.
    async fn list_threads(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<String>> {
        let (history_id, page_token) = match state.cursor.token() {
            Some(token) => match token.split_once(':') {
                Some((history_id, page_token)) => (history_id.to_string(), Some(page_token.to_string())),
                None => (self.history_id(ctx).await?, Some(token.to_string())),
            },
            None => (self.history_id(ctx).await?, None),
        };

        let mut path = format!(
            "/threads?labelIds={}&maxResults={}",
            ctx.channel_id,
            ctx.page_size.min(MAX_RESULTS)
        );
        if let Some(token) = page_token {
            path.push_str(&format!("&pageToken={}", token));
        }
        if let Some(since) = state.time_min {
            path.push_str(&format!("&q=after:{}", since.timestamp()));
        }

        let list: ThreadList = self.get(ctx, &path).await?;
        let ids: Vec<String> = list.threads.into_iter().map(|t| t.id).collect();

        let next = match list.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => Continuation::by_token(Some(format!("{}:{}", history_id, token))),
            None => Continuation::Done {
                change_token: Some(history_id),
            },
        };
        Ok(Page::new(ids, next))
    }

    async fn history_id(&self, ctx: &SourceContext) -> Result<String> {
        let profile: Profile = self.get(ctx, "/profile").await?;
        Ok(profile.history_id)
    }

    async fn list_history(&self, ctx: &SourceContext, state: &SyncState, start: &str) -> Result<Page<String>> {
        let mut path = format!(
            "/history?startHistoryId={}&labelId={}&historyTypes=messageAdded&maxResults={}",
            start,
            ctx.channel_id,
            ctx.page_size.min(MAX_RESULTS)
        );
        if let Some(token) = state.cursor.token() {
            path.push_str(&format!("&pageToken={}", token));
        }

        let list: HistoryList = match self.get(ctx, &path).await {
            Ok(list) => list,
            // Gmail keeps roughly a week of history; older ids 404.
            Err(e) if sync_error(&e).and_then(SyncError::status) == Some(404) => {
                return Err(SyncError::ChangeTokenExpired {
                    provider: NAME.to_string(),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        let mut seen = HashSet::new();
        let ids: Vec<String> = list
            .history
            .iter()
            .flat_map(|h| h.messages_added.iter())
            .map(|added| added.message.thread_id.clone())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let next = match list.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => Continuation::by_token(Some(token)),
            None => Continuation::Done {
                change_token: list.history_id.or_else(|| Some(start.to_string())),
            },
        };
        Ok(Page::new(ids, next))
    }

    async fn watch(&self, ctx: &SourceContext, topic: &str) -> Result<WebhookRegistration> {
        let url = self.url("/watch");
        let payload = json!({
            "topicName": topic,
            "labelIds": [ctx.channel_id],
            "labelFilterBehavior": "include",
        });
        let watch: WatchResponse = ctx
            .json("watch", || {
                ctx.http
                    .post(&url)
                    .header("Authorization", ctx.bearer())
                    .json(&payload)
            })
            .await?;

        let mut registration = WebhookRegistration::new(watch.history_id, topic);
        registration.expires_at = watch.expiration.as_deref().and_then(millis_to_datetime);
        registration.resource_id = Some(ctx.channel_id.clone());
        Ok(registration)
    }
}

fn millis_to_datetime(millis: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = millis.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Split `"Alice Example" <alice@example.com>` into a contact.
fn parse_address(value: &str) -> NewContact {
    let value = value.trim();
    match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let email = value[open + 1..close].trim().to_string();
            let name = value[..open].trim().trim_matches('"').trim();
            NewContact::new(email, (!name.is_empty()).then(|| name.to_string()))
        }
        _ => NewContact::new(value.to_string(), None),
    }
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
    String::from_utf8(bytes).ok()
}

impl MessagePart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// First `text/plain` body, depth first.
    fn plain_text(&self) -> Option<String> {
        if self.mime_type.as_deref() == Some("text/plain") {
            if let Some(text) = self.body.as_ref().and_then(|b| b.data.as_deref()).and_then(decode_body) {
                return Some(text);
            }
        }
        self.parts.iter().find_map(MessagePart::plain_text)
    }
}

impl GmailMessage {
    fn note(&self) -> NewNote {
        let content = self
            .payload
            .as_ref()
            .and_then(MessagePart::plain_text)
            .or_else(|| self.snippet.clone());
        let author = self.payload.as_ref().and_then(|p| p.header("From")).map(parse_address);
        let created = self.internal_date.as_deref().and_then(millis_to_datetime);
        NewNote::new(self.id.clone(), content).by(author).at(created)
    }
}

fn thread_link(label_id: &str, thread: &GmailThread) -> Option<NewLinkWithNotes> {
    let first = thread.messages.first()?;
    let subject = first
        .payload
        .as_ref()
        .and_then(|p| p.header("Subject"))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("(no subject)");

    let mut link = NewLinkWithNotes::new(format!("gmail:thread:{}", thread.id), "email", subject);
    link.author = first.payload.as_ref().and_then(|p| p.header("From")).map(parse_address);
    link.meta = LinkMeta::default()
        .with("threadId", thread.id.as_str())
        .with("labelId", label_id);
    link.actions = vec![Action::open(format!("https://mail.google.com/mail/u/0/#all/{}", thread.id))];
    link.preview = thread
        .messages
        .last()
        .and_then(|m| m.snippet.as_deref())
        .and_then(|s| preview(Some(s), 200));
    link.created = first.internal_date.as_deref().and_then(millis_to_datetime);
    link.notes = thread.messages.iter().map(GmailMessage::note).collect();
    Some(link)
}

#[async_trait]
impl SyncSource for GmailSource {
    /// Thread id; the thread itself is fetched in `transform`.
    type Item = String;

    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn name(&self) -> &str {
        NAME
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        let labels: LabelList = self.get(ctx, "/labels").await?;
        Ok(labels
            .labels
            .into_iter()
            .map(|label| Channel::new(label.id, label.name))
            .collect())
    }

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<String>> {
        match (&state.change_token, state.initial_sync) {
            (Some(start), false) => self.list_history(ctx, state, start).await,
            _ => self.list_threads(ctx, state).await,
        }
    }

    async fn transform(&self, ctx: &SourceContext, thread_id: String) -> Result<Option<NewLinkWithNotes>> {
        let thread: GmailThread = self
            .get(ctx, &format!("/threads/{}?format=full", thread_id))
            .await
            .with_context(|| format!("gmail: fetching thread {}", thread_id))?;
        Ok(thread_link(&ctx.channel_id, &thread))
    }

    fn secret_policy(&self) -> SecretPolicy {
        match &self.push_token {
            Some(token) => SecretPolicy::Static(token.clone()),
            None => SecretPolicy::Generated,
        }
    }

    /// Pushes carry the token configured on the Pub/Sub push subscription, which
    /// the watch call cannot set. Without a configured token no push could verify.
    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        _secret: Option<&str>,
    ) -> Result<WebhookRegistration> {
        if self.push_token.is_none() {
            bail!("gmail: push notifications need a signing secret matching the push subscription's token");
        }
        self.watch(ctx, url).await
    }

    async fn delete_webhook(&self, ctx: &SourceContext, _registration: &WebhookRegistration) -> Result<()> {
        let url = self.url("/stop");
        ctx.send(|| ctx.http.post(&url).header("Authorization", ctx.bearer()))
            .await?;
        Ok(())
    }

    /// Calling `watch` again extends the existing subscription.
    async fn renew_webhook(
        &self,
        ctx: &SourceContext,
        registration: &WebhookRegistration,
        _secret: Option<&str>,
    ) -> Result<Option<WebhookRegistration>> {
        self.watch(ctx, &registration.url).await.map(Some)
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool {
        request
            .query
            .get(TOKEN_PARAM)
            .map(|token| constant_time_eq(token, secret))
            .unwrap_or(false)
    }

    async fn route(&self, _ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>> {
        // The notification only carries the mailbox's newest historyId; the
        // History API replay picks up what changed.
        if let Ok(push) = request.json::<PushEnvelope>() {
            if let Some(notification) = STANDARD
                .decode(&push.message.data)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<PushNotification>(&bytes).ok())
            {
                debug!(
                    "gmail: push for {} at history {}",
                    notification.email_address, notification.history_id
                );
            }
        }
        Ok(vec![WebhookAction::IncrementalSync])
    }
}

// --- Gmail API Response Types ---

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryList {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    id: String,
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    headers: Vec<MessageHeader>,
    #[serde(default)]
    body: Option<MessageBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    history_id: String,
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushNotification {
    email_address: String,
    history_id: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::auth::AuthToken;
    use crate::engine::{IngestOutcome, SyncEngine};
    use crate::host::memory::MemoryHost;
    use crate::host::Host;
    use crate::providers::SyncSettings;
    use crate::state::{Cursor, SyncOptions};
    use mockito::Matcher;

    const PUSH_TOKEN: &str = "push-secret";

    fn source(server: &mockito::Server) -> GmailSource {
        GmailSource::new(&SourceConfig {
            api_base_url: Some(server.url()),
            signing_secret: Some(PUSH_TOKEN.to_string()),
            ..Default::default()
        })
    }

    fn context() -> SourceContext {
        let settings = SyncSettings {
            page_size: 2,
            max_http_retries: 1,
            ..Default::default()
        };
        SourceContext::new(
            "INBOX",
            AuthToken::new(Provider::Google, "ya29.test"),
            reqwest::Client::new(),
            &settings,
        )
    }

    fn encoded(text: &str) -> String {
        URL_SAFE_NO_PAD.encode(text)
    }

    #[test]
    fn test_parse_address() {
        let contact = parse_address("\"Alice Example\" <alice@example.com>");
        assert_eq!(contact.email, "alice@example.com");
        assert_eq!(contact.name.as_deref(), Some("Alice Example"));

        let contact = parse_address("bob@example.com");
        assert_eq!(contact.email, "bob@example.com");
        assert!(contact.name.is_none());
    }

    #[tokio::test]
    async fn test_transform_builds_note_per_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me/threads/t1")
            .match_query(Matcher::Any)
            .with_body(
                json!({
                    "id": "t1",
                    "messages": [
                        {
                            "id": "m1",
                            "snippet": "Hi team",
                            "internalDate": "1705312800000",
                            "payload": {
                                "mimeType": "multipart/alternative",
                                "headers": [
                                    { "name": "Subject", "value": "Quarterly plan" },
                                    { "name": "From", "value": "Alice <alice@example.com>" }
                                ],
                                "parts": [
                                    { "mimeType": "text/html", "body": { "data": encoded("<p>Hi team</p>") } },
                                    { "mimeType": "text/plain", "body": { "data": encoded("Hi team, plan attached.") } }
                                ]
                            }
                        },
                        {
                            "id": "m2",
                            "snippet": "Thanks!",
                            "payload": {
                                "mimeType": "text/plain",
                                "headers": [{ "name": "From", "value": "bob@example.com" }],
                                "body": { "data": encoded("Thanks!") }
                            }
                        }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let link = source(&server)
            .transform(&context(), "t1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.source, "gmail:thread:t1");
        assert_eq!(link.title.as_deref(), Some("Quarterly plan"));
        assert_eq!(link.notes.len(), 2);
        assert_eq!(link.notes[0].key, "m1");
        assert_eq!(link.notes[0].content.as_deref(), Some("Hi team, plan attached."));
        assert_eq!(link.notes[1].author.as_ref().map(|a| a.email.as_str()), Some("bob@example.com"));
        assert!(link.created.is_some());
    }

    #[tokio::test]
    async fn test_last_thread_page_records_history_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me/threads")
            .match_query(Matcher::UrlEncoded("labelIds".into(), "INBOX".into()))
            .with_body(json!({ "threads": [{ "id": "t1" }, { "id": "t2" }] }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/profile")
            .with_body(json!({ "emailAddress": "me@example.com", "historyId": "9001" }).to_string())
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::initial());
        let page = source(&server).fetch_page(&context(), &state).await.unwrap();
        assert_eq!(page.items, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(
            page.next,
            Continuation::Done {
                change_token: Some("9001".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_history_dedupes_threads() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me/history")
            .match_query(Matcher::UrlEncoded("startHistoryId".into(), "9001".into()))
            .with_body(
                json!({
                    "history": [
                        { "messagesAdded": [{ "message": { "id": "m3", "threadId": "t1" } }] },
                        { "messagesAdded": [{ "message": { "id": "m4", "threadId": "t1" } }] },
                        { "messagesAdded": [{ "message": { "id": "m5", "threadId": "t9" } }] }
                    ],
                    "historyId": "9050"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::incremental(Some("9001".to_string())));
        let page = source(&server).fetch_page(&context(), &state).await.unwrap();
        assert_eq!(page.items, vec!["t1".to_string(), "t9".to_string()]);
        assert_eq!(
            page.next,
            Continuation::Done {
                change_token: Some("9050".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_stale_history_id_expires_change_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/me/history")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let mut state = SyncState::new(&SyncOptions::incremental(Some("1".to_string())));
        state.cursor = Cursor::Start;
        let err = source(&server).fetch_page(&context(), &state).await.unwrap_err();
        assert!(matches!(sync_error(&err), Some(SyncError::ChangeTokenExpired { .. })));
    }

    #[tokio::test]
    async fn test_watch_sets_expiry() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/users/me/watch")
            .match_body(Matcher::PartialJson(json!({ "labelIds": ["INBOX"] })))
            .with_body(json!({ "historyId": "9001", "expiration": "1705917600000" }).to_string())
            .create_async()
            .await;

        let registration = source(&server)
            .create_webhook(&context(), "projects/plot/topics/gmail", None)
            .await
            .unwrap();
        assert_eq!(registration.url, "projects/plot/topics/gmail");
        assert_eq!(
            registration.expires_at,
            Some(Utc.timestamp_millis_opt(1705917600000).unwrap())
        );
    }

    #[tokio::test]
    async fn test_scan_keeps_history_id_from_before_first_page() {
        let mut server = mockito::Server::new_async().await;
        let profile = server
            .mock("GET", "/users/me/profile")
            .with_body(json!({ "emailAddress": "me@example.com", "historyId": "9001" }).to_string())
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/threads")
            .match_query(Matcher::Regex("^labelIds=INBOX&maxResults=2$".into()))
            .with_body(json!({ "threads": [{ "id": "t1" }, { "id": "t2" }], "nextPageToken": "p2" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/threads")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_body(json!({ "threads": [{ "id": "t3" }] }).to_string())
            .create_async()
            .await;

        let gmail = source(&server);
        let mut state = SyncState::new(&SyncOptions::initial());
        let first = gmail.fetch_page(&context(), &state).await.unwrap();
        assert_eq!(first.next, Continuation::More(Cursor::Token("9001:p2".to_string())));

        state.cursor = Cursor::Token("9001:p2".to_string());
        let last = gmail.fetch_page(&context(), &state).await.unwrap();
        assert_eq!(last.items, vec!["t3".to_string()]);
        assert_eq!(
            last.next,
            Continuation::Done {
                change_token: Some("9001".to_string())
            }
        );
        profile.assert_async().await;
    }

    #[tokio::test]
    async fn test_watch_without_push_token_is_refused() {
        let server = mockito::Server::new_async().await;
        let gmail = GmailSource::new(&SourceConfig {
            api_base_url: Some(server.url()),
            ..Default::default()
        });
        let err = gmail
            .create_webhook(&context(), "projects/plot/topics/gmail", Some("generated"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("signing secret"), "{}", err);
    }

    #[tokio::test]
    async fn test_watched_label_push_verifies_and_replays_history() {
        let mut server = mockito::Server::new_async().await;
        let watch = server
            .mock("POST", "/users/me/watch")
            .with_body(json!({ "historyId": "9001", "expiration": "4102444800000" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/profile")
            .with_body(json!({ "emailAddress": "me@example.com", "historyId": "9001" }).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/users/me/threads")
            .match_query(Matcher::Any)
            .with_body(json!({ "threads": [] }).to_string())
            .create_async()
            .await;
        let history = server
            .mock("GET", "/users/me/history")
            .match_query(Matcher::UrlEncoded("startHistoryId".into(), "9001".into()))
            .with_body(json!({ "historyId": "9002" }).to_string())
            .create_async()
            .await;

        let mem = MemoryHost::new();
        mem.set_token("INBOX", AuthToken::new(Provider::Google, "ya29.test")).await;
        let engine = Arc::new(
            SyncEngine::new(source(&server), &Host::from_shared(mem.clone()), SyncSettings::default()).unwrap(),
        );
        mem.register(engine.clone()).await;

        engine.on_channel_enabled(&Channel::new("INBOX", "Inbox")).await.unwrap();
        mem.run_pending().await.unwrap();
        watch.assert_async().await;
        assert_eq!(mem.webhook_urls().await.len(), 1);

        let notification = STANDARD.encode(r#"{"emailAddress":"me@example.com","historyId":"9002"}"#);
        let push = WebhookRequest::post(json!({ "message": { "data": notification } }).to_string());

        let forged = engine.on_webhook("INBOX", &push).await.unwrap();
        assert_eq!(forged, IngestOutcome::Rejected);

        let signed = push.with_query(TOKEN_PARAM, PUSH_TOKEN);
        let outcome = engine.on_webhook("INBOX", &signed).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Processed {
                upserts: 0,
                sync_started: true
            }
        );
        mem.run_pending().await.unwrap();
        history.assert_async().await;
    }

    #[test]
    fn test_verify_token_param() {
        let source = GmailSource::new(&SourceConfig::default());
        let request = WebhookRequest::post("{}").with_query("token", "push-secret");
        assert!(source.verify(&request, "push-secret"));
        assert!(!source.verify(&request, "other"));
        assert!(!source.verify(&WebhookRequest::post("{}"), "push-secret"));
    }
}
