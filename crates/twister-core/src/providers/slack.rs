//! Slack source.
//!
//! Each top-level message in a conversation is a thread; replies are its
//! notes. Events arrive through the app-level Events API, signed with the
//! app's signing secret.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{base_url, Continuation, Handshake, Page, SecretPolicy, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::error::SyncError;
use crate::model::{preview, Action, Channel, LinkMeta, NewContact, NewLinkWithNotes, NewNote};
use crate::state::{SyncState, WebhookRegistration};
use crate::webhook::{verify_hmac_sha256, WebhookRequest, WebhookResponse};

pub const NAME: &str = "slack";

const DEFAULT_API: &str = "https://slack.com/api";
const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const TITLE_CHARS: usize = 80;
const REPLAY_WINDOW_SECS: i64 = 300;

const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const SIGNATURE_HEADER: &str = "x-slack-signature";

static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@([A-Z0-9]+)>").expect("valid mention regex"));

pub struct SlackSource {
    base: String,
    signing_secret: Option<String>,
    lookback_days: i64,
    /// User id -> contact, filled lazily from `users.info`.
    users: Mutex<HashMap<String, NewContact>>,
}

impl SlackSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base: base_url(config, DEFAULT_API),
            signing_secret: config.signing_secret.clone(),
            lookback_days: config.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Call a Web API method. Slack reports failures as `ok: false` with HTTP 200.
    async fn api<T: DeserializeOwned>(&self, ctx: &SourceContext, method: &str, params: &[(&str, String)]) -> Result<T> {
        let url = format!("{}/{}", self.base, method);
        let body: Value = ctx
            .json(method, || {
                ctx.http
                    .get(&url)
                    .header("Authorization", ctx.bearer())
                    .query(params)
            })
            .await?;

        if body["ok"].as_bool() != Some(true) {
            let error = body["error"].as_str().unwrap_or("unknown_error");
            return Err(match error {
                "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => SyncError::AuthUnavailable {
                    provider: Provider::Slack,
                    channel_id: ctx.channel_id.clone(),
                },
                other => SyncError::provider(NAME, None, format!("{} failed: {}", method, other)),
            }
            .into());
        }
        serde_json::from_value(body).with_context(|| format!("slack: decoding {}", method))
    }

    /// Resolve a user to a contact, falling back to a placeholder address.
    async fn user(&self, ctx: &SourceContext, user_id: &str) -> NewContact {
        if let Some(contact) = self.users.lock().await.get(user_id) {
            return contact.clone();
        }

        match self
            .api::<UserInfoResponse>(ctx, "users.info", &[("user", user_id.to_string())])
            .await
        {
            Ok(info) => {
                let contact = info.user.contact();
                self.users.lock().await.insert(user_id.to_string(), contact.clone());
                contact
            }
            Err(e) => {
                warn!("slack: failed to look up user {}: {:#}", user_id, e);
                placeholder_contact(user_id, None)
            }
        }
    }

    /// Replace `<@U123>` mentions with display names.
    async fn clean_text(&self, ctx: &SourceContext, text: &str) -> String {
        let mut names = HashMap::new();
        for caps in MENTION_RE.captures_iter(text) {
            let user_id = &caps[1];
            if !names.contains_key(user_id) {
                let contact = self.user(ctx, user_id).await;
                names.insert(user_id.to_string(), contact.name.unwrap_or_else(|| user_id.to_string()));
            }
        }
        clean_slack_text(text, &names)
    }

    async fn message_note(&self, ctx: &SourceContext, message: &SlackMessage) -> NewNote {
        let content = match &message.text {
            Some(text) => Some(self.clean_text(ctx, text).await),
            None => None,
        };
        let author = match &message.user {
            Some(user_id) => Some(self.user(ctx, user_id).await),
            None => None,
        };
        NewNote::new(message.ts.clone(), content)
            .by(author)
            .at(slack_ts_to_datetime(&message.ts))
    }

    /// Thread fields for a root message; notes are left to the caller.
    async fn thread_link(&self, ctx: &SourceContext, root: &SlackMessage) -> NewLinkWithNotes {
        let text = match &root.text {
            Some(text) => self.clean_text(ctx, text).await,
            None => String::new(),
        };
        let title = preview(Some(text.lines().next().unwrap_or_default()), TITLE_CHARS)
            .unwrap_or_else(|| "(no text)".to_string());

        let mut link = NewLinkWithNotes::new(
            format!("slack:{}:{}", ctx.channel_id, root.ts),
            "message",
            title,
        );
        link.author = match &root.user {
            Some(user_id) => Some(self.user(ctx, user_id).await),
            None => None,
        };
        link.meta = LinkMeta::default()
            .with("channelId", ctx.channel_id.as_str())
            .with("threadTs", root.ts.as_str());
        link.actions = vec![Action::open(slack_permalink(&ctx.channel_id, &root.ts))];
        link.preview = preview(Some(&text), 200);
        link.created = slack_ts_to_datetime(&root.ts);
        link
    }

    async fn replies(&self, ctx: &SourceContext, thread_ts: &str) -> Result<Vec<SlackMessage>> {
        let mut replies = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![
                ("channel", ctx.channel_id.clone()),
                ("ts", thread_ts.to_string()),
                ("limit", "200".to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let page: HistoryResponse = self.api(ctx, "conversations.replies", &params).await?;
            replies.extend(page.messages.into_iter().filter(|m| m.ts != thread_ts));

            cursor = page.response_metadata.and_then(|m| m.next_cursor).filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(replies)
    }

    /// The root message of a thread, for titling replies that arrive by webhook.
    async fn root_message(&self, ctx: &SourceContext, thread_ts: &str) -> Result<Option<SlackMessage>> {
        let params = [
            ("channel", ctx.channel_id.clone()),
            ("latest", thread_ts.to_string()),
            ("inclusive", "true".to_string()),
            ("limit", "1".to_string()),
        ];
        let page: HistoryResponse = self.api(ctx, "conversations.history", &params).await?;
        Ok(page.messages.into_iter().find(|m| m.ts == thread_ts))
    }
}

// --- Helper Functions ---

fn placeholder_contact(user_id: &str, name: Option<String>) -> NewContact {
    NewContact::new(format!("{}@users.noreply.slack.com", user_id), name)
}

fn slack_ts_from_datetime(dt: DateTime<Utc>) -> String {
    format!("{}.000000", dt.timestamp())
}

fn slack_ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let secs = ts.split('.').next()?.parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn slack_permalink(channel_id: &str, ts: &str) -> String {
    format!("https://slack.com/archives/{}/p{}", channel_id, ts.replace('.', ""))
}

fn clean_slack_text(text: &str, names: &HashMap<String, String>) -> String {
    MENTION_RE
        .replace_all(text, |caps: &regex::Captures| {
            let user_id = &caps[1];
            let name = names.get(user_id).map(String::as_str).unwrap_or(user_id);
            format!("@{}", name)
        })
        .to_string()
}

/// Check `v0=<hex>` over `v0:<timestamp>:<body>`, rejecting stale timestamps.
fn verify_slack_signature(request: &WebhookRequest, secret: &str, now: DateTime<Utc>) -> bool {
    let (Some(timestamp), Some(signature)) = (request.header(TIMESTAMP_HEADER), request.header(SIGNATURE_HEADER)) else {
        return false;
    };
    let Ok(sent_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now.timestamp() - sent_at).abs() > REPLAY_WINDOW_SECS {
        return false;
    }
    let base = format!("v0:{}:{}", timestamp, request.body);
    verify_hmac_sha256(secret, base.as_bytes(), signature, Some("v0="))
}

impl SlackMessage {
    /// Joins, topic changes, edits and the like carry a subtype; plain messages don't.
    fn is_plain(&self) -> bool {
        matches!(self.subtype.as_deref(), None | Some("thread_broadcast"))
    }

    fn is_reply(&self) -> bool {
        self.thread_ts.as_deref().map(|t| t != self.ts).unwrap_or(false)
    }
}

#[async_trait]
impl SyncSource for SlackSource {
    type Item = SlackMessage;

    fn provider(&self) -> Provider {
        Provider::Slack
    }

    fn name(&self) -> &str {
        NAME
    }

    fn lookback(&self) -> Option<Duration> {
        Some(Duration::days(self.lookback_days))
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        let mut channels = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![
                ("limit", "200".to_string()),
                ("types", "public_channel,private_channel".to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let page: ConversationsResponse = self.api(ctx, "users.conversations", &params).await?;
            channels.extend(page.channels.into_iter().map(|c| {
                let title = c.name.unwrap_or_else(|| c.id.clone());
                Channel::new(c.id, title)
            }));

            cursor = page.response_metadata.and_then(|m| m.next_cursor).filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(channels)
    }

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<SlackMessage>> {
        let mut params = vec![
            ("channel", ctx.channel_id.clone()),
            ("limit", ctx.page_size.to_string()),
        ];
        if let Some(cursor) = state.cursor.token() {
            params.push(("cursor", cursor.to_string()));
        }
        if let Some(since) = state.time_min {
            params.push(("oldest", slack_ts_from_datetime(since)));
        }

        let page: HistoryResponse = self.api(ctx, "conversations.history", &params).await?;
        let next_cursor = page.response_metadata.and_then(|m| m.next_cursor);
        let next = Continuation::by_token(if page.has_more { next_cursor } else { None });
        debug!("slack: channel {} returned {} messages", ctx.channel_id, page.messages.len());
        Ok(Page::new(page.messages, next))
    }

    async fn transform(&self, ctx: &SourceContext, message: SlackMessage) -> Result<Option<NewLinkWithNotes>> {
        if !message.is_plain() || message.is_reply() {
            return Ok(None);
        }

        let mut link = self.thread_link(ctx, &message).await;
        link.notes.push(self.message_note(ctx, &message).await);

        if message.reply_count.unwrap_or(0) > 0 {
            match self.replies(ctx, &message.ts).await {
                Ok(replies) => {
                    for reply in replies.iter().filter(|r| r.is_plain()) {
                        link.notes.push(self.message_note(ctx, reply).await);
                    }
                }
                Err(e) => warn!(
                    "slack: failed to fetch replies for {} in {}: {:#}",
                    message.ts, ctx.channel_id, e
                ),
            }
        }
        Ok(Some(link))
    }

    /// Without a configured signing secret nothing can be verified and every
    /// event is rejected.
    fn secret_policy(&self) -> SecretPolicy {
        match &self.signing_secret {
            Some(secret) => SecretPolicy::Static(secret.clone()),
            None => SecretPolicy::Handshake,
        }
    }

    /// Event subscriptions are configured once per app, so there is nothing to
    /// create per channel beyond the host endpoint.
    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        _secret: Option<&str>,
    ) -> Result<WebhookRegistration> {
        Ok(WebhookRegistration::new(format!("events:{}", ctx.channel_id), url))
    }

    async fn delete_webhook(&self, _ctx: &SourceContext, _registration: &WebhookRegistration) -> Result<()> {
        Ok(())
    }

    fn handshake(&self, request: &WebhookRequest) -> Option<Handshake> {
        let body: Value = request.json().ok()?;
        if body["type"].as_str() != Some("url_verification") {
            return None;
        }
        let challenge = body["challenge"].as_str().unwrap_or_default();
        Some(Handshake::reply(WebhookResponse::text(challenge)))
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool {
        verify_slack_signature(request, secret, Utc::now())
    }

    async fn route(&self, ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>> {
        let callback: EventCallback = request.json().context("slack: decoding event callback")?;
        let Some(event) = callback.event else {
            return Ok(vec![WebhookAction::Ignore]);
        };
        if event["type"].as_str() != Some("message") || event["channel"].as_str() != Some(ctx.channel_id.as_str()) {
            return Ok(vec![WebhookAction::Ignore]);
        }
        let message: SlackMessage = serde_json::from_value(event).context("slack: decoding message event")?;
        if !message.is_plain() {
            return Ok(vec![WebhookAction::Ignore]);
        }

        let root = if message.is_reply() {
            let thread_ts = message.thread_ts.clone().unwrap_or_default();
            match self.root_message(ctx, &thread_ts).await? {
                Some(root) => root,
                None => {
                    debug!("slack: root {} of reply {} not found", thread_ts, message.ts);
                    return Ok(vec![WebhookAction::Ignore]);
                }
            }
        } else {
            message.clone()
        };

        let mut link = self.thread_link(ctx, &root).await;
        link.notes.push(self.message_note(ctx, &message).await);
        Ok(vec![WebhookAction::upsert(link)])
    }
}

// --- Slack API Response Types ---

#[derive(Debug, Clone, Deserialize)]
struct SlackResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    channels: Vec<SlackChannel>,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackChannel {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    reply_count: Option<i32>,
    #[serde(default)]
    subtype: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserInfoResponse {
    user: SlackUser,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUser {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile: SlackUserProfile,
}

impl SlackUser {
    fn contact(&self) -> NewContact {
        let name = self
            .profile
            .real_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| self.profile.display_name.clone().filter(|n| !n.is_empty()))
            .or_else(|| self.name.clone());
        let contact = match &self.profile.email {
            Some(email) => NewContact::new(email.clone(), name),
            None => placeholder_contact(&self.id, name),
        };
        contact.with_avatar(self.profile.image_72.clone())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SlackUserProfile {
    real_name: Option<String>,
    display_name: Option<String>,
    email: Option<String>,
    image_72: Option<String>,
}

/// Other event types carry different shapes, so the inner event stays loose
/// until it is known to be a message.
#[derive(Debug, Deserialize)]
struct EventCallback {
    #[serde(default)]
    event: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::error::sync_error;
    use crate::providers::SyncSettings;
    use crate::state::{Cursor, SyncOptions};
    use crate::webhook::sign_hmac_sha256;
    use mockito::Matcher;
    use serde_json::json;

    fn source(server: &mockito::Server) -> SlackSource {
        SlackSource::new(&SourceConfig {
            api_base_url: Some(server.url()),
            signing_secret: Some("8f742231b10e8888abcd99yyyzzz85a5".to_string()),
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
            "C123",
            AuthToken::new(Provider::Slack, "xoxb-test"),
            reqwest::Client::new(),
            &settings,
        )
    }

    async fn mock_user(server: &mut mockito::Server, id: &str, name: &str) -> mockito::Mock {
        server
            .mock("GET", "/users.info")
            .match_query(Matcher::UrlEncoded("user".into(), id.into()))
            .with_body(
                json!({ "ok": true, "user": { "id": id, "name": name.to_lowercase(), "profile": { "real_name": name } } })
                    .to_string(),
            )
            .create_async()
            .await
    }

    #[test]
    fn test_slack_ts_conversion() {
        let dt = slack_ts_to_datetime("1704067200.000100").unwrap();
        assert_eq!(dt.timestamp(), 1704067200);
        assert!(slack_ts_from_datetime(dt).starts_with("1704067200"));
        assert_eq!(
            slack_permalink("C123", "1704067200.000100"),
            "https://slack.com/archives/C123/p1704067200000100"
        );
    }

    #[test]
    fn test_clean_slack_text() {
        let mut names = HashMap::new();
        names.insert("U12345".to_string(), "Alice".to_string());
        let cleaned = clean_slack_text("Hey <@U12345> and <@U999>, can you review this?", &names);
        assert_eq!(cleaned, "Hey @Alice and @U999, can you review this?");
    }

    #[test]
    fn test_signature_replay_window() {
        let body = r#"{"type":"event_callback"}"#;
        let now = Utc::now();
        let sign = |ts: i64| {
            let base = format!("v0:{}:{}", ts, body);
            format!("v0={}", sign_hmac_sha256("secret", base.as_bytes()))
        };

        let fresh = WebhookRequest::post(body)
            .with_header("X-Slack-Request-Timestamp", now.timestamp().to_string())
            .with_header("X-Slack-Signature", sign(now.timestamp()));
        assert!(verify_slack_signature(&fresh, "secret", now));
        assert!(!verify_slack_signature(&fresh, "wrong", now));

        let stale_ts = now.timestamp() - 600;
        let stale = WebhookRequest::post(body)
            .with_header("X-Slack-Request-Timestamp", stale_ts.to_string())
            .with_header("X-Slack-Signature", sign(stale_ts));
        assert!(!verify_slack_signature(&stale, "secret", now));
    }

    #[test]
    fn test_url_verification_challenge() {
        let source = SlackSource::new(&SourceConfig::default());
        let request = WebhookRequest::post(r#"{"type":"url_verification","challenge":"3eZbrw1aBm2rZgRNFdxV"}"#);
        let handshake = source.handshake(&request).unwrap();
        assert_eq!(handshake.response.body.as_deref(), Some("3eZbrw1aBm2rZgRNFdxV"));
        assert_eq!(source.secret_policy(), SecretPolicy::Handshake);
    }

    #[tokio::test]
    async fn test_revoked_token_is_auth_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::Any)
            .with_body(json!({ "ok": false, "error": "token_revoked" }).to_string())
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::initial());
        let err = source(&server).fetch_page(&context(), &state).await.unwrap_err();
        assert!(matches!(sync_error(&err), Some(SyncError::AuthUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_fetch_page_follows_cursor_only_when_more() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::Any)
            .with_body(
                json!({
                    "ok": true,
                    "messages": [{ "ts": "1.1", "text": "a" }, { "ts": "1.2", "text": "b" }],
                    "has_more": true,
                    "response_metadata": { "next_cursor": "bmV4dA==" }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::initial());
        let page = source(&server).fetch_page(&context(), &state).await.unwrap();
        assert_eq!(page.next, Continuation::More(Cursor::Token("bmV4dA==".to_string())));
    }

    #[tokio::test]
    async fn test_transform_threads_replies_as_notes() {
        let mut server = mockito::Server::new_async().await;
        mock_user(&mut server, "U1", "Alice").await;
        mock_user(&mut server, "U2", "Bob").await;
        server
            .mock("GET", "/conversations.replies")
            .match_query(Matcher::Any)
            .with_body(
                json!({ "ok": true, "messages": [
                    { "ts": "1704067200.000100", "user": "U1", "text": "Deploy at 5?", "thread_ts": "1704067200.000100" },
                    { "ts": "1704067260.000200", "user": "U2", "text": "<@U1> sounds good", "thread_ts": "1704067200.000100" }
                ] })
                .to_string(),
            )
            .create_async()
            .await;

        let message: SlackMessage = serde_json::from_value(json!({
            "ts": "1704067200.000100",
            "user": "U1",
            "text": "Deploy at 5?",
            "thread_ts": "1704067200.000100",
            "reply_count": 1
        }))
        .unwrap();

        let link = source(&server).transform(&context(), message).await.unwrap().unwrap();
        assert_eq!(link.source, "slack:C123:1704067200.000100");
        assert_eq!(link.title.as_deref(), Some("Deploy at 5?"));
        assert_eq!(link.notes.len(), 2);
        assert_eq!(link.notes[1].key, "1704067260.000200");
        assert_eq!(link.notes[1].content.as_deref(), Some("@Alice sounds good"));
        assert_eq!(
            link.notes[1].author.as_ref().map(|a| a.email.as_str()),
            Some("U2@users.noreply.slack.com")
        );
    }

    #[tokio::test]
    async fn test_transform_skips_joins_and_replies() {
        let server = mockito::Server::new_async().await;
        let join: SlackMessage =
            serde_json::from_value(json!({ "ts": "1.1", "subtype": "channel_join", "text": "joined" })).unwrap();
        let reply: SlackMessage =
            serde_json::from_value(json!({ "ts": "1.3", "thread_ts": "1.1", "text": "reply" })).unwrap();
        let source = source(&server);
        assert!(source.transform(&context(), join).await.unwrap().is_none());
        assert!(source.transform(&context(), reply).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_event_upserts_single_note_into_root_thread() {
        let mut server = mockito::Server::new_async().await;
        mock_user(&mut server, "U2", "Bob").await;
        server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::UrlEncoded("latest".into(), "1704067200.000100".into()))
            .with_body(
                json!({ "ok": true, "messages": [{ "ts": "1704067200.000100", "text": "Deploy at 5?" }] }).to_string(),
            )
            .create_async()
            .await;

        let body = json!({
            "type": "event_callback",
            "event": {
                "type": "message",
                "channel": "C123",
                "user": "U2",
                "text": "on it",
                "ts": "1704067300.000300",
                "thread_ts": "1704067200.000100"
            }
        })
        .to_string();
        let actions = source(&server)
            .route(&context(), &WebhookRequest::post(body))
            .await
            .unwrap();
        match actions.as_slice() {
            [WebhookAction::Upsert(link)] => {
                assert_eq!(link.source, "slack:C123:1704067200.000100");
                assert_eq!(link.title.as_deref(), Some("Deploy at 5?"));
                assert_eq!(link.notes.len(), 1);
                assert_eq!(link.notes[0].key, "1704067300.000300");
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let server = mockito::Server::new_async().await;
        let source = source(&server);
        for event in [
            json!({ "type": "reaction_added", "user": "U1", "item": { "ts": "1.1" }, "event_ts": "1.2" }),
            json!({ "type": "message", "channel": "C999", "ts": "1.1", "text": "elsewhere" }),
            json!({ "type": "message", "channel": "C123", "subtype": "message_deleted", "ts": "1.1" }),
        ] {
            let body = json!({ "type": "event_callback", "event": event }).to_string();
            let actions = source.route(&context(), &WebhookRequest::post(body)).await.unwrap();
            assert!(matches!(actions.as_slice(), [WebhookAction::Ignore]));
        }
    }
}
