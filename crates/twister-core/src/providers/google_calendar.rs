//! Google Calendar source.
//!
//! The first run pages events from the lookback window and keeps the final
//! `nextSyncToken`. Push notifications carry no payload; they only trigger an
//! incremental run from that token. Watch channels expire, so registrations
//! carry an expiry and are renewed ahead of it.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{base_url, Continuation, Handshake, Page, SourceConfig, SourceContext, SyncSource, WebhookAction};
use crate::auth::Provider;
use crate::error::{sync_error, SyncError};
use crate::model::{
    parse_time, preview, Action, Channel, LinkMeta, LinkStatus, NewContact, NewLinkWithNotes, NewNote, NewOccurrence,
};
use crate::state::{SyncState, WebhookRegistration};
use crate::webhook::{constant_time_eq, WebhookRequest, WebhookResponse};

pub const NAME: &str = "google-calendar";

const DEFAULT_API: &str = "https://www.googleapis.com/calendar/v3";
const DEFAULT_LOOKBACK_DAYS: i64 = 30;
const WATCH_TTL_SECS: i64 = 604_800;
const MAX_RESULTS: u32 = 250;

const STATE_HEADER: &str = "x-goog-resource-state";
const TOKEN_HEADER: &str = "x-goog-channel-token";

pub struct GoogleCalendarSource {
    base: String,
    lookback_days: i64,
}

impl GoogleCalendarSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            base: base_url(config, DEFAULT_API),
            lookback_days: config.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
        }
    }

    fn calendar_url(&self, calendar_id: &str, path: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(calendar_id.as_bytes()).collect();
        format!("{}/calendars/{}{}", self.base, encoded, path)
    }

    async fn watch(&self, ctx: &SourceContext, address: &str, secret: Option<&str>) -> Result<WebhookRegistration> {
        let url = self.calendar_url(&ctx.channel_id, "/events/watch");
        let payload = json!({
            "id": Uuid::new_v4().to_string(),
            "type": "web_hook",
            "address": address,
            "token": secret,
            "params": { "ttl": WATCH_TTL_SECS.to_string() },
        });
        let channel: WatchChannel = ctx
            .json("watch channel", || {
                ctx.http
                    .post(&url)
                    .header("Authorization", ctx.bearer())
                    .json(&payload)
            })
            .await?;

        let mut registration = WebhookRegistration::new(channel.id, address);
        registration.resource_id = Some(channel.resource_id);
        registration.expires_at = channel
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Ok(registration)
    }

    async fn stop(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()> {
        let url = format!("{}/channels/stop", self.base);
        let payload = json!({
            "id": registration.webhook_id,
            "resourceId": registration.resource_id,
        });
        ctx.send(|| {
            ctx.http
                .post(&url)
                .header("Authorization", ctx.bearer())
                .json(&payload)
        })
        .await?;
        Ok(())
    }
}

impl EventTime {
    /// The timed value when present, otherwise the all-day date.
    fn value(&self) -> Option<&str> {
        self.date_time.as_deref().or(self.date.as_deref())
    }
}

fn contact(person: &Person) -> Option<NewContact> {
    person
        .email
        .as_ref()
        .map(|email| NewContact::new(email.clone(), person.display_name.clone()))
}

fn event_source(id: &str) -> String {
    format!("google-calendar:event:{}", id)
}

fn title(event: &CalendarEvent) -> String {
    event
        .summary
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "(no title)".to_string())
}

/// A modified or cancelled instance of a recurring series updates its
/// occurrence on the series' thread. The series itself is left alone.
fn exception_link(event: &CalendarEvent, master_id: &str, original_start: &str) -> NewLinkWithNotes {
    NewLinkWithNotes::occurrence(
        event_source(master_id),
        "event",
        NewOccurrence {
            original_start: original_start.to_string(),
            start: event.start.as_ref().and_then(EventTime::value).map(str::to_string),
            end: event.end.as_ref().and_then(EventTime::value).map(str::to_string),
            title: event.summary.clone(),
            cancelled: event.is_cancelled(),
        },
    )
}

fn event_link(calendar_id: &str, event: &CalendarEvent) -> NewLinkWithNotes {
    let mut link = NewLinkWithNotes::new(event_source(&event.id), "event", title(event));
    link.author = event
        .organizer
        .as_ref()
        .or(event.creator.as_ref())
        .and_then(contact);
    if event.is_cancelled() {
        link.status = Some(LinkStatus::Cancelled);
        link.done = Some(true);
    }

    let mut meta = LinkMeta::default()
        .with("calendarId", calendar_id)
        .with("eventId", event.id.as_str());
    if let Some(start) = event.start.as_ref().and_then(EventTime::value) {
        meta = meta.with("start", start);
    }
    if let Some(end) = event.end.as_ref().and_then(EventTime::value) {
        meta = meta.with("end", end);
    }
    link.meta = meta;

    if let Some(url) = &event.html_link {
        link.actions = vec![Action::open(url.clone())];
    }
    link.preview = preview(event.description.as_deref(), 200);
    link.created = parse_time(event.created.as_deref());
    if !event.is_cancelled() {
        link.notes = vec![NewNote::description(event.description.as_deref())
            .by(link.author.clone())
            .at(link.created)];
    }
    link
}

#[async_trait]
impl SyncSource for GoogleCalendarSource {
    type Item = CalendarEvent;

    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn name(&self) -> &str {
        NAME
    }

    fn lookback(&self) -> Option<Duration> {
        Some(Duration::days(self.lookback_days))
    }

    async fn list_channels(&self, ctx: &SourceContext) -> Result<Vec<Channel>> {
        let url = format!("{}/users/me/calendarList", self.base);
        let list: CalendarList = ctx
            .json("calendar list", || ctx.http.get(&url).header("Authorization", ctx.bearer()))
            .await?;
        Ok(list
            .items
            .into_iter()
            .map(|cal| Channel::new(cal.id, cal.summary.unwrap_or_default()))
            .collect())
    }

    async fn fetch_page(&self, ctx: &SourceContext, state: &SyncState) -> Result<Page<CalendarEvent>> {
        let mut url = self.calendar_url(
            &ctx.channel_id,
            &format!("/events?maxResults={}", ctx.page_size.min(MAX_RESULTS)),
        );
        match (&state.change_token, state.initial_sync) {
            (Some(sync_token), false) => {
                let encoded: String = url::form_urlencoded::byte_serialize(sync_token.as_bytes()).collect();
                url.push_str(&format!("&syncToken={}&showDeleted=true", encoded));
            }
            _ => {
                if let Some(since) = state.time_min {
                    url.push_str(&format!(
                        "&timeMin={}",
                        since.to_rfc3339_opts(SecondsFormat::Secs, true)
                    ));
                }
            }
        }
        if let Some(token) = state.cursor.token() {
            url.push_str(&format!("&pageToken={}", token));
        }

        let events: EventList = match ctx
            .json("events", || ctx.http.get(&url).header("Authorization", ctx.bearer()))
            .await
        {
            Ok(events) => events,
            Err(e) if sync_error(&e).and_then(SyncError::status) == Some(410) => {
                return Err(SyncError::ChangeTokenExpired {
                    provider: NAME.to_string(),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        let next = match events.next_page_token.filter(|t| !t.is_empty()) {
            Some(token) => Continuation::by_token(Some(token)),
            None => Continuation::Done {
                change_token: events.next_sync_token,
            },
        };
        debug!("google-calendar: {} returned {} events", ctx.channel_id, events.items.len());
        Ok(Page::new(events.items, next))
    }

    async fn transform(&self, ctx: &SourceContext, event: CalendarEvent) -> Result<Option<NewLinkWithNotes>> {
        let original_start = event.original_start_time.as_ref().and_then(EventTime::value);
        let link = match (event.recurring_event_id.as_deref(), original_start) {
            (Some(master_id), Some(original_start)) => exception_link(&event, master_id, original_start),
            _ => event_link(&ctx.channel_id, &event),
        };
        Ok(Some(link))
    }

    async fn create_webhook(
        &self,
        ctx: &SourceContext,
        url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookRegistration> {
        self.watch(ctx, url, secret).await
    }

    async fn delete_webhook(&self, ctx: &SourceContext, registration: &WebhookRegistration) -> Result<()> {
        self.stop(ctx, registration).await
    }

    /// Channels can't be extended: open a new one, then close the old.
    async fn renew_webhook(
        &self,
        ctx: &SourceContext,
        registration: &WebhookRegistration,
        secret: Option<&str>,
    ) -> Result<Option<WebhookRegistration>> {
        let renewed = self.watch(ctx, &registration.url, secret).await?;
        if let Err(e) = self.stop(ctx, registration).await {
            warn!(
                "google-calendar: failed to stop old watch channel {}: {:#}",
                registration.webhook_id, e
            );
        }
        Ok(Some(renewed))
    }

    fn handshake(&self, request: &WebhookRequest) -> Option<Handshake> {
        (request.header(STATE_HEADER) == Some("sync")).then(|| Handshake::reply(WebhookResponse::ok()))
    }

    fn verify(&self, request: &WebhookRequest, secret: &str) -> bool {
        request
            .header(TOKEN_HEADER)
            .map(|token| constant_time_eq(token, secret))
            .unwrap_or(false)
    }

    async fn route(&self, _ctx: &SourceContext, request: &WebhookRequest) -> Result<Vec<WebhookAction>> {
        debug!(
            "google-calendar: push with resource state {:?}",
            request.header(STATE_HEADER)
        );
        Ok(vec![WebhookAction::IncrementalSync])
    }
}

// --- Calendar API Response Types ---

#[derive(Debug, Deserialize)]
struct CalendarList {
    #[serde(default)]
    items: Vec<CalendarEntry>,
}

#[derive(Debug, Deserialize)]
struct CalendarEntry {
    id: String,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventList {
    #[serde(default)]
    items: Vec<CalendarEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    html_link: Option<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    start: Option<EventTime>,
    #[serde(default)]
    end: Option<EventTime>,
    #[serde(default)]
    organizer: Option<Person>,
    #[serde(default)]
    creator: Option<Person>,
    #[serde(default)]
    recurring_event_id: Option<String>,
    #[serde(default)]
    original_start_time: Option<EventTime>,
}

impl CalendarEvent {
    fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    #[serde(default)]
    date_time: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Person {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchChannel {
    id: String,
    resource_id: String,
    expiration: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::providers::SyncSettings;
    use crate::state::{Cursor, SyncOptions};
    use mockito::Matcher;

    fn source(server: &mockito::Server) -> GoogleCalendarSource {
        GoogleCalendarSource::new(&SourceConfig {
            api_base_url: Some(server.url()),
            ..Default::default()
        })
    }

    fn context() -> SourceContext {
        let settings = SyncSettings {
            max_http_retries: 1,
            ..Default::default()
        };
        SourceContext::new(
            "primary",
            AuthToken::new(Provider::Google, "ya29.test"),
            reqwest::Client::new(),
            &settings,
        )
    }

    #[tokio::test]
    async fn test_last_page_keeps_sync_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/calendars/primary/events")
            .match_query(Matcher::Regex("timeMin=".into()))
            .with_body(
                json!({
                    "items": [{ "id": "e1", "summary": "Standup", "status": "confirmed" }],
                    "nextSyncToken": "CPDAlvWDx70CEPDAlvWDx70CGAU="
                })
                .to_string(),
            )
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::initial().since(Some(Utc::now() - Duration::days(30))));
        let page = source(&server).fetch_page(&context(), &state).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(
            page.next,
            Continuation::Done {
                change_token: Some("CPDAlvWDx70CEPDAlvWDx70CGAU=".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_gone_sync_token_expires() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/calendars/primary/events")
            .match_query(Matcher::Regex("syncToken=".into()))
            .with_status(410)
            .with_body(r#"{"error":{"code":410,"message":"Sync token is no longer valid"}}"#)
            .create_async()
            .await;

        let state = SyncState::new(&SyncOptions::incremental(Some("stale".to_string())));
        let err = source(&server).fetch_page(&context(), &state).await.unwrap_err();
        assert!(matches!(sync_error(&err), Some(SyncError::ChangeTokenExpired { .. })));
    }

    #[tokio::test]
    async fn test_page_token_continues() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/calendars/primary/events")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_body(json!({ "items": [], "nextPageToken": "p3" }).to_string())
            .create_async()
            .await;

        let mut state = SyncState::new(&SyncOptions::initial());
        state.cursor = Cursor::Token("p2".to_string());
        let page = source(&server).fetch_page(&context(), &state).await.unwrap();
        assert_eq!(page.next, Continuation::More(Cursor::Token("p3".to_string())));
    }

    #[tokio::test]
    async fn test_exception_becomes_occurrence_on_master() {
        let server = mockito::Server::new_async().await;
        let event: CalendarEvent = serde_json::from_value(json!({
            "id": "series_20240115T100000Z",
            "status": "cancelled",
            "summary": "Weekly sync",
            "recurringEventId": "series",
            "originalStartTime": { "dateTime": "2024-01-15T10:00:00Z" }
        }))
        .unwrap();

        let link = source(&server).transform(&context(), event).await.unwrap().unwrap();
        assert_eq!(link.source, "google-calendar:event:series");
        assert!(link.is_metadata_only());
        assert_eq!(link.title, None);
        assert_eq!(link.occurrences.len(), 1);
        assert_eq!(link.occurrences[0].original_start, "2024-01-15T10:00:00Z");
        assert!(link.occurrences[0].cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_exception_keeps_series_title() {
        use crate::host::memory::MemoryHost;
        use crate::host::Integrations;

        let server = mockito::Server::new_async().await;
        let source = source(&server);
        let master: CalendarEvent = serde_json::from_value(json!({
            "id": "series",
            "status": "confirmed",
            "summary": "Weekly sync",
            "start": { "dateTime": "2024-01-08T10:00:00Z" },
            "recurrence": ["RRULE:FREQ=WEEKLY"]
        }))
        .unwrap();
        let cancelled: CalendarEvent = serde_json::from_value(json!({
            "id": "series_20240115T100000Z",
            "status": "cancelled",
            "recurringEventId": "series",
            "originalStartTime": { "dateTime": "2024-01-15T10:00:00Z" }
        }))
        .unwrap();

        let host = MemoryHost::new();
        for event in [master, cancelled] {
            let link = source.transform(&context(), event).await.unwrap().unwrap();
            host.save_link(link).await.unwrap();
        }

        let saved = host.link("google-calendar:event:series").await.unwrap();
        assert_eq!(saved.title, "Weekly sync");
        assert_eq!(saved.status, None);
        assert_eq!(saved.occurrences.len(), 1);
        assert!(saved.occurrences[0].cancelled);
    }

    #[tokio::test]
    async fn test_single_event_maps_organizer() {
        let server = mockito::Server::new_async().await;
        let event: CalendarEvent = serde_json::from_value(json!({
            "id": "e1",
            "status": "confirmed",
            "summary": "Design review",
            "description": "Agenda in doc",
            "htmlLink": "https://www.google.com/calendar/event?eid=e1",
            "start": { "dateTime": "2024-01-15T10:00:00Z" },
            "end": { "dateTime": "2024-01-15T11:00:00Z" },
            "organizer": { "email": "alice@example.com", "displayName": "Alice" }
        }))
        .unwrap();

        let link = source(&server).transform(&context(), event).await.unwrap().unwrap();
        assert_eq!(link.source, "google-calendar:event:e1");
        assert_eq!(link.author.as_ref().map(|a| a.email.as_str()), Some("alice@example.com"));
        assert_eq!(link.meta.extra["start"], "2024-01-15T10:00:00Z");
        assert_eq!(link.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_opens_new_channel_then_stops_old() {
        let mut server = mockito::Server::new_async().await;
        let expiration = (Utc::now() + Duration::days(7)).timestamp_millis().to_string();
        let watch = server
            .mock("POST", "/calendars/primary/events/watch")
            .match_body(Matcher::PartialJson(json!({ "type": "web_hook", "token": "chan-secret" })))
            .with_body(json!({ "id": "new-chan", "resourceId": "res-2", "expiration": expiration }).to_string())
            .create_async()
            .await;
        let stop = server
            .mock("POST", "/channels/stop")
            .match_body(Matcher::PartialJson(json!({ "id": "old-chan", "resourceId": "res-1" })))
            .create_async()
            .await;

        let mut old = WebhookRegistration::new("old-chan", "https://hooks.example.com/cb/1");
        old.resource_id = Some("res-1".to_string());
        let renewed = source(&server)
            .renew_webhook(&context(), &old, Some("chan-secret"))
            .await
            .unwrap()
            .unwrap();

        watch.assert_async().await;
        stop.assert_async().await;
        assert_eq!(renewed.webhook_id, "new-chan");
        assert_eq!(renewed.url, old.url);
        assert!(renewed.expires_at.is_some());
    }

    #[test]
    fn test_sync_handshake_and_token_check() {
        let source = GoogleCalendarSource::new(&SourceConfig::default());
        let sync = WebhookRequest::post("").with_header("X-Goog-Resource-State", "sync");
        assert!(source.handshake(&sync).is_some());

        let push = WebhookRequest::post("")
            .with_header("X-Goog-Resource-State", "exists")
            .with_header("X-Goog-Channel-Token", "chan-secret");
        assert!(source.handshake(&push).is_none());
        assert!(source.verify(&push, "chan-secret"));
        assert!(!source.verify(&push, "other"));
    }
}
