//! Canonical thread model produced by source adapters.
//!
//! Adapters only ever build upsert requests (`NewLinkWithNotes`); the host
//! owns the stored records and matches them by `source`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A provider resource that can be switched on for syncing (repo, team, inbox label, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub title: String,
}

impl Channel {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl NewContact {
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
            avatar: None,
        }
    }

    /// Deterministic stand-in for providers that never expose an email,
    /// e.g. `583231+octocat@users.noreply.github.com`.
    pub fn noreply(domain: &str, id: impl std::fmt::Display, login: &str) -> Self {
        Self {
            email: format!("{}+{}@users.noreply.{}", id, login, domain),
            name: Some(login.to_string()),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: Option<String>) -> Self {
        self.avatar = avatar;
        self
    }
}

/// One message, comment or review inside a thread. `key` is its idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNote {
    pub key: String,
    /// Always serialized: `null` means "no content", which differs from leaving the note out.
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<NewContact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl NewNote {
    pub fn new(key: impl Into<String>, content: Option<String>) -> Self {
        Self {
            key: key.into(),
            content,
            author: None,
            created: None,
        }
    }

    /// The thread body note. Blank bodies become an explicit `null`.
    pub fn description(body: Option<&str>) -> Self {
        let content = body
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_string);
        Self::new("description", content)
    }

    pub fn by(mut self, author: Option<NewContact>) -> Self {
        self.author = author;
        self
    }

    pub fn at(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Open,
    InProgress,
    Done,
    Closed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMeta {
    #[serde(default, rename = "syncProvider", skip_serializing_if = "Option::is_none")]
    pub sync_provider: Option<String>,
    #[serde(default, rename = "syncableId", skip_serializing_if = "Option::is_none")]
    pub syncable_id: Option<String>,
    /// Provider keys (repo owner, issue number, thread id, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LinkMeta {
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub title: String,
    pub url: String,
}

impl Action {
    pub fn open(url: impl Into<String>) -> Self {
        Self {
            title: "Open".to_string(),
            url: url.into(),
        }
    }
}

/// A single instance of a recurring calendar series, keyed by its original start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOccurrence {
    pub original_start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

/// Upsert request for one external entity.
///
/// `None` fields leave the stored value untouched. An empty `notes` vector
/// means "metadata only": existing notes are kept as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLinkWithNotes {
    pub source: String,
    #[serde(rename = "type")]
    pub link_type: String,
    /// `None` keeps the stored title, for updates that only touch occurrences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<NewContact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<NewContact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LinkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default)]
    pub meta: LinkMeta,
    #[serde(default)]
    pub notes: Vec<NewNote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub occurrences: Vec<NewOccurrence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl NewLinkWithNotes {
    pub fn new(source: impl Into<String>, link_type: &str, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            link_type: link_type.to_string(),
            title: Some(title.into()),
            author: None,
            assignee: None,
            status: None,
            done: None,
            meta: LinkMeta::default(),
            notes: Vec::new(),
            actions: Vec::new(),
            preview: None,
            unread: None,
            archived: None,
            occurrences: Vec::new(),
            created: None,
        }
    }

    /// An update that adds or replaces one occurrence and leaves the rest of the thread alone.
    pub fn occurrence(source: impl Into<String>, link_type: &str, occurrence: NewOccurrence) -> Self {
        let mut link = Self::new(source, link_type, String::new());
        link.title = None;
        link.occurrences = vec![occurrence];
        link
    }

    pub fn is_metadata_only(&self) -> bool {
        self.notes.is_empty()
    }
}

/// Selects the threads that came from one channel of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFilter {
    #[serde(rename = "syncProvider")]
    pub sync_provider: String,
    #[serde(rename = "syncableId")]
    pub syncable_id: String,
}

impl LinkFilter {
    pub fn matches(&self, meta: &LinkMeta) -> bool {
        meta.sync_provider.as_deref() == Some(self.sync_provider.as_str())
            && meta.syncable_id.as_deref() == Some(self.syncable_id.as_str())
    }
}

/// Shorten a body into a one-paragraph preview.
pub fn preview(text: Option<&str>, max_chars: usize) -> Option<String> {
    let text = text?.trim();
    if text.is_empty() {
        return None;
    }
    let first = text.split("\n\n").next().unwrap_or(text).trim();
    if first.chars().count() <= max_chars {
        return Some(first.to_string());
    }
    let cut: String = first.chars().take(max_chars).collect();
    Some(format!("{}…", cut.trim_end()))
}

/// Parse an RFC 3339 timestamp, ignoring malformed values.
pub fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
