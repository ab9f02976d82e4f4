//! Plugin SDK for syncing external sources into Plot threads.
//!
//! A source adapter implements [`SyncSource`]: how to list channels, fetch a
//! page, map an entity to a thread, and manage a webhook. [`SyncEngine`] wraps
//! an adapter and owns everything else (batch scheduling, per-channel state,
//! locking, webhook verification and renewal) on top of the host services in
//! [`Host`]. [`MemoryHost`] is an in-process host for tests and local runs.

pub mod auth;
pub mod engine;
pub mod error;
pub mod host;
pub mod model;
pub mod providers;
pub mod registry;
pub mod state;
pub mod webhook;

pub use auth::{AuthToken, Provider, TokenResolver};
pub use engine::{BatchOutcome, IngestOutcome, SyncEngine};
pub use error::{sync_error, SyncError};
pub use host::memory::MemoryHost;
pub use host::{Callback, CallbackToken, Callbacks, Host, Integrations, Network, Store, StoreExt, TaskHandle, Tasks};
pub use model::{Action, Channel, LinkFilter, LinkMeta, LinkStatus, NewContact, NewLinkWithNotes, NewNote, NewOccurrence};
pub use providers::{
    Continuation, Handshake, Page, SecretPolicy, SourceConfig, SourceContext, SyncSettings, SyncSource, TwisterConfig,
    WebhookAction,
};
pub use registry::{ArchiveOnDisable, CallbackHandler, CallbackRegistry};
pub use state::{Cursor, SyncOptions, SyncState, WebhookRegistration};
pub use webhook::{WebhookRequest, WebhookResponse};
