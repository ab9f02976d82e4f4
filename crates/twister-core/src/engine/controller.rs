//! Channel enablement: switching a channel on and off, and starting runs.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{SyncEngine, ON_WEBHOOK, RENEW_WEBHOOK, SYNC_BATCH};
use crate::host::{Callback, CallbackToken, StoreExt, TaskHandle};
use crate::model::Channel;
use crate::providers::{SecretPolicy, SyncSource};
use crate::state::{ChannelKeys, SyncLock, SyncOptions, SyncState, WebhookRegistration};
use crate::webhook::generate_secret;

impl<S: SyncSource> SyncEngine<S> {
    /// Channels the current credential can see.
    pub async fn list_channels(&self, channel_id: &str) -> Result<Vec<Channel>> {
        let ctx = self.context(channel_id).await?;
        self.source.list_channels(&ctx).await
    }

    /// Switch a channel on: remember it, subscribe to webhooks, start the initial sync.
    pub async fn on_channel_enabled(&self, channel: &Channel) -> Result<()> {
        let keys = ChannelKeys::new(&channel.id);
        info!("{}: enabling channel {} ({})", self.source.name(), channel.title, channel.id);

        self.host.store.set(&keys.sync_enabled, &true).await?;

        if let Some((handler, method)) = &self.disable_handler {
            let existing: Option<CallbackToken> = self.host.store.get(&keys.disable_callback).await?;
            if existing.is_none() {
                let token = self
                    .host
                    .callbacks
                    .create(Callback::new(handler.clone(), method.clone(), Vec::new()))
                    .await?;
                self.host.store.set(&keys.disable_callback, &token).await?;
            }
        }

        let has_webhook: Option<WebhookRegistration> = self.host.store.get(&keys.webhook_id).await?;
        if has_webhook.is_none() {
            self.setup_webhook(&channel.id).await;
        }

        let options = SyncOptions::initial().since(self.lookback_start());
        self.start_sync(&channel.id, options).await?;
        Ok(())
    }

    /// Switch a channel off and remove everything the engine stored for it.
    ///
    /// Provider-side teardown is best effort. The disable notification fires
    /// once; its token is removed afterwards.
    pub async fn on_channel_disabled(&self, channel: &Channel) -> Result<()> {
        let keys = ChannelKeys::new(&channel.id);
        info!("{}: disabling channel {} ({})", self.source.name(), channel.title, channel.id);

        self.stop_sync(&channel.id).await?;
        self.teardown_webhook(&channel.id).await?;

        for key in keys.all() {
            if key != keys.disable_callback {
                self.host.store.clear(key).await?;
            }
        }

        let token: Option<CallbackToken> = self.host.store.get(&keys.disable_callback).await?;
        if let Some(token) = token {
            let filter = serde_json::to_value(self.filter(&channel.id))?;
            self.host.callbacks.run(&token, vec![filter]).await?;
            self.host.callbacks.delete(&token).await?;
            self.host.store.clear(&keys.disable_callback).await?;
        }

        Ok(())
    }

    /// Begin a sync run unless one is already in flight.
    ///
    /// Returns whether a run was started. The lock is a plain store flag, so
    /// two starts racing each other can both get through.
    pub async fn start_sync(&self, channel_id: &str, options: SyncOptions) -> Result<bool> {
        let keys = ChannelKeys::new(channel_id);

        let lock: Option<SyncLock> = self.host.store.get(&keys.sync_lock).await?;
        if let Some(lock) = lock {
            if !lock.is_stale(self.settings.lock_ttl(), Utc::now()) {
                info!(
                    "{}: sync already in progress for channel {}, skipping",
                    self.source.name(),
                    channel_id
                );
                return Ok(false);
            }
            warn!("{}: ignoring stale sync lock for channel {}", self.source.name(), channel_id);
        }

        self.host.store.set(&keys.sync_lock, &SyncLock::now()).await?;
        self.host.store.set(&keys.sync_state, &SyncState::new(&options)).await?;

        info!(
            "{}: starting {} sync for channel {}",
            self.source.name(),
            if options.initial_sync { "initial" } else { "incremental" },
            channel_id
        );
        self.schedule(SYNC_BATCH, channel_id, None).await?;
        Ok(true)
    }

    /// Start an incremental run seeded from the stored change token.
    pub async fn start_incremental_sync(&self, channel_id: &str) -> Result<bool> {
        let keys = ChannelKeys::new(channel_id);
        let change_token: Option<String> = self.host.store.get(&keys.last_sync_token).await?;
        let mut options = SyncOptions::incremental(change_token);
        if options.change_token.is_none() {
            options = options.since(self.lookback_start());
        }
        self.start_sync(channel_id, options).await
    }

    /// Stop the channel's run and its scheduled renewal.
    ///
    /// A batch already executing finishes, then finds no state and stops.
    pub async fn stop_sync(&self, channel_id: &str) -> Result<()> {
        let keys = ChannelKeys::new(channel_id);
        self.host.store.clear(&keys.sync_state).await?;
        self.host.store.clear(&keys.sync_lock).await?;

        let renewal: Option<TaskHandle> = self.host.store.get(&keys.renewal_task).await?;
        if let Some(handle) = renewal {
            self.host.tasks.cancel_task(&handle).await?;
            self.host.store.clear(&keys.renewal_task).await?;
        }

        debug!("{}: stopped sync for channel {}", self.source.name(), channel_id);
        Ok(())
    }

    /// Provision a host endpoint and subscribe the provider to it.
    ///
    /// Failures are logged and the channel keeps syncing without real-time updates.
    pub(super) async fn setup_webhook(&self, channel_id: &str) {
        if let Err(e) = self.try_setup_webhook(channel_id).await {
            warn!(
                "{}: webhook setup failed for channel {}, continuing without real-time updates: {:#}",
                self.source.name(),
                channel_id,
                e
            );
        }
    }

    async fn try_setup_webhook(&self, channel_id: &str) -> Result<()> {
        let keys = ChannelKeys::new(channel_id);
        let ctx = self.context(channel_id).await?;

        let token = self
            .host
            .callbacks
            .create(self.callback(ON_WEBHOOK, channel_id))
            .await?;
        let url = match self.host.network.create_webhook(token.clone()).await {
            Ok(url) => url,
            Err(e) => {
                self.host.callbacks.delete(&token).await?;
                return Err(e);
            }
        };
        self.host.store.set(&keys.webhook_callback, &token).await?;

        // Stored before subscribing: some providers deliver a signed event right away.
        let secret = match self.source.secret_policy() {
            SecretPolicy::Generated => {
                let secret = generate_secret();
                self.host.store.set(&keys.webhook_secret, &secret).await?;
                Some(secret)
            }
            SecretPolicy::Handshake | SecretPolicy::Static(_) => None,
        };

        let registration = match self.source.create_webhook(&ctx, &url, secret.as_deref()).await {
            Ok(registration) => registration,
            Err(e) => {
                if let Err(cleanup) = self.host.network.delete_webhook(&url).await {
                    warn!("{}: failed to release endpoint {}: {:#}", self.source.name(), url, cleanup);
                }
                self.host.callbacks.delete(&token).await?;
                self.host.store.clear(&keys.webhook_callback).await?;
                self.host.store.clear(&keys.webhook_secret).await?;
                return Err(e);
            }
        };

        self.host.store.set(&keys.webhook_id, &registration).await?;
        info!(
            "{}: webhook {} registered for channel {}",
            self.source.name(),
            registration.webhook_id,
            channel_id
        );
        self.schedule_renewal(channel_id, &registration).await?;
        Ok(())
    }

    /// Unsubscribe the provider and release the host endpoint, logging failures.
    async fn teardown_webhook(&self, channel_id: &str) -> Result<()> {
        let keys = ChannelKeys::new(channel_id);
        let callback: Option<CallbackToken> = self.host.store.get(&keys.webhook_callback).await?;
        if let Some(token) = callback {
            self.host.callbacks.delete(&token).await?;
            self.host.store.clear(&keys.webhook_callback).await?;
        }

        let registration: Option<WebhookRegistration> = self.host.store.get(&keys.webhook_id).await?;
        let Some(registration) = registration else {
            return Ok(());
        };

        match self.context(channel_id).await {
            Ok(ctx) => {
                if let Err(e) = self.source.delete_webhook(&ctx, &registration).await {
                    warn!(
                        "{}: failed to delete webhook {}: {:#}",
                        self.source.name(),
                        registration.webhook_id,
                        e
                    );
                }
            }
            Err(e) => warn!(
                "{}: cannot delete webhook {} without a credential: {:#}",
                self.source.name(),
                registration.webhook_id,
                e
            ),
        }

        if let Err(e) = self.host.network.delete_webhook(&registration.url).await {
            warn!("{}: failed to release endpoint {}: {:#}", self.source.name(), registration.url, e);
        }
        Ok(())
    }

    /// Queue a renewal ahead of the registration's expiry, replacing any earlier one.
    pub(super) async fn schedule_renewal(&self, channel_id: &str, registration: &WebhookRegistration) -> Result<()> {
        let Some(renew_at) = registration.renew_at(self.settings.renewal_lead()) else {
            return Ok(());
        };
        self.replace_renewal_task(channel_id, renew_at.max(Utc::now())).await
    }

    pub(super) async fn replace_renewal_task(&self, channel_id: &str, run_at: chrono::DateTime<Utc>) -> Result<()> {
        let keys = ChannelKeys::new(channel_id);

        let previous: Option<TaskHandle> = self.host.store.get(&keys.renewal_task).await?;
        if let Some(handle) = previous {
            self.host.tasks.cancel_task(&handle).await?;
        }

        let handle = self.schedule(RENEW_WEBHOOK, channel_id, Some(run_at)).await?;
        self.host.store.set(&keys.renewal_task, &handle).await?;
        Ok(())
    }

    pub(super) fn lookback_start(&self) -> Option<chrono::DateTime<Utc>> {
        self.source.lookback().map(|lookback| Utc::now() - lookback)
    }
}
