//! Inbound webhooks: handshake, verification, routing and renewal.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::host::StoreExt;
use crate::providers::{SecretPolicy, SyncSource, WebhookAction};
use crate::state::{ChannelKeys, WebhookRegistration};
use crate::webhook::{WebhookRequest, WebhookResponse};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Subscription handshake answered; nothing else was done.
    Handshake(WebhookResponse),
    /// Missing secret or bad signature. The event was dropped.
    Rejected,
    /// The channel is not enabled.
    Ignored,
    Processed { upserts: usize, sync_started: bool },
}

impl IngestOutcome {
    /// The HTTP reply for the host's webhook bridge.
    ///
    /// Dropped events are still acknowledged so providers don't redeliver them.
    pub fn into_response(self) -> WebhookResponse {
        match self {
            IngestOutcome::Handshake(response) => response,
            _ => WebhookResponse::ok(),
        }
    }
}

impl<S: SyncSource> SyncEngine<S> {
    pub async fn on_webhook(&self, channel_id: &str, request: &WebhookRequest) -> Result<IngestOutcome> {
        let keys = ChannelKeys::new(channel_id);

        if let Some(handshake) = self.source.handshake(request) {
            if let Some(secret) = &handshake.secret {
                // Only while the subscription is being created; an established one keeps its secret.
                let registered: Option<WebhookRegistration> = self.host.store.get(&keys.webhook_id).await?;
                if registered.is_none() {
                    self.host.store.set(&keys.webhook_secret, secret).await?;
                    info!("{}: stored webhook secret for channel {}", self.source.name(), channel_id);
                } else {
                    warn!(
                        "{}: ignoring handshake secret for channel {} with an active webhook",
                        self.source.name(),
                        channel_id
                    );
                }
            }
            return Ok(IngestOutcome::Handshake(handshake.response));
        }

        let enabled: Option<bool> = self.host.store.get(&keys.sync_enabled).await?;
        if enabled != Some(true) {
            debug!("{}: webhook for disabled channel {}, ignoring", self.source.name(), channel_id);
            return Ok(IngestOutcome::Ignored);
        }

        let secret = match self.source.secret_policy() {
            SecretPolicy::Static(secret) => Some(secret),
            SecretPolicy::Generated | SecretPolicy::Handshake => self.host.store.get(&keys.webhook_secret).await?,
        };
        let Some(secret) = secret else {
            warn!(
                "{}: no webhook secret for channel {}, dropping event",
                self.source.name(),
                channel_id
            );
            return Ok(IngestOutcome::Rejected);
        };

        if !self.source.verify(request, &secret) {
            warn!(
                "{}: webhook signature mismatch for channel {}, dropping event",
                self.source.name(),
                channel_id
            );
            return Ok(IngestOutcome::Rejected);
        }

        self.renew_if_expiring(channel_id).await;

        let ctx = self.context(channel_id).await?;
        let actions = self.source.route(&ctx, request).await?;

        let mut upserts = 0;
        let mut sync_started = false;
        for action in actions {
            match action {
                WebhookAction::Upsert(link) => {
                    let mut link = *link;
                    self.stamp(channel_id, &mut link);
                    self.host.integrations.save_link(link).await?;
                    upserts += 1;
                }
                WebhookAction::IncrementalSync => {
                    if !sync_started {
                        sync_started = self.start_incremental_sync(channel_id).await?;
                    }
                }
                WebhookAction::Ignore => {}
            }
        }

        debug!(
            "{}: webhook for channel {} processed ({} upserts, sync started: {})",
            self.source.name(),
            channel_id,
            upserts,
            sync_started
        );
        Ok(IngestOutcome::Processed { upserts, sync_started })
    }

    /// Re-subscribe the channel's webhook and schedule the next renewal.
    pub async fn renew_webhook(&self, channel_id: &str) -> Result<()> {
        let keys = ChannelKeys::new(channel_id);
        let registration: Option<WebhookRegistration> = self.host.store.get(&keys.webhook_id).await?;
        let Some(registration) = registration else {
            debug!("{}: no webhook to renew for channel {}", self.source.name(), channel_id);
            return Ok(());
        };

        let secret: Option<String> = match self.source.secret_policy() {
            SecretPolicy::Static(secret) => Some(secret),
            _ => self.host.store.get(&keys.webhook_secret).await?,
        };

        let ctx = self.context(channel_id).await?;
        match self
            .source
            .renew_webhook(&ctx, &registration, secret.as_deref())
            .await?
        {
            Some(renewed) => {
                info!(
                    "{}: renewed webhook for channel {} until {:?}",
                    self.source.name(),
                    channel_id,
                    renewed.expires_at
                );
                self.host.store.set(&keys.webhook_id, &renewed).await?;
                self.schedule_renewal(channel_id, &renewed).await?;
            }
            None => debug!("{}: webhook for channel {} is not renewable", self.source.name(), channel_id),
        }
        Ok(())
    }

    /// Queue an immediate renewal when expiry is near, so the delivery never
    /// waits on the provider. Never fails the delivery.
    async fn renew_if_expiring(&self, channel_id: &str) {
        let keys = ChannelKeys::new(channel_id);
        let registration: Option<WebhookRegistration> = match self.host.store.get(&keys.webhook_id).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!("{}: cannot read webhook registration: {:#}", self.source.name(), e);
                return;
            }
        };

        let expiring = registration
            .map(|r| r.expiring_within(self.settings.renewal_lead(), Utc::now()))
            .unwrap_or(false);
        if expiring {
            info!("{}: webhook for channel {} expires soon, queueing renewal", self.source.name(), channel_id);
            if let Err(e) = self.replace_renewal_task(channel_id, Utc::now()).await {
                warn!("{}: cannot queue webhook renewal for channel {}: {:#}", self.source.name(), channel_id, e);
            }
        }
    }
}
