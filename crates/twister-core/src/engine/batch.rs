//! One step of the cursor-driven pagination loop.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{SyncEngine, SYNC_BATCH};
use crate::error::{sync_error, SyncError};
use crate::host::StoreExt;
use crate::providers::{Continuation, SourceContext, SyncSource};
use crate::state::{ChannelKeys, Cursor, SyncLock, SyncState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// No state for the channel: the run already finished or was stopped.
    Superseded,
    /// Next batch scheduled.
    Continued { batch_number: u32, items_processed: u64 },
    /// Pagination exhausted and state cleared.
    Completed { items_processed: u64 },
}

impl<S: SyncSource> SyncEngine<S> {
    /// Run one batch for `channel_id`.
    ///
    /// Errors propagate so the host can retry the task; upserts are keyed by
    /// stable sources, so re-running a batch is safe.
    pub async fn sync_batch(&self, channel_id: &str) -> Result<BatchOutcome> {
        let keys = ChannelKeys::new(channel_id);
        let state: Option<SyncState> = self.host.store.get(&keys.sync_state).await?;
        let Some(state) = state else {
            debug!("{}: no sync state for channel {}, batch superseded", self.source.name(), channel_id);
            return Ok(BatchOutcome::Superseded);
        };

        match self.run_batch(channel_id, state.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.record_failure(&keys, state, &e).await?;
                Err(e)
            }
        }
    }

    /// Whether the stored state still belongs to `state`'s run.
    async fn still_current(&self, keys: &ChannelKeys, state: &SyncState) -> Result<bool> {
        let current: Option<SyncState> = self.host.store.get(&keys.sync_state).await?;
        Ok(current.map(|current| state.same_run(&current)).unwrap_or(false))
    }

    async fn run_batch(&self, channel_id: &str, mut state: SyncState) -> Result<BatchOutcome> {
        let keys = ChannelKeys::new(channel_id);
        let ctx = self.context(channel_id).await?;

        info!(
            "{}: channel {} batch {} (phase {:?})",
            self.source.name(),
            channel_id,
            state.batch_number,
            state.phase
        );

        let page = match self.source.fetch_page(&ctx, &state).await {
            Ok(page) => page,
            Err(e) if matches!(sync_error(&e), Some(SyncError::ChangeTokenExpired { .. })) => {
                return self.restart_full_scan(channel_id, state).await;
            }
            Err(e) => return Err(e),
        };

        let fetched = page.items.len();
        let saved = self.upsert_items(&ctx, &state, page.items).await?;
        state.items_processed += saved;

        // A stop or a replacing run during this batch owns the state now; don't overwrite it.
        if !self.still_current(&keys, &state).await? {
            debug!("{}: channel {} stopped or replaced mid-batch", self.source.name(), channel_id);
            return Ok(BatchOutcome::Superseded);
        }

        match page.next {
            Continuation::More(cursor) => {
                state.cursor = cursor;
                self.continue_run(channel_id, state).await
            }
            Continuation::Phase { phase, cursor } => {
                info!("{}: channel {} entering phase {}", self.source.name(), channel_id, phase);
                state.phase = Some(phase);
                state.cursor = cursor;
                self.continue_run(channel_id, state).await
            }
            Continuation::Done { change_token } => {
                self.host.store.clear(&keys.sync_state).await?;
                self.host.store.clear(&keys.sync_lock).await?;
                if let Some(token) = change_token {
                    self.host.store.set(&keys.last_sync_token, &token).await?;
                }
                info!(
                    "{}: channel {} sync complete, {} items in {} batches ({} in last page)",
                    self.source.name(),
                    channel_id,
                    state.items_processed,
                    state.batch_number,
                    fetched
                );
                Ok(BatchOutcome::Completed {
                    items_processed: state.items_processed,
                })
            }
        }
    }

    /// Transform and save each item. Per-item failures are logged and skipped.
    async fn upsert_items(&self, ctx: &SourceContext, state: &SyncState, items: Vec<S::Item>) -> Result<u64> {
        let mut saved = 0;
        for item in items {
            let mut link = match self.source.transform(ctx, item).await {
                Ok(Some(link)) => link,
                Ok(None) => continue,
                Err(e) => {
                    if sync_error(&e).map(SyncError::is_terminal).unwrap_or(false) {
                        return Err(e);
                    }
                    warn!("{}: skipping item on channel {}: {:#}", self.source.name(), ctx.channel_id, e);
                    continue;
                }
            };

            self.stamp(&ctx.channel_id, &mut link);
            // Historical backfill must not notify; incremental runs keep the user's state.
            if state.initial_sync {
                link.unread = Some(false);
                link.archived = Some(false);
            } else {
                link.unread = None;
                link.archived = None;
            }

            self.host.integrations.save_link(link).await?;
            saved += 1;
        }
        Ok(saved)
    }

    async fn continue_run(&self, channel_id: &str, mut state: SyncState) -> Result<BatchOutcome> {
        let keys = ChannelKeys::new(channel_id);
        state.batch_number += 1;
        state.failures = 0;
        self.host.store.set(&keys.sync_state, &state).await?;
        // Progress refreshes the lock so long backfills don't go stale.
        self.host.store.set(&keys.sync_lock, &SyncLock::now()).await?;

        let run_at = self.settings.batch_delay().map(|delay| Utc::now() + delay);
        self.schedule(SYNC_BATCH, channel_id, run_at).await?;

        Ok(BatchOutcome::Continued {
            batch_number: state.batch_number,
            items_processed: state.items_processed,
        })
    }

    /// The server no longer accepts our change token: rescan everything, quietly.
    async fn restart_full_scan(&self, channel_id: &str, state: SyncState) -> Result<BatchOutcome> {
        let keys = ChannelKeys::new(channel_id);
        warn!(
            "{}: change token expired for channel {}, restarting full sync",
            self.source.name(),
            channel_id
        );
        if !self.still_current(&keys, &state).await? {
            return Ok(BatchOutcome::Superseded);
        }
        self.host.store.clear(&keys.last_sync_token).await?;

        let restarted = SyncState {
            cursor: Cursor::Start,
            batch_number: state.batch_number,
            items_processed: state.items_processed,
            initial_sync: false,
            phase: None,
            change_token: None,
            time_min: self.lookback_start(),
            failures: 0,
            run_id: state.run_id,
        };
        self.continue_run(channel_id, restarted).await
    }

    /// Count the failure. The lock is kept while the host retries, so no other
    /// run starts; terminal errors, or too many failures in a row, end the run
    /// and release it.
    pub(super) async fn record_failure(&self, keys: &ChannelKeys, mut state: SyncState, err: &anyhow::Error) -> Result<()> {
        if !self.still_current(keys, &state).await? {
            debug!("{}: failed batch belongs to a replaced run, leaving state alone", self.source.name());
            return Ok(());
        }

        let terminal = sync_error(err).map(SyncError::is_terminal).unwrap_or(false);
        state.failures += 1;
        let exhausted = self
            .settings
            .max_batch_failures
            .map(|max| state.failures >= max)
            .unwrap_or(false);

        if terminal || exhausted {
            warn!(
                "{}: abandoning sync run after {} failed attempt(s): {:#}",
                self.source.name(),
                state.failures,
                err
            );
            self.host.store.clear(&keys.sync_state).await?;
            self.host.store.clear(&keys.sync_lock).await?;
            return Ok(());
        }

        self.host.store.set(&keys.sync_state, &state).await?;
        warn!(
            "{}: batch {} failed (attempt {}), leaving it to the host to retry: {:#}",
            self.source.name(),
            state.batch_number,
            state.failures,
            err
        );
        Ok(())
    }
}
