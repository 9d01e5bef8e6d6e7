//! Background TTL pruner for the session and token tables.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::store::SessionStore;

/// Spawns the pruning task. Every `interval` it deletes all rows past
/// their `expires_at`. Pruning is idempotent, so overlapping pruners on
/// other replicas are harmless; an error is logged and retried on the next
/// wake.
pub fn spawn(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // Discard the immediate first tick.

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("pruner stopping");
                    return;
                }
            }
            match store.prune_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "pruned expired rows"),
                Err(e) => tracing::warn!(error = %e, "prune pass failed"),
            }
        }
    })
}
