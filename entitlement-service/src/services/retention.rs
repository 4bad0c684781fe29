//! Background pruning of the idempotency ledger and expired rate windows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tokio::task::JoinHandle;

use crate::services::metrics::record_pruned_rows;
use crate::services::store::{EntitlementStore, PruneStats};

/// Delete processed-event markers older than `retention_days` and rate-limit
/// windows that have expired at `now`.
pub async fn prune_once(
    store: &dyn EntitlementStore,
    retention_days: i64,
    now: DateTime<Utc>,
) -> Result<PruneStats, AppError> {
    let cutoff = now - chrono::Duration::days(retention_days);
    let stats = store.prune(cutoff, now).await?;

    record_pruned_rows("processed_events", stats.processed_events);
    record_pruned_rows("rate_limit_counters", stats.rate_counters);

    Ok(stats)
}

/// Run `prune_once` every `interval` until the runtime shuts down.
pub fn spawn_prune_task(
    store: Arc<dyn EntitlementStore>,
    retention_days: i64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = prune_once(store.as_ref(), retention_days, Utc::now()).await {
                tracing::warn!(error = %e, "Retention prune failed");
            }
        }
    })
}
