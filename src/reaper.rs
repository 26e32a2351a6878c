use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::clock::Clock;
use crate::model::Ms;
use crate::store::{Compactable, ReservationStore};

const PURGE_DEADLINE: Duration = Duration::from_secs(5);

/// Purge cancelled reservations older than `retention_ms` once. Returns how
/// many records were removed.
pub async fn purge_expired(store: &ReservationStore, now: Ms, retention_ms: Ms) -> usize {
    let cutoff = now.saturating_sub(retention_ms);
    let mut purged = 0;
    for record_id in store.collect_purgeable(cutoff).await {
        match store.purge(&record_id, Instant::now() + PURGE_DEADLINE).await {
            Ok(true) => purged += 1,
            Ok(false) => {}
            Err(e) => tracing::debug!("reaper skip {record_id}: {e}"),
        }
    }
    if purged > 0 {
        info!("reaped {purged} cancelled reservations");
        metrics::counter!(crate::observability::RESERVATIONS_PURGED_TOTAL).increment(purged as u64);
    }
    purged
}

/// Background task that periodically purges old cancellations.
pub async fn run_reaper(store: Arc<ReservationStore>, clock: Arc<dyn Clock>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        purge_expired(&store, clock.now_ms(), retention_ms).await;
    }
}

/// Background task that rewrites a store's WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<dyn Compactable>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!("{}: compacted WAL after {appends} appends", store.store_name()),
            Err(e) => tracing::warn!("{}: WAL compaction failed: {e}", store.store_name()),
        }
    }
}
