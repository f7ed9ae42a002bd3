use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::store::JournaledStore;
use crate::trigger::TriggerHandler;

/// Periodically re-validate every project, catching results made stale by
/// concurrent writes that each validated against an older snapshot.
pub async fn run_revalidator(handler: Arc<TriggerHandler>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; skip it so startup isn't a full sweep.
    interval.tick().await;
    loop {
        interval.tick().await;
        match handler.revalidate_all().await {
            Ok(0) => debug!("revalidation sweep: nothing changed"),
            Ok(written) => info!("revalidation sweep wrote {written} patches"),
            Err(e) => warn!("revalidation sweep failed: {e}"),
        }
    }
}

/// Compact the journal whenever `threshold` appends have accumulated.
pub async fn run_compactor(store: Arc<JournaledStore>, threshold: u64, check_every: Duration) {
    let mut interval = tokio::time::interval(check_every);
    loop {
        interval.tick().await;
        let appends = match store.appends_since_compact().await {
            Ok(n) => n,
            Err(e) => {
                warn!("compactor stopped: {e}");
                return;
            }
        };
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(records) => {
                metrics::counter!(crate::observability::JOURNAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted journal: {appends} appends -> {records} records");
            }
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}
