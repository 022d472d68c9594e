use std::time::Duration;

use tracing::{debug, info, warn};

use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::Store;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have
/// accumulated since the last rewrite.
pub async fn run_compactor(store: Store, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&store, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// One compactor pass. Returns the snapshot size when a rewrite happened.
pub async fn compact_if_due(
    store: &Store,
    threshold: u64,
) -> Result<Option<usize>, crate::store::StoreError> {
    let appends = store.wal_appends_since_compact().await?;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return Ok(None);
    }
    let records = store.compact().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!(appends, records, "WAL compacted");
    Ok(Some(records))
}
