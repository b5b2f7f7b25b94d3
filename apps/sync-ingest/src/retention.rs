use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::RETENTION_PURGED;
use crate::store::{QueueStore, StoreError};

/// Deletes queue records older than `retention`, whatever their status.
pub async fn sweep_once(
    queue: &dyn QueueStore,
    retention: chrono::Duration,
) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - retention;
    let purged = queue.purge_expired(cutoff).await?;
    RETENTION_PURGED.inc_by(purged);
    if purged > 0 {
        info!(purged, cutoff = %cutoff, "expired queue records removed");
    } else {
        debug!(cutoff = %cutoff, "retention sweep found nothing to remove");
    }
    Ok(purged)
}

pub fn spawn_retention_sweeper(
    queue: Arc<dyn QueueStore>,
    retention_days: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let retention = chrono::Duration::days(retention_days.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = sweep_once(queue.as_ref(), retention).await {
                        warn!(error = %err, "retention sweep failed");
                    }
                }
            }
        }
    })
}
