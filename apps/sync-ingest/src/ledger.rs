use std::sync::Arc;

use chrono::Utc;
use ingest_sdk::model::{DataKind, SyncLedgerEntry, SyncStatus};
use tracing::warn;

use crate::store::{LedgerStore, LedgerUpdate, StoreError};

/// Writes per-(device, kind) sync outcomes. Write failures are logged and
/// swallowed; the job they describe is already terminal.
#[derive(Clone)]
pub struct SyncLedger {
    store: Arc<dyn LedgerStore>,
}

pub fn summary_message(processed: u32, failed: u32) -> String {
    if failed > 0 {
        format!("{processed} processed, {failed} failed")
    } else {
        format!("{processed} items processed successfully")
    }
}

impl SyncLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn record_outcome(
        &self,
        device_id: &str,
        data_kind: DataKind,
        processed: u32,
        failed: u32,
    ) -> Option<SyncLedgerEntry> {
        let status = if failed > 0 {
            SyncStatus::PartialSuccess
        } else {
            SyncStatus::Success
        };
        self.write(LedgerUpdate {
            device_id: device_id.to_string(),
            data_kind,
            last_sync_time: Utc::now(),
            item_count: processed,
            status,
            message: summary_message(processed, failed),
        })
        .await
    }

    pub async fn record_failure(
        &self,
        device_id: &str,
        data_kind: DataKind,
        message: &str,
    ) -> Option<SyncLedgerEntry> {
        self.write(LedgerUpdate {
            device_id: device_id.to_string(),
            data_kind,
            last_sync_time: Utc::now(),
            item_count: 0,
            status: SyncStatus::Failed,
            message: message.to_string(),
        })
        .await
    }

    pub async fn get_or_create(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<SyncLedgerEntry, StoreError> {
        self.store.get_or_create_entry(device_id, data_kind).await
    }

    pub async fn entries(&self, device_id: &str) -> Result<Vec<SyncLedgerEntry>, StoreError> {
        self.store.device_entries(device_id).await
    }

    async fn write(&self, update: LedgerUpdate) -> Option<SyncLedgerEntry> {
        let device_id = update.device_id.clone();
        let data_kind = update.data_kind;
        match self.store.record_sync(update).await {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(
                    error = %err,
                    device_id = %device_id,
                    kind = %data_kind,
                    "failed to update sync ledger"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn summary_wording() {
        assert_eq!(summary_message(590, 10), "590 processed, 10 failed");
        assert_eq!(summary_message(1200, 0), "1200 items processed successfully");
    }

    #[tokio::test]
    async fn outcome_and_failure_overwrite_the_same_entry() {
        let store = MemoryStore::new();
        let ledger = SyncLedger::new(store.clone());

        let fresh = ledger.get_or_create("D1", DataKind::Messages).await.unwrap();
        assert_eq!(fresh.item_count, 0);
        assert!(fresh.last_sync_time.is_none());

        let entry = ledger
            .record_outcome("D1", DataKind::Messages, 590, 10)
            .await
            .unwrap();
        assert_eq!(entry.last_sync_status, SyncStatus::PartialSuccess);
        assert_eq!(entry.item_count, 590);

        let entry = ledger
            .record_failure("D1", DataKind::Messages, "batch 0: store unavailable")
            .await
            .unwrap();
        assert_eq!(entry.last_sync_status, SyncStatus::Failed);
        assert_eq!(entry.item_count, 0);
        assert_eq!(ledger.entries("D1").await.unwrap().len(), 1);
    }
}
