use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_sdk::model::{DataKind, GroupBreakdown, QueueStatus, SyncLedgerEntry};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    DeleteOutcome, Grouping, JobProgress, LedgerStore, LedgerUpdate, NewQueueRecord, Page,
    QueueFilter, QueueRecord, QueueStore, RecordStore, ResetOutcome, StoreError, StoredRecord,
    ABANDONED_MESSAGE, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS,
};

type RecordKey = (DataKind, String, String);

#[derive(Default)]
struct RecordTable {
    rows: HashMap<Uuid, StoredRecord>,
    by_key: HashMap<RecordKey, Uuid>,
}

/// Process-local backend. Queue records are kept in insertion order so that
/// ties on `created_at` still resolve oldest first.
#[derive(Default)]
pub struct MemoryStore {
    queue: Mutex<Vec<QueueRecord>>,
    ledger: Mutex<HashMap<(String, DataKind), SyncLedgerEntry>>,
    records: Mutex<RecordTable>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Test hook for aging records past the retention or staleness window.
    pub async fn backdate(&self, id: Uuid, at: DateTime<Utc>) -> bool {
        let mut queue = self.queue.lock().await;
        match queue.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.created_at = at;
                record.updated_at = at;
                true
            }
            None => false,
        }
    }
}

fn with_record<T>(
    queue: &mut [QueueRecord],
    id: Uuid,
    f: impl FnOnce(&mut QueueRecord) -> T,
) -> Result<T, StoreError> {
    queue
        .iter_mut()
        .find(|r| r.id == id)
        .map(f)
        .ok_or(StoreError::NotFound(id))
}

fn apply_progress(record: &mut QueueRecord, progress: &JobProgress, now: DateTime<Utc>) {
    record.processed_count = progress.processed;
    record.failed_count = progress.failed;
    record.error_message = progress.error_message();
    record.status = progress.status();
    record.updated_at = now;
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, job: NewQueueRecord) -> Result<QueueRecord, StoreError> {
        let now = Utc::now();
        let record = QueueRecord {
            id: Uuid::new_v4(),
            item_count: job.item_count(),
            device_id: job.device_id,
            data_kind: job.data_kind,
            payload: job.payload,
            batch_size: DEFAULT_BATCH_SIZE,
            status: QueueStatus::Pending,
            priority: job.priority,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            processed_count: 0,
            failed_count: 0,
            error_message: None,
            processing_started_at: None,
            processing_completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.queue.lock().await.push(record.clone());
        Ok(record)
    }

    async fn claim_next(&self) -> Result<Option<QueueRecord>, StoreError> {
        let mut queue = self.queue.lock().await;
        let candidate = queue
            .iter_mut()
            .filter(|r| r.status == QueueStatus::Pending && r.attempts < r.max_attempts)
            .min_by_key(|r| (Reverse(r.priority), r.created_at));
        Ok(candidate.map(|record| {
            let now = Utc::now();
            record.status = QueueStatus::Processing;
            record.attempts += 1;
            record.processing_started_at = Some(now);
            record.updated_at = now;
            record.clone()
        }))
    }

    async fn begin_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut queue = self.queue.lock().await;
        with_record(&mut queue, id, |record| {
            record.attempts += 1;
            record.updated_at = Utc::now();
            record.attempts
        })
    }

    async fn write_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        with_record(&mut queue, id, |record| {
            apply_progress(record, progress, Utc::now())
        })
    }

    async fn mark_finished(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        with_record(&mut queue, id, |record| {
            let now = Utc::now();
            apply_progress(record, progress, now);
            record.processing_completed_at = Some(now);
        })
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        let mut queue = self.queue.lock().await;
        with_record(&mut queue, id, |record| {
            let now = Utc::now();
            record.status = QueueStatus::Failed;
            record.error_message = Some(message.to_string());
            record.processing_completed_at = Some(now);
            record.updated_at = now;
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueRecord>, StoreError> {
        let queue = self.queue.lock().await;
        Ok(queue.iter().find(|r| r.id == id).cloned())
    }

    async fn list(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<(Vec<QueueRecord>, u64), StoreError> {
        let queue = self.queue.lock().await;
        let mut matching: Vec<&QueueRecord> =
            queue.iter().rev().filter(|r| filter.matches(r)).collect();
        matching.sort_by_key(|r| Reverse(r.created_at));
        let total = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .map(|r| QueueRecord {
                payload: Value::Null,
                ..r.clone()
            })
            .collect();
        Ok((rows, total))
    }

    async fn breakdown(&self, grouping: Grouping) -> Result<Vec<GroupBreakdown>, StoreError> {
        let queue = self.queue.lock().await;
        let mut groups: BTreeMap<String, GroupBreakdown> = BTreeMap::new();
        for record in queue.iter() {
            let key = match grouping {
                Grouping::Status => record.status.as_str().to_string(),
                Grouping::Device => record.device_id.clone(),
                Grouping::Kind => record.data_kind.as_str().to_string(),
            };
            let row = groups.entry(key.clone()).or_insert_with(|| GroupBreakdown {
                key,
                count: 0,
                total_data_count: 0,
                total_processed_count: 0,
                total_failed_count: 0,
            });
            row.count += 1;
            row.total_data_count += record.item_count as u64;
            row.total_processed_count += record.processed_count as u64;
            row.total_failed_count += record.failed_count as u64;
        }
        Ok(groups.into_values().collect())
    }

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, StoreError> {
        let mut queue = self.queue.lock().await;
        let Some(pos) = queue.iter().position(|r| r.id == id) else {
            return Ok(DeleteOutcome::Missing);
        };
        match queue[pos].status {
            status @ (QueueStatus::Processing | QueueStatus::Completed) => {
                Ok(DeleteOutcome::Refused(status))
            }
            _ => {
                queue.remove(pos);
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    async fn delete_failed(&self) -> Result<u64, StoreError> {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|r| r.status != QueueStatus::Failed);
        Ok((before - queue.len()) as u64)
    }

    async fn reset_failed(&self, id: Uuid) -> Result<ResetOutcome, StoreError> {
        let mut queue = self.queue.lock().await;
        let Some(record) = queue.iter_mut().find(|r| r.id == id) else {
            return Ok(ResetOutcome::Missing);
        };
        if record.status != QueueStatus::Failed {
            return Ok(ResetOutcome::Refused(record.status));
        }
        record.status = QueueStatus::Pending;
        record.attempts = 0;
        record.processed_count = 0;
        record.failed_count = 0;
        record.error_message = None;
        record.processing_started_at = None;
        record.processing_completed_at = None;
        record.updated_at = Utc::now();
        Ok(ResetOutcome::Reset)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|r| r.created_at >= cutoff);
        Ok((before - queue.len()) as u64)
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut queue = self.queue.lock().await;
        let now = Utc::now();
        let mut recovered = 0;
        for record in queue.iter_mut().filter(|r| is_stranded(r, cutoff)) {
            if record.attempts < record.max_attempts {
                record.status = QueueStatus::Pending;
                record.processing_started_at = None;
            } else {
                record.status = QueueStatus::Failed;
                record.error_message = Some(ABANDONED_MESSAGE.to_string());
                record.processing_completed_at = Some(now);
            }
            record.updated_at = now;
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn is_stranded(record: &QueueRecord, cutoff: DateTime<Utc>) -> bool {
    !matches!(record.status, QueueStatus::Pending | QueueStatus::Failed)
        && record.processing_completed_at.is_none()
        && record.updated_at < cutoff
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ledger_entry(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<Option<SyncLedgerEntry>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.get(&(device_id.to_string(), data_kind)).cloned())
    }

    async fn get_or_create_entry(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<SyncLedgerEntry, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let entry = ledger
            .entry((device_id.to_string(), data_kind))
            .or_insert_with(|| SyncLedgerEntry::fresh(device_id, data_kind));
        Ok(entry.clone())
    }

    async fn record_sync(&self, update: LedgerUpdate) -> Result<SyncLedgerEntry, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let entry = ledger
            .entry((update.device_id.clone(), update.data_kind))
            .or_insert_with(|| SyncLedgerEntry::fresh(&update.device_id, update.data_kind));
        entry.last_sync_time = Some(update.last_sync_time);
        entry.item_count = update.item_count;
        entry.last_sync_status = update.status;
        entry.last_sync_message = update.message;
        Ok(entry.clone())
    }

    async fn device_entries(&self, device_id: &str) -> Result<Vec<SyncLedgerEntry>, StoreError> {
        let ledger = self.ledger.lock().await;
        let mut entries: Vec<SyncLedgerEntry> = ledger
            .values()
            .filter(|e| e.device_id == device_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.data_kind.as_str().cmp(b.data_kind.as_str()));
        Ok(entries)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let table = self.records.lock().await;
        let key = (data_kind, device_id.to_string(), natural_key.to_string());
        Ok(table
            .by_key
            .get(&key)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn insert_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
        fields: Map<String, Value>,
    ) -> Result<StoredRecord, StoreError> {
        let mut table = self.records.lock().await;
        let key = (data_kind, device_id.to_string(), natural_key.to_string());
        if table.by_key.contains_key(&key) {
            return Err(StoreError::Constraint(format!(
                "duplicate {data_kind} record {natural_key} for device {device_id}"
            )));
        }
        let now = Utc::now();
        let record = StoredRecord {
            id: Uuid::new_v4(),
            data_kind,
            device_id: device_id.to_string(),
            natural_key: natural_key.to_string(),
            fields,
            created_at: now,
            updated_at: now,
        };
        table.by_key.insert(key, record.id);
        table.rows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_record(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError> {
        let mut table = self.records.lock().await;
        let record = table.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.fields.extend(fields);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn count_records(&self, data_kind: DataKind, device_id: &str) -> Result<u64, StoreError> {
        let table = self.records.lock().await;
        Ok(table
            .rows
            .values()
            .filter(|r| r.data_kind == data_kind && r.device_id == device_id)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ingest_sdk::model::SyncStatus;
    use serde_json::json;

    fn job(device: &str, n: usize) -> NewQueueRecord {
        let items = (0..n).map(|i| json!({"contactId": i.to_string()})).collect();
        NewQueueRecord::new(device, DataKind::Contacts, items)
    }

    #[tokio::test]
    async fn enqueue_stamps_defaults() {
        let store = MemoryStore::new();
        let rec = store.enqueue(job("D1", 3)).await.unwrap();
        assert_eq!(rec.status, QueueStatus::Pending);
        assert_eq!(rec.item_count, 3);
        assert_eq!(rec.batch_size, 100);
        assert_eq!(rec.attempts, 0);
        assert_eq!(rec.max_attempts, 3);
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_age() {
        let store = MemoryStore::new();
        let first = store.enqueue(job("D1", 1)).await.unwrap();
        let second = store.enqueue(job("D2", 1)).await.unwrap();
        let urgent = store.enqueue(job("D3", 1).with_priority(5)).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, urgent.id);
        assert_eq!(claimed.status, QueueStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.processing_started_at.is_some());

        assert_eq!(store.claim_next().await.unwrap().unwrap().id, first.id);
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, second.id);
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_exhausted_records() {
        let store = MemoryStore::new();
        let rec = store.enqueue(job("D1", 1)).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        assert_eq!(store.begin_retry(rec.id).await.unwrap(), 2);
        assert_eq!(store.begin_retry(rec.id).await.unwrap(), 3);
        store.mark_failed(rec.id, "boom").await.unwrap();
        store.reset_failed(rec.id).await.unwrap();
        {
            let mut queue = store.queue.lock().await;
            queue[0].attempts = 3;
        }
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_and_terminal_writes() {
        let store = MemoryStore::new();
        let rec = store.enqueue(job("D1", 200)).await.unwrap();
        store.claim_next().await.unwrap();

        let mut progress = JobProgress {
            processed: 99,
            failed: 1,
            errors: vec!["Contact 7: missing field `name`".into()],
        };
        store.write_progress(rec.id, &progress).await.unwrap();
        let snap = store.get(rec.id).await.unwrap().unwrap();
        assert_eq!(snap.status, QueueStatus::PartiallyCompleted);
        assert!(snap.processing_completed_at.is_none());

        progress.processed = 199;
        store.mark_finished(rec.id, &progress).await.unwrap();
        let done = store.get(rec.id).await.unwrap().unwrap();
        assert_eq!(done.processed_count, 199);
        assert_eq!(done.failed_count, 1);
        assert!(done.processing_completed_at.is_some());
    }

    #[tokio::test]
    async fn delete_refuses_active_and_completed() {
        let store = MemoryStore::new();
        let pending = store.enqueue(job("D1", 1)).await.unwrap();
        let running = store.enqueue(job("D2", 1)).await.unwrap();
        {
            let mut queue = store.queue.lock().await;
            queue[1].status = QueueStatus::Processing;
        }
        assert_eq!(
            store.delete(running.id).await.unwrap(),
            DeleteOutcome::Refused(QueueStatus::Processing)
        );
        assert_eq!(store.delete(pending.id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete(pending.id).await.unwrap(), DeleteOutcome::Missing);
    }

    #[tokio::test]
    async fn delete_failed_and_reset() {
        let store = MemoryStore::new();
        let a = store.enqueue(job("D1", 1)).await.unwrap();
        let b = store.enqueue(job("D1", 1)).await.unwrap();
        store.enqueue(job("D1", 1)).await.unwrap();
        store.mark_failed(a.id, "x").await.unwrap();
        store.mark_failed(b.id, "y").await.unwrap();

        assert_eq!(store.reset_failed(b.id).await.unwrap(), ResetOutcome::Reset);
        let reset = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(reset.status, QueueStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.error_message.is_none());
        assert_eq!(
            store.reset_failed(b.id).await.unwrap(),
            ResetOutcome::Refused(QueueStatus::Pending)
        );

        assert_eq!(store.delete_failed().await.unwrap(), 1);
        assert_eq!(store.queue_len().await, 2);
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let store = MemoryStore::new();
        let retry = store.enqueue(job("D1", 1)).await.unwrap();
        let spent = store.enqueue(job("D2", 1)).await.unwrap();
        let live = store.enqueue(job("D3", 1)).await.unwrap();
        for _ in 0..3 {
            store.claim_next().await.unwrap().unwrap();
        }
        store.begin_retry(spent.id).await.unwrap();
        store.begin_retry(spent.id).await.unwrap();
        let hour_ago = Utc::now() - Duration::hours(1);
        store.backdate(retry.id, hour_ago).await;
        store.backdate(spent.id, hour_ago).await;

        let cutoff = Utc::now() - Duration::minutes(30);
        assert_eq!(store.recover_stale(cutoff).await.unwrap(), 2);

        let requeued = store.get(retry.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        let failed = store.get(spent.id).await.unwrap().unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(ABANDONED_MESSAGE));
        assert_eq!(
            store.get(live.id).await.unwrap().unwrap().status,
            QueueStatus::Processing
        );
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, retry.id);
        assert_eq!(store.recover_stale(cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_drops_old_records() {
        let store = MemoryStore::new();
        let old = store.enqueue(job("D1", 1)).await.unwrap();
        store.enqueue(job("D1", 1)).await.unwrap();
        assert!(store.backdate(old.id, Utc::now() - Duration::days(8)).await);
        let purged = store
            .purge_expired(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(old.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_pages_newest_first_without_payload() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(store.enqueue(job(&format!("D{}", i % 2), 2)).await.unwrap().id);
        }
        let (rows, total) = store
            .list(&QueueFilter::default(), Page { page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, ids[4]);
        assert!(rows[0].payload.is_null());

        let filter = QueueFilter {
            device_id: Some("D1".into()),
            ..QueueFilter::default()
        };
        let (rows, total) = store.list(&filter, Page::default()).await.unwrap();
        assert_eq!(total, 2);
        assert!(rows.iter().all(|r| r.device_id == "D1"));
    }

    #[tokio::test]
    async fn breakdown_sums_counts() {
        let store = MemoryStore::new();
        let a = store.enqueue(job("D1", 10)).await.unwrap();
        store.enqueue(job("D2", 5)).await.unwrap();
        store
            .mark_finished(
                a.id,
                &JobProgress {
                    processed: 10,
                    ..JobProgress::default()
                },
            )
            .await
            .unwrap();

        let by_status = store.breakdown(Grouping::Status).await.unwrap();
        let completed = by_status.iter().find(|g| g.key == "completed").unwrap();
        assert_eq!(completed.count, 1);
        assert_eq!(completed.total_processed_count, 10);
        let pending = by_status.iter().find(|g| g.key == "pending").unwrap();
        assert_eq!(pending.total_data_count, 5);

        let by_device = store.breakdown(Grouping::Device).await.unwrap();
        assert_eq!(by_device.len(), 2);
    }

    #[tokio::test]
    async fn ledger_is_unique_per_device_and_kind() {
        let store = MemoryStore::new();
        let fresh = store
            .get_or_create_entry("D1", DataKind::Contacts)
            .await
            .unwrap();
        assert!(fresh.last_sync_time.is_none());
        assert!(fresh.is_enabled);

        for count in [10, 20] {
            store
                .record_sync(LedgerUpdate {
                    device_id: "D1".into(),
                    data_kind: DataKind::Contacts,
                    last_sync_time: Utc::now(),
                    item_count: count,
                    status: SyncStatus::Success,
                    message: format!("{count} items processed successfully"),
                })
                .await
                .unwrap();
        }
        let entries = store.device_entries("D1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].item_count, 20);
    }

    #[tokio::test]
    async fn duplicate_record_key_is_a_constraint_error() {
        let store = MemoryStore::new();
        store
            .insert_record(DataKind::Contacts, "D1", "c1", Map::new())
            .await
            .unwrap();
        let err = store
            .insert_record(DataKind::Contacts, "D1", "c1", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(!err.is_systemic());
        store
            .insert_record(DataKind::Contacts, "D2", "c1", Map::new())
            .await
            .unwrap();
        assert_eq!(store.count_records(DataKind::Contacts, "D1").await.unwrap(), 1);
    }
}
