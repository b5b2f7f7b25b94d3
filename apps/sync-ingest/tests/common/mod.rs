#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_sdk::model::{DataKind, GroupBreakdown};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use sync_ingest::state::AppState;
use sync_ingest::store::{
    BackendKind, DeleteOutcome, Grouping, JobProgress, MemoryStore, NewQueueRecord, Page,
    QueueFilter, QueueRecord, QueueStore, RecordStore, ResetOutcome, StoreError, StoredRecord,
    Stores,
};
use sync_ingest::worker::WorkerSettings;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub fn contacts(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"contactId": format!("c{i}"), "name": format!("Contact {i}")}))
        .collect()
}

pub fn memory_state(store: &Arc<MemoryStore>) -> AppState {
    AppState::new(Stores::from_memory(store.clone()), WorkerSettings::default())
}

/// Record store that fails with a systemic error for the first
/// `failures` lookups, then delegates to memory.
pub struct FlakyRecords {
    inner: Arc<MemoryStore>,
    failures: AtomicU32,
}

impl FlakyRecords {
    pub fn new(inner: Arc<MemoryStore>, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicU32::new(failures),
        })
    }

    pub fn always_down(inner: Arc<MemoryStore>) -> Arc<Self> {
        Self::new(inner, u32::MAX)
    }

    fn trip(&self) -> Result<(), StoreError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for FlakyRecords {
    async fn find_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.trip()?;
        self.inner.find_record(data_kind, device_id, natural_key).await
    }

    async fn insert_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
        fields: Map<String, Value>,
    ) -> Result<StoredRecord, StoreError> {
        self.inner
            .insert_record(data_kind, device_id, natural_key, fields)
            .await
    }

    async fn update_record(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.inner.update_record(id, fields).await
    }

    async fn count_records(&self, data_kind: DataKind, device_id: &str) -> Result<u64, StoreError> {
        self.inner.count_records(data_kind, device_id).await
    }
}

/// Queue store wrapper that can be taken offline, can refuse terminal
/// `failed` writes, and records every progress snapshot written through it.
pub struct ObservedQueue {
    inner: Arc<MemoryStore>,
    offline: AtomicBool,
    failed_write_refusals: AtomicU32,
    snapshots: Mutex<Vec<(Uuid, JobProgress)>>,
}

impl ObservedQueue {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            offline: AtomicBool::new(false),
            failed_write_refusals: AtomicU32::new(0),
            snapshots: Mutex::new(Vec::new()),
        })
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `count` calls to `mark_failed` return `Unavailable`.
    pub fn refuse_failed_writes(&self, count: u32) {
        self.failed_write_refusals.store(count, Ordering::SeqCst);
    }

    pub async fn snapshots(&self) -> Vec<(Uuid, JobProgress)> {
        self.snapshots.lock().await.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("queue store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueStore for ObservedQueue {
    async fn enqueue(&self, job: NewQueueRecord) -> Result<QueueRecord, StoreError> {
        self.check()?;
        self.inner.enqueue(job).await
    }

    async fn claim_next(&self) -> Result<Option<QueueRecord>, StoreError> {
        self.check()?;
        self.inner.claim_next().await
    }

    async fn begin_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        self.check()?;
        self.inner.begin_retry(id).await
    }

    async fn write_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        self.check()?;
        self.snapshots.lock().await.push((id, progress.clone()));
        self.inner.write_progress(id, progress).await
    }

    async fn mark_finished(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        self.check()?;
        self.inner.mark_finished(id, progress).await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        self.check()?;
        let refused = self
            .failed_write_refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.mark_failed(id, message).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<(Vec<QueueRecord>, u64), StoreError> {
        self.inner.list(filter, page).await
    }

    async fn breakdown(&self, grouping: Grouping) -> Result<Vec<GroupBreakdown>, StoreError> {
        self.inner.breakdown(grouping).await
    }

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, StoreError> {
        self.inner.delete(id).await
    }

    async fn delete_failed(&self) -> Result<u64, StoreError> {
        self.inner.delete_failed().await
    }

    async fn reset_failed(&self, id: Uuid) -> Result<ResetOutcome, StoreError> {
        self.inner.reset_failed(id).await
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_expired(cutoff).await
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.recover_stale(cutoff).await
    }
}

/// Memory stores with the record store and/or queue store swapped out.
pub fn stores_with(
    memory: &Arc<MemoryStore>,
    queue: Option<Arc<dyn QueueStore>>,
    records: Option<Arc<dyn RecordStore>>,
) -> Stores {
    Stores {
        backend: BackendKind::Memory,
        queue: queue.unwrap_or_else(|| memory.clone() as Arc<dyn QueueStore>),
        ledger: memory.clone(),
        records: records.unwrap_or_else(|| memory.clone() as Arc<dyn RecordStore>),
    }
}
