//! Durable state behind the ingestion pipeline.
//!
//! Three concerns live here: the job queue, the per-device sync ledger, and
//! the harvested records themselves. Each is a trait so the worker can run
//! against Postgres in production and [`MemoryStore`] in tests or when no
//! database is configured.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_sdk::model::{
    DataKind, GroupBreakdown, JobStatusView, QueueStatus, SyncLedgerEntry, SyncStatus,
};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Chunk size stamped on every queued record.
pub const DEFAULT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Error text stamped on a record whose worker never wrote a terminal status.
pub const ABANDONED_MESSAGE: &str = "processing abandoned before a terminal status was written";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Systemic errors take the whole chunk down and drive retries; the rest
    /// are attributed to the single item being written.
    pub fn is_systemic(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Migrate(_) => true,
            StoreError::Database(err) => !matches!(err, sqlx::Error::Database(_)),
            StoreError::Constraint(_)
            | StoreError::Invalid(_)
            | StoreError::NotFound(_)
            | StoreError::Serde(_) => false,
        }
    }
}

/// One ingestion job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub id: Uuid,
    pub device_id: String,
    pub data_kind: DataKind,
    /// Raw items as uploaded. Listings leave this as `Null`.
    pub payload: Value,
    pub item_count: u32,
    pub batch_size: u32,
    pub status: QueueStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub processed_count: u32,
    pub failed_count: u32,
    pub error_message: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueRecord {
    /// Payload normalized to a sequence; a lone object is a one-item job.
    pub fn items(&self) -> Vec<Value> {
        normalize_items(&self.payload)
    }

    /// Percentage of items processed, rounded.
    pub fn progress(&self) -> u8 {
        if self.item_count == 0 {
            return 0;
        }
        let pct = (self.processed_count as f64 / self.item_count as f64) * 100.0;
        pct.round().clamp(0.0, 100.0) as u8
    }

    pub fn estimated_time_remaining_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.processing_started_at?;
        if self.processed_count == 0 {
            return None;
        }
        let elapsed = (now - started).num_milliseconds().max(1) as f64;
        let rate = self.processed_count as f64 / elapsed;
        let remaining = self.item_count.saturating_sub(self.processed_count) as f64;
        Some((remaining / rate).round() as i64)
    }

    pub fn status_view(&self, now: DateTime<Utc>) -> JobStatusView {
        JobStatusView {
            id: self.id,
            device_id: self.device_id.clone(),
            data_type: self.data_kind,
            status: self.status,
            data_count: self.item_count,
            processed_count: self.processed_count,
            failed_count: self.failed_count,
            progress: self.progress(),
            estimated_time_remaining: self.estimated_time_remaining_ms(now),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            processing_started_at: self.processing_started_at,
            processing_completed_at: self.processing_completed_at,
        }
    }
}

pub fn normalize_items(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

#[derive(Debug, Clone)]
pub struct NewQueueRecord {
    pub device_id: String,
    pub data_kind: DataKind,
    pub payload: Value,
    pub priority: i32,
}

impl NewQueueRecord {
    pub fn new(device_id: impl Into<String>, data_kind: DataKind, items: Vec<Value>) -> Self {
        Self {
            device_id: device_id.into(),
            data_kind,
            payload: Value::Array(items),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn item_count(&self) -> u32 {
        match &self.payload {
            Value::Array(items) => items.len() as u32,
            _ => 1,
        }
    }
}

/// Running totals for one pass over a job's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub processed: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

impl JobProgress {
    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_failures(self.failed)
    }

    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub device_id: Option<String>,
    pub data_kind: Option<DataKind>,
}

impl QueueFilter {
    pub fn matches(&self, record: &QueueRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .device_id
                .as_deref()
                .map_or(true, |d| record.device_id == d)
            && self.data_kind.map_or(true, |k| record.data_kind == k)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    pub fn offset(&self) -> u64 {
        (self.page.max(1) as u64 - 1) * self.limit as u64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    Status,
    Device,
    Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
    Refused(QueueStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset,
    Missing,
    Refused(QueueStatus),
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, job: NewQueueRecord) -> Result<QueueRecord, StoreError>;

    /// Atomically selects the oldest record among the highest priority with
    /// `status = pending AND attempts < max_attempts`, flips it to
    /// `processing`, bumps `attempts` and stamps `processing_started_at`.
    async fn claim_next(&self) -> Result<Option<QueueRecord>, StoreError>;

    /// Records one more whole-job attempt on a claimed record and returns the new count.
    async fn begin_retry(&self, id: Uuid) -> Result<u32, StoreError>;

    async fn write_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError>;

    /// Terminal success write (`completed` or `partially_completed`).
    async fn mark_finished(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<QueueRecord>, StoreError>;

    /// Newest first; payloads are not loaded.
    async fn list(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<(Vec<QueueRecord>, u64), StoreError>;

    async fn breakdown(&self, grouping: Grouping) -> Result<Vec<GroupBreakdown>, StoreError>;

    /// Removes a single record unless it is processing or completed.
    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, StoreError>;

    async fn delete_failed(&self) -> Result<u64, StoreError>;

    /// Puts a failed record back in line with a clean slate.
    async fn reset_failed(&self, id: Uuid) -> Result<ResetOutcome, StoreError>;

    /// Drops records created before `cutoff`, whatever their status.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Releases claimed records that have not been touched since `cutoff` and
    /// never got a terminal write. Records with attempts left go back to
    /// `pending`; the rest become `failed` with [`ABANDONED_MESSAGE`].
    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub device_id: String,
    pub data_kind: DataKind,
    pub last_sync_time: DateTime<Utc>,
    pub item_count: u32,
    pub status: SyncStatus,
    pub message: String,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn ledger_entry(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<Option<SyncLedgerEntry>, StoreError>;

    async fn get_or_create_entry(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<SyncLedgerEntry, StoreError>;

    async fn record_sync(&self, update: LedgerUpdate) -> Result<SyncLedgerEntry, StoreError>;

    async fn device_entries(&self, device_id: &str) -> Result<Vec<SyncLedgerEntry>, StoreError>;
}

/// A harvested item as persisted, keyed by `(data_kind, device_id, natural_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: Uuid,
    pub data_kind: DataKind,
    pub device_id: String,
    pub natural_key: String,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn insert_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
        fields: Map<String, Value>,
    ) -> Result<StoredRecord, StoreError>;

    /// Merges `fields` into the stored record and refreshes `updated_at`.
    async fn update_record(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError>;

    async fn count_records(&self, data_kind: DataKind, device_id: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Postgres,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Postgres => "postgres",
        }
    }
}

/// The three store handles, usually backed by one object.
#[derive(Clone)]
pub struct Stores {
    pub backend: BackendKind,
    pub queue: Arc<dyn QueueStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self::from_memory(MemoryStore::new())
    }

    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            backend: BackendKind::Memory,
            queue: store.clone(),
            ledger: store.clone(),
            records: store,
        }
    }

    pub fn from_postgres(store: Arc<PostgresStore>) -> Self {
        Self {
            backend: BackendKind::Postgres,
            queue: store.clone(),
            ledger: store.clone(),
            records: store,
        }
    }
}

/// Connects to Postgres when configured, otherwise (or on failure) keeps
/// everything in memory.
pub async fn build_stores(cfg: &AppConfig) -> Stores {
    let Some(db_url) = cfg.database_url.as_deref() else {
        info!("DATABASE_URL not set; running with in-memory queue store");
        return Stores::memory();
    };

    match PgPoolOptions::new()
        .max_connections(cfg.database_max_connections)
        .connect(db_url)
        .await
    {
        Ok(pool) => match PostgresStore::migrate(pool).await {
            Ok(store) => {
                info!("database migrations applied");
                Stores::from_postgres(Arc::new(store))
            }
            Err(err) => {
                warn!(error = %err, "failed to run database migrations, continuing with in-memory state");
                Stores::memory()
            }
        },
        Err(err) => {
            warn!(error = %err, "failed to connect to database, continuing with in-memory state");
            Stores::memory()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn record(item_count: u32, processed: u32) -> QueueRecord {
        let now = Utc::now();
        QueueRecord {
            id: Uuid::new_v4(),
            device_id: "D1".into(),
            data_kind: DataKind::Contacts,
            payload: Value::Null,
            item_count,
            batch_size: DEFAULT_BATCH_SIZE,
            status: QueueStatus::Processing,
            priority: 0,
            attempts: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            processed_count: processed,
            failed_count: 0,
            error_message: None,
            processing_started_at: Some(now - Duration::seconds(10)),
            processing_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn progress_rounds_to_whole_percent() {
        assert_eq!(record(0, 0).progress(), 0);
        assert_eq!(record(3, 1).progress(), 33);
        assert_eq!(record(3, 2).progress(), 67);
        assert_eq!(record(1200, 1200).progress(), 100);
    }

    #[test]
    fn remaining_time_extrapolates_rate() {
        let rec = record(200, 100);
        let started = rec.processing_started_at.unwrap();
        let eta = rec
            .estimated_time_remaining_ms(started + Duration::seconds(10))
            .unwrap();
        assert_eq!(eta, 10_000);

        assert!(record(200, 0).estimated_time_remaining_ms(Utc::now()).is_none());
        let mut unstarted = record(200, 10);
        unstarted.processing_started_at = None;
        assert!(unstarted.estimated_time_remaining_ms(Utc::now()).is_none());
    }

    #[test]
    fn single_item_payload_normalizes_to_one() {
        assert_eq!(normalize_items(&json!({"contactId": "c1"})).len(), 1);
        assert_eq!(normalize_items(&json!([1, 2, 3])).len(), 3);
        let job = NewQueueRecord {
            device_id: "D1".into(),
            data_kind: DataKind::Contacts,
            payload: json!({"contactId": "c1"}),
            priority: 0,
        };
        assert_eq!(job.item_count(), 1);
    }

    #[test]
    fn progress_error_message_joins_with_semicolons() {
        let progress = JobProgress {
            processed: 1,
            failed: 2,
            errors: vec!["Contact a: bad".into(), "Contact b: worse".into()],
        };
        assert_eq!(
            progress.error_message().as_deref(),
            Some("Contact a: bad; Contact b: worse")
        );
        assert_eq!(progress.status(), QueueStatus::PartiallyCompleted);
        assert_eq!(JobProgress::default().error_message(), None);
    }

    #[test]
    fn systemic_classification() {
        assert!(StoreError::Unavailable("down".into()).is_systemic());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_systemic());
        assert!(!StoreError::Constraint("dup".into()).is_systemic());
        assert!(!StoreError::Invalid("bad".into()).is_systemic());
    }
}
