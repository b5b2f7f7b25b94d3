use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_sdk::model::{DataKind, GroupBreakdown, QueueStatus, SyncLedgerEntry, SyncStatus};
use sea_query::{Expr, Iden, OnConflict, Order, PostgresQueryBuilder, Query, SelectStatement};
use sea_query_binder::SqlxBinder;
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    DeleteOutcome, Grouping, JobProgress, LedgerStore, LedgerUpdate, NewQueueRecord, Page,
    QueueFilter, QueueRecord, QueueStore, RecordStore, ResetOutcome, StoreError, StoredRecord,
    ABANDONED_MESSAGE, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS,
};

const QUEUE_COLUMNS: &str = "id, device_id, data_kind, payload, item_count, batch_size, status, \
     priority, attempts, max_attempts, processed_count, failed_count, error_message, \
     processing_started_at, processing_completed_at, created_at, updated_at";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Applies pending migrations and wraps the pool.
    pub async fn migrate(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Self::migrate(pool).await
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<QueueStatus>, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM ingest_queue WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        status.map(|s| parse_status(&s)).transpose()
    }

    async fn write_counts(
        &self,
        id: Uuid,
        progress: &JobProgress,
        finished: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_queue
            SET processed_count = $2,
                failed_count = $3,
                error_message = $4,
                status = $5,
                processing_completed_at = CASE WHEN $6 THEN NOW() ELSE processing_completed_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress.processed as i32)
        .bind(progress.failed as i32)
        .bind(progress.error_message())
        .bind(progress.status().as_str())
        .bind(finished)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct QueueRow {
    id: Uuid,
    device_id: String,
    data_kind: String,
    #[sqlx(default)]
    payload: Option<Value>,
    item_count: i32,
    batch_size: i32,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    processed_count: i32,
    failed_count: i32,
    error_message: Option<String>,
    processing_started_at: Option<DateTime<Utc>>,
    processing_completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for QueueRecord {
    type Error = StoreError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(QueueRecord {
            id: row.id,
            device_id: row.device_id,
            data_kind: parse_kind(&row.data_kind)?,
            payload: row.payload.unwrap_or(Value::Null),
            item_count: row.item_count.max(0) as u32,
            batch_size: row.batch_size.max(0) as u32,
            status: parse_status(&row.status)?,
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            processed_count: row.processed_count.max(0) as u32,
            failed_count: row.failed_count.max(0) as u32,
            error_message: row.error_message,
            processing_started_at: row.processing_started_at,
            processing_completed_at: row.processing_completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct BreakdownRow {
    key: String,
    count: i64,
    total_data_count: i64,
    total_processed_count: i64,
    total_failed_count: i64,
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    device_id: String,
    data_kind: String,
    last_sync_time: Option<DateTime<Utc>>,
    item_count: i32,
    last_sync_status: String,
    last_sync_message: String,
    is_enabled: bool,
}

impl TryFrom<LedgerRow> for SyncLedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(SyncLedgerEntry {
            device_id: row.device_id,
            data_kind: parse_kind(&row.data_kind)?,
            last_sync_time: row.last_sync_time,
            item_count: row.item_count.max(0) as u32,
            last_sync_status: row
                .last_sync_status
                .parse::<SyncStatus>()
                .map_err(|e| StoreError::Invalid(e.to_string()))?,
            last_sync_message: row.last_sync_message,
            is_enabled: row.is_enabled,
        })
    }
}

#[derive(Debug, FromRow)]
struct DeviceRecordRow {
    id: Uuid,
    data_kind: String,
    device_id: String,
    natural_key: String,
    fields: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceRecordRow> for StoredRecord {
    type Error = StoreError;

    fn try_from(row: DeviceRecordRow) -> Result<Self, Self::Error> {
        let fields = match row.fields {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Invalid(format!(
                    "device record {} has non-object fields: {other}",
                    row.id
                )))
            }
        };
        Ok(StoredRecord {
            id: row.id,
            data_kind: parse_kind(&row.data_kind)?,
            device_id: row.device_id,
            natural_key: row.natural_key,
            fields,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Iden)]
enum IngestQueue {
    Table,
    Id,
    DeviceId,
    DataKind,
    ItemCount,
    BatchSize,
    Status,
    Priority,
    Attempts,
    MaxAttempts,
    ProcessedCount,
    FailedCount,
    ErrorMessage,
    ProcessingStartedAt,
    ProcessingCompletedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum SyncLedger {
    Table,
    DeviceId,
    DataKind,
    LastSyncTime,
    ItemCount,
    LastSyncStatus,
    LastSyncMessage,
    UpdatedAt,
}

fn parse_kind(raw: &str) -> Result<DataKind, StoreError> {
    raw.parse::<DataKind>()
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

fn parse_status(raw: &str) -> Result<QueueStatus, StoreError> {
    raw.parse::<QueueStatus>()
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

fn map_insert_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Constraint(db.message().to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn apply_filter(select: &mut SelectStatement, filter: &QueueFilter) {
    if let Some(status) = filter.status {
        select.and_where(Expr::col(IngestQueue::Status).eq(status.as_str()));
    }
    if let Some(device_id) = filter.device_id.as_deref() {
        select.and_where(Expr::col(IngestQueue::DeviceId).eq(device_id));
    }
    if let Some(kind) = filter.data_kind {
        select.and_where(Expr::col(IngestQueue::DataKind).eq(kind.as_str()));
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn enqueue(&self, job: NewQueueRecord) -> Result<QueueRecord, StoreError> {
        let item_count = job.item_count();
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            INSERT INTO ingest_queue
                (id, device_id, data_kind, payload, item_count, batch_size, status, priority,
                 attempts, max_attempts, processed_count, failed_count)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, 0, $8, 0, 0)
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&job.device_id)
        .bind(job.data_kind.as_str())
        .bind(&job.payload)
        .bind(item_count as i32)
        .bind(DEFAULT_BATCH_SIZE as i32)
        .bind(job.priority)
        .bind(DEFAULT_MAX_ATTEMPTS as i32)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn claim_next(&self) -> Result<Option<QueueRecord>, StoreError> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            UPDATE ingest_queue
            SET status = 'processing',
                attempts = attempts + 1,
                processing_started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM ingest_queue
                WHERE status = 'pending' AND attempts < max_attempts
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(QueueRecord::try_from).transpose()
    }

    async fn begin_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE ingest_queue SET attempts = attempts + 1, updated_at = NOW() \
             WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        attempts
            .map(|a| a.max(0) as u32)
            .ok_or(StoreError::NotFound(id))
    }

    async fn write_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        self.write_counts(id, progress, false).await
    }

    async fn mark_finished(&self, id: Uuid, progress: &JobProgress) -> Result<(), StoreError> {
        self.write_counts(id, progress, true).await
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        let (sql, values) = Query::update()
            .table(IngestQueue::Table)
            .value(IngestQueue::Status, QueueStatus::Failed.as_str())
            .value(IngestQueue::ErrorMessage, message)
            .value(IngestQueue::ProcessingCompletedAt, Utc::now())
            .value(IngestQueue::UpdatedAt, Utc::now())
            .and_where(Expr::col(IngestQueue::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueRecord>, StoreError> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM ingest_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(QueueRecord::try_from).transpose()
    }

    async fn list(
        &self,
        filter: &QueueFilter,
        page: Page,
    ) -> Result<(Vec<QueueRecord>, u64), StoreError> {
        let mut count = Query::select();
        count
            .expr(Expr::col(IngestQueue::Id).count())
            .from(IngestQueue::Table);
        apply_filter(&mut count, filter);
        let (sql, values) = count.build_sqlx(PostgresQueryBuilder);
        let total: i64 = sqlx::query_scalar_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;

        let mut select = Query::select();
        select
            .columns([
                IngestQueue::Id,
                IngestQueue::DeviceId,
                IngestQueue::DataKind,
                IngestQueue::ItemCount,
                IngestQueue::BatchSize,
                IngestQueue::Status,
                IngestQueue::Priority,
                IngestQueue::Attempts,
                IngestQueue::MaxAttempts,
                IngestQueue::ProcessedCount,
                IngestQueue::FailedCount,
                IngestQueue::ErrorMessage,
                IngestQueue::ProcessingStartedAt,
                IngestQueue::ProcessingCompletedAt,
                IngestQueue::CreatedAt,
                IngestQueue::UpdatedAt,
            ])
            .from(IngestQueue::Table)
            .order_by(IngestQueue::CreatedAt, Order::Desc)
            .limit(page.limit as u64)
            .offset(page.offset());
        apply_filter(&mut select, filter);
        let (sql, values) = select.build_sqlx(PostgresQueryBuilder);
        let rows = sqlx::query_as_with::<_, QueueRow, _>(&sql, values)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .into_iter()
            .map(QueueRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((records, total.max(0) as u64))
    }

    async fn breakdown(&self, grouping: Grouping) -> Result<Vec<GroupBreakdown>, StoreError> {
        let column = match grouping {
            Grouping::Status => "status",
            Grouping::Device => "device_id",
            Grouping::Kind => "data_kind",
        };
        let rows = sqlx::query_as::<_, BreakdownRow>(&format!(
            r#"
            SELECT {column} AS key,
                   COUNT(*) AS count,
                   COALESCE(SUM(item_count), 0)::BIGINT AS total_data_count,
                   COALESCE(SUM(processed_count), 0)::BIGINT AS total_processed_count,
                   COALESCE(SUM(failed_count), 0)::BIGINT AS total_failed_count
            FROM ingest_queue
            GROUP BY {column}
            ORDER BY {column}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| GroupBreakdown {
                key: r.key,
                count: r.count.max(0) as u64,
                total_data_count: r.total_data_count.max(0) as u64,
                total_processed_count: r.total_processed_count.max(0) as u64,
                total_failed_count: r.total_failed_count.max(0) as u64,
            })
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<DeleteOutcome, StoreError> {
        let deleted: Option<Uuid> = sqlx::query_scalar(
            "DELETE FROM ingest_queue WHERE id = $1 \
             AND status NOT IN ('processing', 'completed') RETURNING id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if deleted.is_some() {
            return Ok(DeleteOutcome::Deleted);
        }
        Ok(match self.current_status(id).await? {
            Some(status) => DeleteOutcome::Refused(status),
            None => DeleteOutcome::Missing,
        })
    }

    async fn delete_failed(&self) -> Result<u64, StoreError> {
        let (sql, values) = Query::delete()
            .from_table(IngestQueue::Table)
            .and_where(Expr::col(IngestQueue::Status).eq(QueueStatus::Failed.as_str()))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn reset_failed(&self, id: Uuid) -> Result<ResetOutcome, StoreError> {
        let reset: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE ingest_queue
            SET status = 'pending',
                attempts = 0,
                processed_count = 0,
                failed_count = 0,
                error_message = NULL,
                processing_started_at = NULL,
                processing_completed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        if reset.is_some() {
            return Ok(ResetOutcome::Reset);
        }
        Ok(match self.current_status(id).await? {
            Some(status) => ResetOutcome::Refused(status),
            None => ResetOutcome::Missing,
        })
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let (sql, values) = Query::delete()
            .from_table(IngestQueue::Table)
            .and_where(Expr::col(IngestQueue::CreatedAt).lt(cutoff))
            .build_sqlx(PostgresQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_queue
            SET status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                error_message = CASE WHEN attempts < max_attempts THEN error_message ELSE $2 END,
                processing_started_at = CASE WHEN attempts < max_attempts THEN NULL
                                             ELSE processing_started_at END,
                processing_completed_at = CASE WHEN attempts < max_attempts THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE status NOT IN ('pending', 'failed')
              AND processing_completed_at IS NULL
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(ABANDONED_MESSAGE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

const LEDGER_COLUMNS: &str = "device_id, data_kind, last_sync_time, item_count, \
     last_sync_status, last_sync_message, is_enabled";

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn ledger_entry(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<Option<SyncLedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM sync_ledger WHERE device_id = $1 AND data_kind = $2"
        ))
        .bind(device_id)
        .bind(data_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncLedgerEntry::try_from).transpose()
    }

    async fn get_or_create_entry(
        &self,
        device_id: &str,
        data_kind: DataKind,
    ) -> Result<SyncLedgerEntry, StoreError> {
        sqlx::query(
            "INSERT INTO sync_ledger (device_id, data_kind) VALUES ($1, $2) \
             ON CONFLICT (device_id, data_kind) DO NOTHING",
        )
        .bind(device_id)
        .bind(data_kind.as_str())
        .execute(&self.pool)
        .await?;
        self.ledger_entry(device_id, data_kind)
            .await?
            .ok_or_else(|| StoreError::Invalid(format!("ledger row {device_id}/{data_kind} vanished")))
    }

    async fn record_sync(&self, update: LedgerUpdate) -> Result<SyncLedgerEntry, StoreError> {
        let (sql, values) = Query::insert()
            .into_table(SyncLedger::Table)
            .columns([
                SyncLedger::DeviceId,
                SyncLedger::DataKind,
                SyncLedger::LastSyncTime,
                SyncLedger::ItemCount,
                SyncLedger::LastSyncStatus,
                SyncLedger::LastSyncMessage,
                SyncLedger::UpdatedAt,
            ])
            .values_panic([
                update.device_id.clone().into(),
                update.data_kind.as_str().into(),
                update.last_sync_time.into(),
                (update.item_count as i32).into(),
                update.status.as_str().into(),
                update.message.clone().into(),
                Utc::now().into(),
            ])
            .on_conflict(
                OnConflict::columns([SyncLedger::DeviceId, SyncLedger::DataKind])
                    .update_columns([
                        SyncLedger::LastSyncTime,
                        SyncLedger::ItemCount,
                        SyncLedger::LastSyncStatus,
                        SyncLedger::LastSyncMessage,
                        SyncLedger::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .build_sqlx(PostgresQueryBuilder);
        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        self.ledger_entry(&update.device_id, update.data_kind)
            .await?
            .ok_or_else(|| {
                StoreError::Invalid(format!(
                    "ledger row {}/{} missing after upsert",
                    update.device_id, update.data_kind
                ))
            })
    }

    async fn device_entries(&self, device_id: &str) -> Result<Vec<SyncLedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM sync_ledger WHERE device_id = $1 ORDER BY data_kind"
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncLedgerEntry::try_from).collect()
    }
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn find_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query_as::<_, DeviceRecordRow>(
            r#"
            SELECT id, data_kind, device_id, natural_key, fields, created_at, updated_at
            FROM device_records
            WHERE data_kind = $1 AND device_id = $2 AND natural_key = $3
            "#,
        )
        .bind(data_kind.as_str())
        .bind(device_id)
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StoredRecord::try_from).transpose()
    }

    async fn insert_record(
        &self,
        data_kind: DataKind,
        device_id: &str,
        natural_key: &str,
        fields: Map<String, Value>,
    ) -> Result<StoredRecord, StoreError> {
        let row = sqlx::query_as::<_, DeviceRecordRow>(
            r#"
            INSERT INTO device_records (id, data_kind, device_id, natural_key, fields)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, data_kind, device_id, natural_key, fields, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data_kind.as_str())
        .bind(device_id)
        .bind(natural_key)
        .bind(Value::Object(fields))
        .fetch_one(&self.pool)
        .await
        .map_err(map_insert_error)?;
        row.try_into()
    }

    async fn update_record(&self, id: Uuid, fields: Map<String, Value>) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE device_records SET fields = fields || $2::jsonb, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Value::Object(fields))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn count_records(&self, data_kind: DataKind, device_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM device_records WHERE data_kind = $1 AND device_id = $2",
        )
        .bind(data_kind.as_str())
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
