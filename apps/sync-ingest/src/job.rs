//! Processing of one claimed queue record.
//!
//! A job is retried at two levels. Each chunk gets its own short retry loop
//! against systemic store errors; if that is exhausted the whole job is
//! retried from the first chunk, up to the record's `max_attempts`.

use std::sync::Arc;

use ingest_sdk::model::{DataKind, QueueStatus};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::handlers::{BatchOutcome, HandlerError, HandlerRegistry};
use crate::ledger::SyncLedger;
use crate::metrics::{CHUNK_RETRIES, ITEMS_FAILED, ITEMS_PROCESSED, JOBS_FINISHED};
use crate::store::{JobProgress, QueueRecord, QueueStore, StoreError};
use crate::worker::WorkerSettings;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("batch {index}: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: StoreError,
    },
    #[error("progress write failed: {0}")]
    Progress(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: Uuid,
    pub data_kind: DataKind,
    pub status: QueueStatus,
    pub processed: u32,
    pub failed: u32,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct JobRunner {
    queue: Arc<dyn QueueStore>,
    handlers: HandlerRegistry,
    ledger: SyncLedger,
    settings: WorkerSettings,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        handlers: HandlerRegistry,
        ledger: SyncLedger,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            handlers,
            ledger,
            settings,
        }
    }

    /// Drives a claimed record to a terminal status. Never returns an error:
    /// exhaustion is recorded on the record itself. The report says
    /// `Processing` only when even the terminal write could not land.
    pub async fn run(&self, record: QueueRecord) -> JobReport {
        let items = record.items();
        let mut attempt = record.attempts.max(1);
        info!(
            job_id = %record.id,
            device_id = %record.device_id,
            kind = %record.data_kind,
            items = items.len(),
            attempt,
            "processing queued job"
        );

        loop {
            match self.attempt(&record, &items).await {
                Ok(progress) => {
                    let status = progress.status();
                    self.ledger
                        .record_outcome(
                            &record.device_id,
                            record.data_kind,
                            progress.processed,
                            progress.failed,
                        )
                        .await;
                    JOBS_FINISHED
                        .with_label_values(&[record.data_kind.as_str(), status.as_str()])
                        .inc();
                    info!(
                        job_id = %record.id,
                        status = %status,
                        processed = progress.processed,
                        failed = progress.failed,
                        "job finished"
                    );
                    return JobReport {
                        id: record.id,
                        data_kind: record.data_kind,
                        status,
                        processed: progress.processed,
                        failed: progress.failed,
                        attempts: attempt,
                    };
                }
                Err(err) if attempt < record.max_attempts => {
                    warn!(
                        job_id = %record.id,
                        attempt,
                        max_attempts = record.max_attempts,
                        error = %err,
                        "job attempt failed, retrying from the first batch"
                    );
                    sleep(self.settings.retry_delay).await;
                    attempt = match self.queue.begin_retry(record.id).await {
                        Ok(attempts) => attempts,
                        Err(store_err) => {
                            warn!(job_id = %record.id, error = %store_err, "failed to persist retry attempt");
                            attempt + 1
                        }
                    };
                }
                Err(err) => {
                    let message = err.to_string();
                    let status = if self.write_failure(record.id, &message).await {
                        QueueStatus::Failed
                    } else {
                        QueueStatus::Processing
                    };
                    self.ledger
                        .record_failure(&record.device_id, record.data_kind, &message)
                        .await;
                    JOBS_FINISHED
                        .with_label_values(&[record.data_kind.as_str(), status.as_str()])
                        .inc();
                    error!(
                        job_id = %record.id,
                        attempts = attempt,
                        error = %message,
                        "job failed permanently"
                    );
                    return JobReport {
                        id: record.id,
                        data_kind: record.data_kind,
                        status,
                        processed: 0,
                        failed: 0,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// Persists the terminal `failed` status with the same retry policy as a
    /// chunk. Returns `false` if every try failed; the record then stays
    /// claimed until the worker loop releases it as stale.
    async fn write_failure(&self, id: Uuid, message: &str) -> bool {
        let max_tries = self.settings.max_retries.max(1);
        for try_number in 1..=max_tries {
            match self.queue.mark_failed(id, message).await {
                Ok(()) => return true,
                Err(err) if try_number < max_tries => {
                    warn!(job_id = %id, try_number, error = %err, "failed to mark job failed, retrying");
                    sleep(self.settings.retry_delay).await;
                }
                Err(err) => {
                    error!(job_id = %id, error = %err, "failed to mark job failed, leaving it for stale recovery");
                }
            }
        }
        false
    }

    async fn attempt(&self, record: &QueueRecord, items: &[Value]) -> Result<JobProgress, JobError> {
        let mut progress = JobProgress::default();
        let chunks: Vec<&[Value]> = items.chunks(self.settings.batch_size.max(1)).collect();
        let total = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let outcome = self.run_chunk(record, index, chunk).await?;
            let kind = record.data_kind.as_str();
            ITEMS_PROCESSED
                .with_label_values(&[kind])
                .inc_by(outcome.processed as u64);
            ITEMS_FAILED
                .with_label_values(&[kind])
                .inc_by(outcome.failed as u64);
            progress.processed += outcome.processed;
            progress.failed += outcome.failed;
            progress.errors.extend(outcome.errors);

            self.queue
                .write_progress(record.id, &progress)
                .await
                .map_err(JobError::Progress)?;
            debug!(
                job_id = %record.id,
                batch = index + 1,
                batches = total,
                processed = progress.processed,
                failed = progress.failed,
                "batch complete"
            );

            if index + 1 < total {
                sleep(self.settings.chunk_delay).await;
            }
        }

        self.queue
            .mark_finished(record.id, &progress)
            .await
            .map_err(JobError::Progress)?;
        Ok(progress)
    }

    async fn run_chunk(
        &self,
        record: &QueueRecord,
        index: usize,
        chunk: &[Value],
    ) -> Result<BatchOutcome, JobError> {
        let mut tries = 0;
        loop {
            tries += 1;
            match self
                .handlers
                .dispatch(record.data_kind, &record.device_id, chunk)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err @ HandlerError::Unsupported(_)) => {
                    warn!(job_id = %record.id, batch = index, error = %err, "no handler for data kind");
                    return Ok(BatchOutcome::all_failed(chunk.len(), err.to_string()));
                }
                Err(HandlerError::Store(err)) if tries < self.settings.max_retries => {
                    CHUNK_RETRIES
                        .with_label_values(&[record.data_kind.as_str()])
                        .inc();
                    warn!(
                        job_id = %record.id,
                        batch = index,
                        try_number = tries,
                        error = %err,
                        "batch failed, retrying"
                    );
                    sleep(self.settings.retry_delay).await;
                }
                Err(HandlerError::Store(source)) => return Err(JobError::Chunk { index, source }),
            }
        }
    }
}
