use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ingest_sdk::model::WorkerStatus;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handlers::HandlerRegistry;
use crate::job::{JobReport, JobRunner};
use crate::ledger::SyncLedger;
use crate::metrics::{STALE_RECOVERED, WORKER_LOOP_ERRORS, WORKER_RUNNING};
use crate::store::{QueueStore, StoreError};

/// Fixed pipeline tuning. Exposed read-only through the status endpoint.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub processing_delay: Duration,
    pub retry_delay: Duration,
    pub idle_poll: Duration,
    pub error_backoff: Duration,
    pub chunk_delay: Duration,
    pub data_threshold: usize,
    /// Claimed records untouched for this long are released by the loop.
    pub stale_after: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            processing_delay: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(5000),
            idle_poll: Duration::from_secs(5),
            error_backoff: Duration::from_secs(10),
            chunk_delay: Duration::from_millis(100),
            data_threshold: 500,
            stale_after: Duration::from_secs(30 * 60),
        }
    }
}

impl WorkerSettings {
    pub fn status(&self, is_processing: bool) -> WorkerStatus {
        WorkerStatus {
            is_processing,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            processing_delay: self.processing_delay.as_millis() as u64,
            retry_delay: self.retry_delay.as_millis() as u64,
            data_threshold: self.data_threshold,
        }
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LoopHandle {
    fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

#[derive(Default)]
struct LoopSlots {
    current: Option<LoopHandle>,
    /// Stopped loops still finishing their last job.
    draining: Vec<JoinHandle<()>>,
}

struct WorkerInner {
    queue: Arc<dyn QueueStore>,
    runner: JobRunner,
    settings: WorkerSettings,
    slots: Mutex<LoopSlots>,
}

/// The single background loop that claims and processes queued jobs.
/// Owned by the composition root; cloning shares the same loop.
#[derive(Clone)]
pub struct BatchWorker {
    inner: Arc<WorkerInner>,
}

impl BatchWorker {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        handlers: HandlerRegistry,
        ledger: SyncLedger,
        settings: WorkerSettings,
    ) -> Self {
        let runner = JobRunner::new(queue.clone(), handlers, ledger, settings.clone());
        Self {
            inner: Arc::new(WorkerInner {
                queue,
                runner,
                settings,
                slots: Mutex::new(LoopSlots::default()),
            }),
        }
    }

    /// Returns `false` when the loop was already running.
    pub async fn start(&self) -> bool {
        let mut slots = self.inner.slots.lock().await;
        if slots.current.as_ref().is_some_and(LoopHandle::is_running) {
            return false;
        }
        if let Some(previous) = slots.current.take() {
            if !previous.task.is_finished() {
                slots.draining.push(previous.task);
            }
        }
        slots.draining.retain(|task| !task.is_finished());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.inner.clone(), cancel.clone()));
        slots.current = Some(LoopHandle { cancel, task });
        WORKER_RUNNING.set(1);
        info!("batch worker started");
        true
    }

    /// Stops scheduling new claims. A job already in flight runs to its end.
    /// Returns `false` when the loop was not running.
    pub async fn stop(&self) -> bool {
        let slots = self.inner.slots.lock().await;
        match slots.current.as_ref() {
            Some(handle) if !handle.cancel.is_cancelled() => {
                handle.cancel.cancel();
                WORKER_RUNNING.set(0);
                info!("batch worker stop requested");
                true
            }
            _ => false,
        }
    }

    /// Stops the loop and waits for it, and for any earlier stopped loop,
    /// to exit.
    pub async fn shutdown(&self) {
        let LoopSlots { current, draining } = std::mem::take(&mut *self.inner.slots.lock().await);
        let mut tasks = draining;
        if let Some(handle) = current {
            handle.cancel.cancel();
            tasks.push(handle.task);
        }
        WORKER_RUNNING.set(0);
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "batch worker task ended abnormally");
            }
        }
    }

    pub async fn is_processing(&self) -> bool {
        let slots = self.inner.slots.lock().await;
        slots.current.as_ref().is_some_and(LoopHandle::is_running)
    }

    pub async fn status(&self) -> WorkerStatus {
        self.inner.settings.status(self.is_processing().await)
    }

    /// Claims and processes at most one job.
    pub async fn run_once(&self) -> Result<Option<JobReport>, StoreError> {
        self.inner.tick().await
    }
}

impl WorkerInner {
    async fn tick(&self) -> Result<Option<JobReport>, StoreError> {
        match self.queue.claim_next().await? {
            Some(record) => Ok(Some(self.runner.run(record).await)),
            None => Ok(None),
        }
    }

    /// Hands records stranded by a lost terminal write (or a crashed
    /// process) back to the queue, or fails them if no attempts remain.
    async fn release_stale(&self) {
        let window = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        match self.queue.recover_stale(Utc::now() - window).await {
            Ok(0) => {}
            Ok(recovered) => {
                STALE_RECOVERED.inc_by(recovered);
                warn!(recovered, "released stale claimed queue records");
            }
            Err(err) => warn!(error = %err, "stale record recovery failed"),
        }
    }
}

async fn run_loop(inner: Arc<WorkerInner>, cancel: CancellationToken) {
    let settings = inner.settings.clone();
    inner.release_stale().await;
    while !cancel.is_cancelled() {
        let pause = match inner.tick().await {
            Ok(Some(_)) => settings.processing_delay,
            Ok(None) => {
                inner.release_stale().await;
                settings.idle_poll
            }
            Err(err) => {
                WORKER_LOOP_ERRORS.inc();
                error!(error = %err, "batch worker loop error, backing off");
                settings.error_backoff
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    info!("batch worker stopped");
}
