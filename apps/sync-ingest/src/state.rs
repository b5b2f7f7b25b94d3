use std::sync::Arc;
use std::time::Instant;

use crate::admission::AdmissionFilter;
use crate::handlers::HandlerRegistry;
use crate::ledger::SyncLedger;
use crate::store::{BackendKind, QueueStore, Stores};
use crate::worker::{BatchWorker, WorkerSettings};

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    backend: BackendKind,
    queue: Arc<dyn QueueStore>,
    admission: AdmissionFilter,
    handlers: HandlerRegistry,
    ledger: SyncLedger,
    worker: BatchWorker,
}

impl AppState {
    /// Wires the pipeline over one set of stores. The worker is built but not
    /// started; that is up to the caller.
    pub fn new(stores: Stores, settings: WorkerSettings) -> Self {
        let handlers = HandlerRegistry::with_records(stores.records.clone());
        Self::with_handlers(stores, handlers, settings)
    }

    pub fn with_handlers(stores: Stores, handlers: HandlerRegistry, settings: WorkerSettings) -> Self {
        let ledger = SyncLedger::new(stores.ledger.clone());
        let admission = AdmissionFilter::new(stores.queue.clone(), &settings);
        let worker = BatchWorker::new(
            stores.queue.clone(),
            handlers.clone(),
            ledger.clone(),
            settings,
        );
        Self {
            start: Instant::now(),
            backend: stores.backend,
            queue: stores.queue,
            admission,
            handlers,
            ledger,
            worker,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn queue(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.queue)
    }

    pub fn admission(&self) -> &AdmissionFilter {
        &self.admission
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn ledger(&self) -> &SyncLedger {
        &self.ledger
    }

    pub fn worker(&self) -> &BatchWorker {
        &self.worker
    }
}
