use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static ADMISSION_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "ingest_admission_total",
            "upload admission decisions by kind and outcome",
        ),
        &["kind", "decision"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "ingest_jobs_finished_total",
            "queued jobs reaching a terminal status",
        ),
        &["kind", "status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ITEMS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ingest_items_processed_total", "items upserted by kind"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ITEMS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("ingest_items_failed_total", "items rejected by kind"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CHUNK_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "ingest_chunk_retries_total",
            "chunk re-attempts after a systemic store error",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WORKER_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "ingest_worker_running",
        "1 while the batch worker loop is active",
    ))
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static WORKER_LOOP_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "ingest_worker_loop_errors_total",
        "claim failures that put the worker into backoff",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RETENTION_PURGED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "ingest_retention_purged_total",
        "queue records removed by the retention sweeper",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STALE_RECOVERED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "ingest_stale_recovered_total",
        "claimed queue records released after their worker went quiet",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Forces registration so `/metrics` lists every family from boot.
pub fn init() {
    Lazy::force(&ADMISSION_DECISIONS);
    Lazy::force(&JOBS_FINISHED);
    Lazy::force(&ITEMS_PROCESSED);
    Lazy::force(&ITEMS_FAILED);
    Lazy::force(&CHUNK_RETRIES);
    Lazy::force(&WORKER_RUNNING);
    Lazy::force(&WORKER_LOOP_ERRORS);
    Lazy::force(&RETENTION_PURGED);
    Lazy::force(&STALE_RECOVERED);
}

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        buffer.clear();
    }
    buffer
}
