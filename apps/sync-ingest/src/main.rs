use std::net::SocketAddr;
use std::time::Duration;

use sync_ingest::config::AppConfig;
use sync_ingest::metrics;
use sync_ingest::retention::spawn_retention_sweeper;
use sync_ingest::routes::build_router;
use sync_ingest::state::AppState;
use sync_ingest::store::build_stores;
use sync_ingest::telemetry::init_tracing;
use sync_ingest::worker::WorkerSettings;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    let _log_guard = init_tracing(&cfg.log_filter, cfg.log_path.as_deref())?;
    metrics::init();

    let stores = build_stores(&cfg).await;
    let state = AppState::new(stores, WorkerSettings::default());

    let shutdown = CancellationToken::new();
    let sweeper = spawn_retention_sweeper(
        state.queue(),
        cfg.retention_days,
        Duration::from_secs(cfg.retention_sweep_secs),
        shutdown.child_token(),
    );
    if cfg.worker_autostart {
        state.worker().start().await;
    } else {
        info!("WORKER_AUTOSTART disabled; start the worker via POST /api/queue/start");
    }

    let worker = state.worker().clone();
    let app = build_router(state.clone());

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(
        addr = %addr,
        backend = state.backend().as_str(),
        log_path = %cfg.log_path.as_deref().unwrap_or("stderr"),
        retention_days = cfg.retention_days,
        "starting sync-ingest"
    );
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("http server stopped, draining worker");
    shutdown.cancel();
    worker.shutdown().await;
    sweeper.await.ok();
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
