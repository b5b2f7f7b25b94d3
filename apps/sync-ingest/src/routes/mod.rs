mod ingest;
mod queue;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::metrics;
use crate::state::AppState;
use crate::store::StoreError;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics_text))
        .route("/api/sync/:kind", post(ingest::submit))
        .route("/api/devices/:device_id/ledger", get(ingest::device_ledger))
        .route(
            "/api/devices/:device_id/ledger/:kind",
            get(ingest::device_ledger_entry),
        )
        .route("/api/queue/status", get(queue::status))
        .route("/api/queue/stats", get(queue::stats))
        .route("/api/queue/items", get(queue::list_items))
        .route("/api/queue/items/failed", delete(queue::clear_failed))
        .route(
            "/api/queue/items/:id",
            get(queue::get_item).delete(queue::delete_item),
        )
        .route("/api/queue/items/:id/retry", post(queue::retry_item))
        .route("/api/queue/start", post(queue::start_worker))
        .route("/api/queue/stop", post(queue::stop_worker))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyResponse {
    status: &'static str,
    backend: &'static str,
    worker_running: bool,
    uptime_secs: u64,
    timestamp: DateTime<Utc>,
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        backend: state.backend().as_str(),
        worker_running: state.worker().is_processing().await,
        uptime_secs: state.uptime_secs(),
        timestamp: Utc::now(),
    })
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    success: bool,
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };
        (
            status,
            Json(ApiErrorBody {
                success: false,
                error: code,
                message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store operation failed");
        ApiError::Internal(err.to_string())
    }
}
