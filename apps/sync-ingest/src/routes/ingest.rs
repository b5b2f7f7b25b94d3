use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use ingest_sdk::model::{DataKind, ImmediateSummary, IngestRequest, SyncLedgerEntry};
use serde::Serialize;
use tracing::info;

use super::{ApiError, ApiResult};
use crate::admission::Admission;
use crate::handlers::HandlerError;
use crate::metrics::{ITEMS_FAILED, ITEMS_PROCESSED};
use crate::state::AppState;
use crate::store::normalize_items;

/// Ingestion trigger. Large uploads are queued; everything else is upserted
/// before responding.
pub(super) async fn submit(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(body): Json<IngestRequest>,
) -> Result<Response, ApiError> {
    let kind: DataKind = kind
        .parse()
        .map_err(|err: ingest_sdk::model::UnknownDataKind| ApiError::BadRequest(err.to_string()))?;

    if let Admission::Queued(receipt) = state.admission().admit(kind, &body).await {
        return Ok((StatusCode::ACCEPTED, Json(receipt)).into_response());
    }

    let device_id = body
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("deviceId and data are required".into()))?;
    let data = body
        .data
        .as_ref()
        .filter(|data| !data.is_null())
        .ok_or_else(|| ApiError::BadRequest("deviceId and data are required".into()))?;
    let items = normalize_items(data);

    let outcome = state
        .handlers()
        .dispatch(kind, device_id, &items)
        .await
        .map_err(|err| match err {
            HandlerError::Unsupported(_) => ApiError::BadRequest(err.to_string()),
            HandlerError::Store(store) => ApiError::from(store),
        })?;

    ITEMS_PROCESSED
        .with_label_values(&[kind.as_str()])
        .inc_by(outcome.processed as u64);
    ITEMS_FAILED
        .with_label_values(&[kind.as_str()])
        .inc_by(outcome.failed as u64);
    state
        .ledger()
        .record_outcome(device_id, kind, outcome.processed, outcome.failed)
        .await;
    info!(
        device_id,
        kind = %kind,
        processed = outcome.processed,
        failed = outcome.failed,
        "upload processed inline"
    );

    Ok(Json(ImmediateSummary {
        success: true,
        message: format!(
            "{} {kind} items synced ({} inserted, {} updated, {} failed)",
            outcome.processed, outcome.inserted, outcome.updated, outcome.failed
        ),
        processed: outcome.processed,
        failed: outcome.failed,
        inserted: outcome.inserted,
        updated: outcome.updated,
        errors: outcome.errors,
        timestamp: Utc::now(),
    })
    .into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LedgerResponse {
    success: bool,
    device_id: String,
    entries: Vec<SyncLedgerEntry>,
    timestamp: DateTime<Utc>,
}

pub(super) async fn device_ledger(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<LedgerResponse> {
    let entries = state.ledger().entries(&device_id).await?;
    Ok(Json(LedgerResponse {
        success: true,
        device_id,
        entries,
        timestamp: Utc::now(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LedgerEntryResponse {
    success: bool,
    entry: SyncLedgerEntry,
    timestamp: DateTime<Utc>,
}

/// One ledger entry, created fresh on first access.
pub(super) async fn device_ledger_entry(
    State(state): State<AppState>,
    Path((device_id, kind)): Path<(String, String)>,
) -> ApiResult<LedgerEntryResponse> {
    let kind: DataKind = kind
        .parse()
        .map_err(|err: ingest_sdk::model::UnknownDataKind| ApiError::BadRequest(err.to_string()))?;
    let entry = state.ledger().get_or_create(&device_id, kind).await?;
    Ok(Json(LedgerEntryResponse {
        success: true,
        entry,
        timestamp: Utc::now(),
    }))
}
