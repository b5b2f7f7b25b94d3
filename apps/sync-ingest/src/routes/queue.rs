use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use ingest_sdk::model::{
    ClearFailedResponse, DataKind, GroupBreakdown, JobStatusResponse, JobStatusView, QueueStatus,
    QueueStatusResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, ApiResult};
use crate::state::AppState;
use crate::store::{DeleteOutcome, Grouping, Page, QueueFilter, ResetOutcome};

const MAX_PAGE_SIZE: u32 = 100;

pub(super) async fn status(State(state): State<AppState>) -> ApiResult<QueueStatusResponse> {
    let statistics = state.queue().breakdown(Grouping::Status).await?;
    Ok(Json(QueueStatusResponse {
        success: true,
        queue_status: state.worker().status().await,
        statistics,
        timestamp: Utc::now(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatsSummary {
    total_items: u64,
    pending_items: u64,
    processing_items: u64,
    completed_items: u64,
    failed_items: u64,
    partially_completed_items: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatsResponse {
    success: bool,
    summary: StatsSummary,
    status_breakdown: Vec<GroupBreakdown>,
    device_stats: Vec<GroupBreakdown>,
    data_type_stats: Vec<GroupBreakdown>,
    timestamp: DateTime<Utc>,
}

fn count_for(rows: &[GroupBreakdown], status: QueueStatus) -> u64 {
    rows.iter()
        .find(|row| row.key == status.as_str())
        .map(|row| row.count)
        .unwrap_or(0)
}

fn busiest_first(mut rows: Vec<GroupBreakdown>) -> Vec<GroupBreakdown> {
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    rows
}

pub(super) async fn stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let queue = state.queue();
    let by_status = queue.breakdown(Grouping::Status).await?;
    let by_device = queue.breakdown(Grouping::Device).await?;
    let by_kind = queue.breakdown(Grouping::Kind).await?;

    let summary = StatsSummary {
        total_items: by_status.iter().map(|row| row.count).sum(),
        pending_items: count_for(&by_status, QueueStatus::Pending),
        processing_items: count_for(&by_status, QueueStatus::Processing),
        completed_items: count_for(&by_status, QueueStatus::Completed),
        failed_items: count_for(&by_status, QueueStatus::Failed),
        partially_completed_items: count_for(&by_status, QueueStatus::PartiallyCompleted),
    };
    Ok(Json(StatsResponse {
        success: true,
        summary,
        status_breakdown: by_status,
        device_stats: busiest_first(by_device),
        data_type_stats: busiest_first(by_kind),
        timestamp: Utc::now(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListQuery {
    page: Option<u32>,
    limit: Option<u32>,
    status: Option<String>,
    device_id: Option<String>,
    data_type: Option<String>,
}

impl ListQuery {
    fn filter(&self) -> Result<QueueFilter, ApiError> {
        let status = non_blank(&self.status)
            .map(|s| s.parse::<QueueStatus>())
            .transpose()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        let data_kind = non_blank(&self.data_type)
            .map(|s| s.parse::<DataKind>())
            .transpose()
            .map_err(|err| ApiError::BadRequest(err.to_string()))?;
        Ok(QueueFilter {
            status,
            device_id: non_blank(&self.device_id).map(str::to_string),
            data_kind,
        })
    }

    fn page(&self) -> Page {
        Page {
            page: self.page.unwrap_or(1).max(1),
            limit: self.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Pagination {
    page: u32,
    limit: u32,
    total: u64,
    total_pages: u64,
    has_next: bool,
    has_prev: bool,
}

impl Pagination {
    fn new(page: Page, total: u64) -> Self {
        let total_pages = total.div_ceil(page.limit as u64);
        Self {
            page: page.page,
            limit: page.limit,
            total,
            total_pages,
            has_next: (page.page as u64) < total_pages,
            has_prev: page.page > 1,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListResponse {
    success: bool,
    items: Vec<JobStatusView>,
    pagination: Pagination,
    timestamp: DateTime<Utc>,
}

pub(super) async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<ListResponse> {
    let filter = query.filter()?;
    let page = query.page();
    let (records, total) = state.queue().list(&filter, page).await?;
    let now = Utc::now();
    Ok(Json(ListResponse {
        success: true,
        items: records.iter().map(|r| r.status_view(now)).collect(),
        pagination: Pagination::new(page, total),
        timestamp: now,
    }))
}

pub(super) async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<JobStatusResponse> {
    let record = state
        .queue()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Queue item not found".into()))?;
    let now = Utc::now();
    Ok(Json(JobStatusResponse {
        success: true,
        queue_item: record.status_view(now),
        timestamp: now,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ActionResponse {
    success: bool,
    message: String,
    timestamp: DateTime<Utc>,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            timestamp: Utc::now(),
        })
    }
}

pub(super) async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ActionResponse> {
    match state.queue().delete(id).await? {
        DeleteOutcome::Deleted => {
            info!(job_id = %id, "queue item deleted");
            Ok(ActionResponse::ok("Queue item deleted successfully"))
        }
        DeleteOutcome::Missing => Err(ApiError::NotFound("Queue item not found".into())),
        DeleteOutcome::Refused(status) => Err(ApiError::Conflict(format!(
            "Cannot delete {status} queue items"
        ))),
    }
}

pub(super) async fn clear_failed(State(state): State<AppState>) -> ApiResult<ClearFailedResponse> {
    let deleted_count = state.queue().delete_failed().await?;
    info!(deleted_count, "failed queue items cleared");
    Ok(Json(ClearFailedResponse {
        success: true,
        message: format!("Cleared {deleted_count} failed queue items"),
        deleted_count,
        timestamp: Utc::now(),
    }))
}

pub(super) async fn retry_item(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ActionResponse> {
    match state.queue().reset_failed(id).await? {
        ResetOutcome::Reset => {
            info!(job_id = %id, "failed queue item re-queued");
            Ok(ActionResponse::ok("Queue item queued for retry"))
        }
        ResetOutcome::Missing => Err(ApiError::NotFound("Queue item not found".into())),
        ResetOutcome::Refused(status) => Err(ApiError::Conflict(format!(
            "Only failed queue items can be retried (item is {status})"
        ))),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WorkerToggleResponse {
    success: bool,
    message: &'static str,
    is_processing: bool,
    timestamp: DateTime<Utc>,
}

pub(super) async fn start_worker(State(state): State<AppState>) -> Json<WorkerToggleResponse> {
    let started = state.worker().start().await;
    Json(WorkerToggleResponse {
        success: true,
        message: if started {
            "Queue processing started"
        } else {
            "Queue processing already running"
        },
        is_processing: state.worker().is_processing().await,
        timestamp: Utc::now(),
    })
}

pub(super) async fn stop_worker(State(state): State<AppState>) -> Json<WorkerToggleResponse> {
    let stopped = state.worker().stop().await;
    Json(WorkerToggleResponse {
        success: true,
        message: if stopped {
            "Queue processing stopped"
        } else {
            "Queue processing already stopped"
        },
        is_processing: state.worker().is_processing().await,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_flags() {
        let p = Pagination::new(Page { page: 2, limit: 20 }, 45);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(p.has_prev);

        let p = Pagination::new(Page { page: 1, limit: 20 }, 0);
        assert_eq!(p.total_pages, 0);
        assert!(!p.has_next);
        assert!(!p.has_prev);
    }

    #[test]
    fn list_query_rejects_unknown_filters() {
        let query = ListQuery {
            status: Some("archived".into()),
            ..ListQuery::default()
        };
        assert!(matches!(query.filter(), Err(ApiError::BadRequest(_))));

        let query = ListQuery {
            limit: Some(1000),
            data_type: Some("contacts".into()),
            ..ListQuery::default()
        };
        assert_eq!(query.page().limit, MAX_PAGE_SIZE);
        assert_eq!(query.filter().unwrap().data_kind, Some(DataKind::Contacts));
    }
}
