//! Wire types shared by the ingestion service and its clients.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Category of harvested device data carried by an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Contacts,
    CallLogs,
    Messages,
    Notifications,
    EmailAccounts,
    Whatsapp,
}

impl DataKind {
    pub const ALL: [DataKind; 6] = [
        DataKind::Contacts,
        DataKind::CallLogs,
        DataKind::Messages,
        DataKind::Notifications,
        DataKind::EmailAccounts,
        DataKind::Whatsapp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Contacts => "contacts",
            DataKind::CallLogs => "calllogs",
            DataKind::Messages => "messages",
            DataKind::Notifications => "notifications",
            DataKind::EmailAccounts => "emailaccounts",
            DataKind::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported data type: {0}")]
pub struct UnknownDataKind(pub String);

impl FromStr for DataKind {
    type Err = UnknownDataKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        DataKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| UnknownDataKind(s.to_string()))
    }
}

/// Lifecycle of a queued ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::PartiallyCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::PartiallyCompleted => "partially_completed",
        }
    }

    /// Status implied by a finished pass over a payload.
    pub fn from_failures(failed: u32) -> Self {
        if failed > 0 {
            QueueStatus::PartiallyCompleted
        } else {
            QueueStatus::Completed
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown queue status: {0}")]
pub struct UnknownQueueStatus(pub String);

impl FromStr for QueueStatus {
    type Err = UnknownQueueStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownQueueStatus(s.to_string()))
    }
}

/// Outcome recorded in the per-device sync ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialSuccess => "partial_success",
            SyncStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sync status: {0}")]
pub struct UnknownSyncStatus(pub String);

impl FromStr for SyncStatus {
    type Err = UnknownSyncStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "partial_success" => Ok(SyncStatus::PartialSuccess),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(UnknownSyncStatus(other.to_string())),
        }
    }
}

/// Body of an upload. Both fields are optional so the admission filter can
/// hand malformed requests back to the synchronous path untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedReceipt {
    pub success: bool,
    pub message: String,
    pub queue_id: Uuid,
    pub data_count: usize,
    pub batch_size: usize,
    pub estimated_batches: usize,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateSummary {
    pub success: bool,
    pub message: String,
    pub processed: u32,
    pub failed: u32,
    pub inserted: u32,
    pub updated: u32,
    pub errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Progress view of one queued job, as exposed to admin tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: Uuid,
    pub device_id: String,
    pub data_type: DataKind,
    pub status: QueueStatus,
    pub data_count: u32,
    pub processed_count: u32,
    pub failed_count: u32,
    pub progress: u8,
    /// Milliseconds, extrapolated from the processing rate so far.
    pub estimated_time_remaining: Option<i64>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub success: bool,
    pub queue_item: JobStatusView,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over queue records sharing one grouping key (status, device or kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupBreakdown {
    pub key: String,
    pub count: u64,
    pub total_data_count: u64,
    pub total_processed_count: u64,
    pub total_failed_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub is_processing: bool,
    pub batch_size: usize,
    pub max_retries: u32,
    pub processing_delay: u64,
    pub retry_delay: u64,
    pub data_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub success: bool,
    pub queue_status: WorkerStatus,
    pub statistics: Vec<GroupBreakdown>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearFailedResponse {
    pub success: bool,
    pub message: String,
    pub deleted_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Last sync outcome for one (device, kind) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLedgerEntry {
    pub device_id: String,
    pub data_kind: DataKind,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub item_count: u32,
    pub last_sync_status: SyncStatus,
    pub last_sync_message: String,
    pub is_enabled: bool,
}

impl SyncLedgerEntry {
    pub fn fresh(device_id: &str, data_kind: DataKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            data_kind,
            last_sync_time: None,
            item_count: 0,
            last_sync_status: SyncStatus::Success,
            last_sync_message: String::new(),
            is_enabled: true,
        }
    }
}
