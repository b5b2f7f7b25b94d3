use std::sync::Arc;

use chrono::Utc;
use ingest_sdk::model::{DataKind, IngestRequest, QueuedReceipt};
use tracing::{error, info};

use crate::metrics::ADMISSION_DECISIONS;
use crate::store::{normalize_items, NewQueueRecord, QueueStore};
use crate::worker::WorkerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProceedReason {
    /// Missing device id or data; the caller's own validation applies.
    NotApplicable,
    WithinThreshold,
    /// Enqueue failed, so the upload is handled inline instead.
    EnqueueFailed,
}

impl ProceedReason {
    fn as_str(self) -> &'static str {
        match self {
            ProceedReason::NotApplicable => "not_applicable",
            ProceedReason::WithinThreshold => "immediate",
            ProceedReason::EnqueueFailed => "enqueue_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Proceed(ProceedReason),
    Queued(QueuedReceipt),
}

/// Decides per upload whether to defer it to the queue. Never fails: any
/// problem falls back to inline handling.
#[derive(Clone)]
pub struct AdmissionFilter {
    queue: Arc<dyn QueueStore>,
    threshold: usize,
    batch_size: usize,
}

impl AdmissionFilter {
    pub fn new(queue: Arc<dyn QueueStore>, settings: &WorkerSettings) -> Self {
        Self {
            queue,
            threshold: settings.data_threshold,
            batch_size: settings.batch_size.max(1),
        }
    }

    pub async fn admit(&self, kind: DataKind, request: &IngestRequest) -> Admission {
        let device_id = match request.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return self.decide(kind, ProceedReason::NotApplicable),
        };
        let data = match &request.data {
            Some(data) if !data.is_null() => data,
            _ => return self.decide(kind, ProceedReason::NotApplicable),
        };

        let items = normalize_items(data);
        let count = items.len();
        info!(device_id, kind = %kind, count, threshold = self.threshold, "upload received");

        if count <= self.threshold {
            info!(device_id, kind = %kind, count, "within threshold, processing immediately");
            return self.decide(kind, ProceedReason::WithinThreshold);
        }

        match self
            .queue
            .enqueue(NewQueueRecord::new(device_id, kind, items))
            .await
        {
            Ok(record) => {
                ADMISSION_DECISIONS
                    .with_label_values(&[kind.as_str(), "queued"])
                    .inc();
                info!(
                    job_id = %record.id,
                    device_id,
                    kind = %kind,
                    count,
                    "upload queued for background processing"
                );
                Admission::Queued(QueuedReceipt {
                    success: true,
                    message: format!(
                        "Large dataset queued for processing. {count} items will be processed in batches."
                    ),
                    queue_id: record.id,
                    data_count: count,
                    batch_size: self.batch_size,
                    estimated_batches: count.div_ceil(self.batch_size),
                    status: "queued".to_string(),
                    timestamp: Utc::now(),
                })
            }
            Err(err) => {
                error!(device_id, kind = %kind, error = %err, "enqueue failed, processing inline");
                self.decide(kind, ProceedReason::EnqueueFailed)
            }
        }
    }

    fn decide(&self, kind: DataKind, reason: ProceedReason) -> Admission {
        ADMISSION_DECISIONS
            .with_label_values(&[kind.as_str(), reason.as_str()])
            .inc();
        Admission::Proceed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    fn request(n: usize) -> IngestRequest {
        let items: Vec<Value> = (0..n).map(|i| json!({"contactId": i})).collect();
        IngestRequest {
            device_id: Some("D1".into()),
            data: Some(Value::Array(items)),
        }
    }

    fn filter(store: &Arc<MemoryStore>) -> AdmissionFilter {
        AdmissionFilter::new(store.clone(), &WorkerSettings::default())
    }

    #[tokio::test]
    async fn at_or_below_threshold_is_immediate() {
        let store = MemoryStore::new();
        let filter = filter(&store);
        for n in [0, 1, 499, 500] {
            assert_eq!(
                filter.admit(DataKind::Contacts, &request(n)).await,
                Admission::Proceed(ProceedReason::WithinThreshold)
            );
        }
        assert_eq!(store.queue_len().await, 0);
    }

    #[tokio::test]
    async fn above_threshold_enqueues_once() {
        let store = MemoryStore::new();
        let filter = filter(&store);
        let Admission::Queued(receipt) = filter.admit(DataKind::Contacts, &request(501)).await
        else {
            panic!("expected queued receipt");
        };
        assert_eq!(receipt.data_count, 501);
        assert_eq!(receipt.estimated_batches, 6);
        assert_eq!(receipt.batch_size, 100);
        assert_eq!(receipt.status, "queued");

        let record = store.get(receipt.queue_id).await.unwrap().unwrap();
        assert_eq!(record.item_count, 501);
        assert_eq!(store.queue_len().await, 1);
    }

    #[tokio::test]
    async fn missing_fields_pass_through() {
        let store = MemoryStore::new();
        let filter = filter(&store);
        let no_device = IngestRequest {
            device_id: Some("  ".into()),
            data: Some(json!([1, 2])),
        };
        let no_data = IngestRequest {
            device_id: Some("D1".into()),
            data: None,
        };
        for req in [no_device, no_data] {
            assert_eq!(
                filter.admit(DataKind::Messages, &req).await,
                Admission::Proceed(ProceedReason::NotApplicable)
            );
        }
    }

    #[tokio::test]
    async fn single_object_counts_as_one_item() {
        let store = MemoryStore::new();
        let req = IngestRequest {
            device_id: Some("D1".into()),
            data: Some(json!({"contactId": "c1"})),
        };
        assert_eq!(
            filter(&store).admit(DataKind::Contacts, &req).await,
            Admission::Proceed(ProceedReason::WithinThreshold)
        );
    }
}
