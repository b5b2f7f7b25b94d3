//! Asynchronous client for the sync-ingest service.
//!
//! Consumed by admin tooling, device simulators and tests. Large uploads come
//! back as a queued receipt; callers poll [`IngestClient::job_status`] until the
//! job reaches a terminal status.

pub mod model;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    ClearFailedResponse, DataKind, ImmediateSummary, IngestRequest, JobStatusResponse,
    JobStatusView, QueueStatusResponse, QueuedReceipt,
};

#[derive(Clone)]
pub struct IngestClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
}

/// What the service did with an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Queued(QueuedReceipt),
    Processed(ImmediateSummary),
}

impl IngestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn submit(
        &self,
        kind: DataKind,
        device_id: &str,
        items: Vec<Value>,
    ) -> Result<SubmitOutcome, ClientError> {
        let body = IngestRequest {
            device_id: Some(device_id.to_string()),
            data: Some(Value::Array(items)),
        };
        let res = self
            .http
            .post(self.url(&format!("/api/sync/{kind}")))
            .json(&body)
            .send()
            .await?;

        match res.status() {
            StatusCode::ACCEPTED => Ok(SubmitOutcome::Queued(res.json().await?)),
            status if status.is_success() => Ok(SubmitOutcome::Processed(res.json().await?)),
            _ => Err(unexpected(res).await),
        }
    }

    pub async fn job_status(&self, queue_id: Uuid) -> Result<JobStatusView, ClientError> {
        let res = self
            .http
            .get(self.url(&format!("/api/queue/items/{queue_id}")))
            .send()
            .await?;
        let body: JobStatusResponse = parse(res).await?;
        Ok(body.queue_item)
    }

    pub async fn queue_status(&self) -> Result<QueueStatusResponse, ClientError> {
        let res = self.http.get(self.url("/api/queue/status")).send().await?;
        parse(res).await
    }

    /// Deletes every failed job and returns how many were removed.
    pub async fn clear_failed(&self) -> Result<u64, ClientError> {
        let res = self
            .http
            .delete(self.url("/api/queue/items/failed"))
            .send()
            .await?;
        let body: ClearFailedResponse = parse(res).await?;
        Ok(body.deleted_count)
    }
}

async fn parse<T>(res: Response) -> Result<T, ClientError>
where
    T: DeserializeOwned,
{
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        Err(unexpected(res).await)
    }
}

async fn unexpected(res: Response) -> ClientError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    ClientError::UnexpectedStatus { status, body }
}
