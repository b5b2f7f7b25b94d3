use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ingest_sdk::model::DataKind;
use serde_json::Value;
use tracing::debug;

use crate::items::{label, raw_natural_key, DeviceItem, ItemError};
use crate::store::{RecordStore, StoreError};

/// Counts produced by one handler call over a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: u32,
    pub failed: u32,
    pub inserted: u32,
    pub updated: u32,
    pub errors: Vec<String>,
}

impl BatchOutcome {
    /// Every item of the chunk counted as failed under one message.
    pub fn all_failed(len: usize, message: impl Into<String>) -> Self {
        Self {
            failed: len as u32,
            errors: vec![message.into()],
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("unsupported data type: {0}")]
    Unsupported(DataKind),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait BatchHandler: Send + Sync {
    fn kind(&self) -> DataKind;

    /// Upserts every item independently. Only systemic store failures are
    /// returned as `Err`; item-level problems are folded into the outcome.
    async fn process_batch(
        &self,
        device_id: &str,
        items: &[Value],
    ) -> Result<BatchOutcome, StoreError>;
}

enum Upserted {
    Inserted,
    Updated,
}

#[derive(Debug, thiserror::Error)]
enum UpsertError {
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lookup-then-write upsert on `(kind, device, natural key)`.
pub struct UpsertHandler {
    kind: DataKind,
    records: Arc<dyn RecordStore>,
}

impl UpsertHandler {
    pub fn new(kind: DataKind, records: Arc<dyn RecordStore>) -> Self {
        Self { kind, records }
    }

    async fn upsert_one(&self, device_id: &str, raw: &Value) -> Result<Upserted, UpsertError> {
        let item = DeviceItem::parse(self.kind, raw)?;
        item.validate()?;
        let key = item
            .natural_key()
            .map(str::to_string)
            .ok_or(ItemError::MissingField(crate::items::natural_key_field(self.kind)))?;
        let mut fields = item.into_fields()?;
        fields.insert("deviceId".into(), Value::String(device_id.to_string()));

        match self.records.find_record(self.kind, device_id, &key).await? {
            Some(existing) => {
                self.records.update_record(existing.id, fields).await?;
                Ok(Upserted::Updated)
            }
            None => {
                self.records
                    .insert_record(self.kind, device_id, &key, fields)
                    .await?;
                Ok(Upserted::Inserted)
            }
        }
    }
}

#[async_trait]
impl BatchHandler for UpsertHandler {
    fn kind(&self) -> DataKind {
        self.kind
    }

    async fn process_batch(
        &self,
        device_id: &str,
        items: &[Value],
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();
        for raw in items {
            match self.upsert_one(device_id, raw).await {
                Ok(Upserted::Inserted) => {
                    outcome.processed += 1;
                    outcome.inserted += 1;
                }
                Ok(Upserted::Updated) => {
                    outcome.processed += 1;
                    outcome.updated += 1;
                }
                Err(UpsertError::Store(err)) if err.is_systemic() => return Err(err),
                Err(err) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!(
                        "{} {}: {}",
                        label(self.kind),
                        raw_natural_key(self.kind, raw),
                        err
                    ));
                }
            }
        }
        debug!(
            kind = %self.kind,
            device_id,
            processed = outcome.processed,
            failed = outcome.failed,
            "batch upserted"
        );
        Ok(outcome)
    }
}

/// Closed mapping from data kind to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<DataKind, Arc<dyn BatchHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the five upsert handlers against one record store.
    pub fn with_records(records: Arc<dyn RecordStore>) -> Self {
        let mut registry = Self::new();
        for kind in [
            DataKind::Contacts,
            DataKind::CallLogs,
            DataKind::Messages,
            DataKind::Notifications,
            DataKind::EmailAccounts,
        ] {
            registry.register(Arc::new(UpsertHandler::new(kind, records.clone())));
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn BatchHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: DataKind) -> Option<&Arc<dyn BatchHandler>> {
        self.handlers.get(&kind)
    }

    pub async fn dispatch(
        &self,
        kind: DataKind,
        device_id: &str,
        items: &[Value],
    ) -> Result<BatchOutcome, HandlerError> {
        let handler = self.get(kind).ok_or(HandlerError::Unsupported(kind))?;
        Ok(handler.process_batch(device_id, items).await?)
    }
}
