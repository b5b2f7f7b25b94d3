//! Asynchronous batch ingestion for harvested device data.
//!
//! Uploads above the admission threshold are written to a durable queue and
//! processed in fixed-size chunks by a single background worker; smaller
//! uploads are upserted inline. Every finished job updates the per-device
//! sync ledger.

pub mod admission;
pub mod config;
pub mod handlers;
pub mod items;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod retention;
pub mod routes;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod worker;
