//! Ingestion backend: raw sample store, aggregation workers and HTTP API
//!
//! Raw samples arrive through the API and land in `raw_samples` as
//! `pending`. Workers claim bounded batches, fold them into hourly buckets
//! and re-derive the daily, weekly and monthly parents, one transaction per
//! batch. The API and the workers share a single connection pool.

pub mod server;
pub mod store;
pub mod worker;

pub use server::{router, serve, AppState};
pub use store::{ClaimedRow, RawStore, ReleaseCounts};
pub use worker::{spawn_workers, AggregationWorker, PassStats};
