//! Data models shared by the sync client and the ingestion backend

mod aggregate;
mod dashboard;
mod ingest;
mod metric;
mod sample;
mod sync_status;

pub use aggregate::{Aggregate, AggregateKey, Granularity};
pub use dashboard::DashboardView;
pub use ingest::{IngestReceipt, IngestRequest};
pub use metric::MetricType;
pub use sample::{AggregationStatus, RawSample, Sample};
pub use sync_status::{SyncStatus, SyncStrategy};
