//! Device-side sync pipeline
//!
//! Provides:
//! - Strategy selection between historical backfill and incremental sync
//! - Chunked upload with per-metric cursors that only advance past persisted data
//! - Connectivity monitoring with restoration events
//! - Linear retry backoff for network failures
//! - A cooperative scheduler for periodic and event-driven syncs

pub mod network;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod transport;

pub use network::{ConnectivityProbe, HttpProbe, NetworkEvent, NetworkMonitor, NetworkState};
pub use orchestrator::{decide_sync_strategy, SyncNotice, SyncOrchestrator, SyncOutcome, SyncReport};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{SchedulerHandle, SyncScheduler, SyncTrigger};
pub use transport::{SyncTransport, UploadReport};
