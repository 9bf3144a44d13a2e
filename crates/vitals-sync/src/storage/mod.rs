//! Local storage for the sync client
//!
//! The client keeps a single SQLite file holding per-metric sync cursors.
//! Raw samples and aggregates live only in the backend store.
//!
//! ```text
//! ~/.local/share/vitals-sync/
//! ├── sync.db       # client sync status (this module)
//! └── backend.db    # backend raw samples + aggregates (when serving locally)
//! ```

mod sync_db;

pub use sync_db::SyncDb;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{MetricType, SyncStatus};

/// Sync database shared between the transport, orchestrator and CLI
#[derive(Clone)]
pub struct SharedSyncDb(Arc<Mutex<SyncDb>>);

impl SharedSyncDb {
    pub fn new(db: SyncDb) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    /// Open the database at `path`, creating parent directories as needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::config::ensure_dir(parent)?;
        }
        Ok(Self::new(SyncDb::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(SyncDb::open_in_memory()?))
    }

    pub async fn get_status(
        &self,
        user_id: &str,
        source: &str,
        metric_type: MetricType,
    ) -> Result<Option<SyncStatus>> {
        self.0.lock().await.get_status(user_id, source, metric_type)
    }

    pub async fn upsert_status(&self, status: &SyncStatus) -> Result<()> {
        self.0.lock().await.upsert_status(status)
    }

    pub async fn list_statuses(&self, user_id: &str) -> Result<Vec<SyncStatus>> {
        self.0.lock().await.list_statuses(user_id)
    }

    pub async fn cursors(
        &self,
        user_id: &str,
        source: &str,
    ) -> Result<HashMap<MetricType, DateTime<Utc>>> {
        self.0.lock().await.cursors(user_id, source)
    }
}
