use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MetricType;

/// Sync cursor and outcome for one metric from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub user_id: String,
    pub source: String,
    pub metric_type: MetricType,
    /// Latest sample end time known to be persisted by the backend
    pub last_sync_date: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncStatus {
    pub fn new(user_id: &str, source: &str, metric_type: MetricType) -> Self {
        Self {
            user_id: user_id.to_string(),
            source: source.to_string(),
            metric_type,
            last_sync_date: None,
            success: false,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Advance the cursor; it never moves backwards.
    pub fn advance(&mut self, persisted_through: DateTime<Utc>) {
        if self.last_sync_date.map_or(true, |current| persisted_through > current) {
            self.last_sync_date = Some(persisted_through);
        }
    }
}

/// How much history a sync pass fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Full backfill of every available sample
    Historical,
    /// Only samples newer than each metric's cursor
    Incremental,
}

impl std::fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStrategy::Historical => write!(f, "historical"),
            SyncStrategy::Incremental => write!(f, "incremental"),
        }
    }
}
