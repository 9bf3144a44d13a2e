use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Sample;

/// Body of an ingestion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub user_id: String,
    pub samples: Vec<Sample>,
}

/// Backend acknowledgement of a persisted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Samples accepted, including ones that were already stored
    pub accepted: usize,
    /// Samples that created a new row
    pub inserted: usize,
    /// Latest sample end time in the chunk
    pub latest: Option<DateTime<Utc>>,
}
