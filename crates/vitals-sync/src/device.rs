//! Device data sources
//!
//! The sync pipeline only needs a query-by-time-range capability from the
//! device. [`JsonFileSource`] serves samples from an exported JSON array.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, VitalsError};
use crate::models::{MetricType, Sample};

/// Query-by-time-range access to device samples
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Samples of `metric` whose end time falls in `(from, to]`, oldest first
    async fn query(&self, metric: MetricType, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Sample>>;
}

/// Device source backed by a JSON export
#[derive(Debug, Clone, Default)]
pub struct JsonFileSource {
    samples: Vec<Sample>,
}

impl JsonFileSource {
    /// Load an exported JSON array of samples
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VitalsError::config(format!("Failed to read device export {}: {}", path.display(), e))
        })?;
        let samples: Vec<Sample> = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), samples = samples.len(), "loaded device export");
        Ok(Self::from_samples(samples))
    }

    pub fn from_samples(mut samples: Vec<Sample>) -> Self {
        samples.sort_by_key(|s| (s.metric_type, s.end_time, s.start_time));
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[async_trait]
impl DeviceSource for JsonFileSource {
    async fn query(&self, metric: MetricType, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Sample>> {
        Ok(self
            .samples
            .iter()
            .filter(|s| s.metric_type == metric && s.end_time > from && s.end_time <= to)
            .cloned()
            .collect())
    }
}
