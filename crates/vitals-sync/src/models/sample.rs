use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MetricType;
use crate::error::{Result, VitalsError};

/// A single measurement as reported by a device data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Sample {
    /// Reject samples the backend would refuse.
    pub fn validate(&self) -> Result<()> {
        if !self.value.is_finite() {
            return Err(VitalsError::invalid_sample(format!(
                "{} value is not finite",
                self.metric_type
            )));
        }
        if self.end_time < self.start_time {
            return Err(VitalsError::invalid_sample(format!(
                "{} sample ends before it starts ({} < {})",
                self.metric_type, self.end_time, self.start_time
            )));
        }
        if self.source.trim().is_empty() {
            return Err(VitalsError::invalid_sample("sample has no source"));
        }
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(VitalsError::invalid_sample(format!(
                    "confidence {} outside [0, 1]",
                    confidence
                )));
            }
        }
        Ok(())
    }

    /// Length of the sample window in minutes
    pub fn duration_minutes(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 60_000.0
    }
}

/// Lifecycle of a raw row in the aggregation work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStatus {
    Pending,
    Processing,
    Aggregated,
    Failed,
}

impl AggregationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationStatus::Pending => "pending",
            AggregationStatus::Processing => "processing",
            AggregationStatus::Aggregated => "aggregated",
            AggregationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AggregationStatus::Pending),
            "processing" => Ok(AggregationStatus::Processing),
            "aggregated" => Ok(AggregationStatus::Aggregated),
            "failed" => Ok(AggregationStatus::Failed),
            other => Err(VitalsError::Database(format!(
                "unknown aggregation status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AggregationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted sample row owned by the backend store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub id: i64,
    pub user_id: String,
    pub sample: Sample,
    pub aggregation_status: AggregationStatus,
    pub aggregated_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}
