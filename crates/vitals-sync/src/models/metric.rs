use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VitalsError;

/// Health metric kinds reported by device data sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    RestingHeartRate,
    HeartRateVariability,
    StepCount,
    DistanceWalkingRunning,
    ActiveEnergy,
    StandTime,
    ExerciseTime,
    Sleep,
    BloodOxygen,
    RespiratoryRate,
    BodyMass,
}

impl MetricType {
    pub const ALL: [MetricType; 12] = [
        MetricType::HeartRate,
        MetricType::RestingHeartRate,
        MetricType::HeartRateVariability,
        MetricType::StepCount,
        MetricType::DistanceWalkingRunning,
        MetricType::ActiveEnergy,
        MetricType::StandTime,
        MetricType::ExerciseTime,
        MetricType::Sleep,
        MetricType::BloodOxygen,
        MetricType::RespiratoryRate,
        MetricType::BodyMass,
    ];

    /// Default coverage set used by the sync strategy decision
    pub const CORE: [MetricType; 4] = [
        MetricType::HeartRate,
        MetricType::StepCount,
        MetricType::ActiveEnergy,
        MetricType::StandTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "heart_rate",
            MetricType::RestingHeartRate => "resting_heart_rate",
            MetricType::HeartRateVariability => "heart_rate_variability",
            MetricType::StepCount => "step_count",
            MetricType::DistanceWalkingRunning => "distance_walking_running",
            MetricType::ActiveEnergy => "active_energy",
            MetricType::StandTime => "stand_time",
            MetricType::ExerciseTime => "exercise_time",
            MetricType::Sleep => "sleep",
            MetricType::BloodOxygen => "blood_oxygen",
            MetricType::RespiratoryRate => "respiratory_rate",
            MetricType::BodyMass => "body_mass",
        }
    }

    /// Metrics whose samples describe a span of time rather than a reading.
    ///
    /// Aggregates of these carry `duration_minutes`.
    pub fn is_duration(&self) -> bool {
        matches!(
            self,
            MetricType::Sleep | MetricType::StandTime | MetricType::ExerciseTime
        )
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = VitalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| VitalsError::invalid_sample(format!("unknown metric type '{}'", s)))
    }
}
