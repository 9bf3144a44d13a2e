use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Aggregate, Granularity};

/// Four-granularity aggregate view served to the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardView {
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub hourly: Vec<Aggregate>,
    pub daily: Vec<Aggregate>,
    pub weekly: Vec<Aggregate>,
    pub monthly: Vec<Aggregate>,
}

impl DashboardView {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            generated_at: Utc::now(),
            hourly: Vec::new(),
            daily: Vec::new(),
            weekly: Vec::new(),
            monthly: Vec::new(),
        }
    }

    pub fn buckets(&self, granularity: Granularity) -> &[Aggregate] {
        match granularity {
            Granularity::Hour => &self.hourly,
            Granularity::Day => &self.daily,
            Granularity::Week => &self.weekly,
            Granularity::Month => &self.monthly,
        }
    }
}
