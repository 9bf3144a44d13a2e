use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::{MetricType, Sample};
use crate::error::{Result, VitalsError};

/// Time bucket width of an aggregate row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Buckets derived from hourly buckets, in cascade order
    pub const PARENTS: [Granularity; 3] = [Granularity::Day, Granularity::Week, Granularity::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(VitalsError::Database(format!("unknown granularity '{}'", other))),
        }
    }

    /// Start of the bucket containing `ts`.
    ///
    /// Buckets are aligned in UTC; weeks start on Monday.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        let midnight = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());

        let start = match self {
            Granularity::Hour => date.and_hms_opt(ts.hour(), 0, 0).map(|dt| dt.and_utc()),
            Granularity::Day => midnight(date),
            Granularity::Week => {
                midnight(date - Duration::days(date.weekday().num_days_from_monday() as i64))
            }
            Granularity::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1).and_then(midnight),
        };

        // Every component above is derived from a valid timestamp
        start.unwrap_or(ts)
    }

    /// Exclusive end of the bucket starting at `start`
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Hour => start + Duration::hours(1),
            Granularity::Day => start + Duration::days(1),
            Granularity::Week => start + Duration::days(7),
            Granularity::Month => {
                let date = start.date_naive();
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
                    .unwrap_or(start + Duration::days(31))
            }
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an aggregate row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub user_id: String,
    pub metric_type: MetricType,
    pub granularity: Granularity,
    pub bucket_start: DateTime<Utc>,
}

impl AggregateKey {
    /// Key of the `granularity` bucket that contains `ts`
    pub fn containing(
        user_id: &str,
        metric_type: MetricType,
        granularity: Granularity,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            metric_type,
            granularity,
            bucket_start: granularity.bucket_start(ts),
        }
    }

    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.granularity.bucket_end(self.bucket_start)
    }

    /// Parent bucket of this key at a coarser granularity
    pub fn parent(&self, granularity: Granularity) -> Self {
        Self::containing(&self.user_id, self.metric_type, granularity, self.bucket_start)
    }
}

/// Rolled-up statistics for one metric over one bucket.
///
/// Aggregates are derived data: the same inputs in the same order always
/// produce the same row, so a bucket can be dropped and rebuilt at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    #[serde(flatten)]
    pub key: AggregateKey,
    pub total: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    pub duration_minutes: Option<f64>,
    pub primary_source: Option<String>,
    pub sources_included: BTreeSet<String>,
    pub source_counts: BTreeMap<String, u64>,
}

impl Aggregate {
    /// Build an hourly (or any leaf) bucket from raw samples.
    ///
    /// Returns `None` when there are no samples.
    pub fn from_samples<'a>(
        key: AggregateKey,
        samples: impl IntoIterator<Item = &'a Sample>,
    ) -> Option<Self> {
        let mut acc = Accumulator::default();
        for sample in samples {
            acc.add(
                sample.value,
                sample.value,
                sample.value,
                1,
                sample.duration_minutes(),
            );
            *acc.source_counts.entry(sample.source.clone()).or_insert(0) += 1;
        }
        acc.finish(key)
    }

    /// Re-derive a parent bucket from its constituent child buckets
    pub fn derive<'a>(key: AggregateKey, children: impl IntoIterator<Item = &'a Aggregate>) -> Option<Self> {
        let mut acc = Accumulator::default();
        for child in children {
            acc.add(
                child.total,
                child.min,
                child.max,
                child.count,
                child.duration_minutes.unwrap_or(0.0),
            );
            for (source, n) in &child.source_counts {
                *acc.source_counts.entry(source.clone()).or_insert(0) += n;
            }
        }
        acc.finish(key)
    }
}

#[derive(Default)]
struct Accumulator {
    total: f64,
    min: Option<f64>,
    max: Option<f64>,
    count: u64,
    duration: f64,
    source_counts: BTreeMap<String, u64>,
}

impl Accumulator {
    fn add(&mut self, total: f64, min: f64, max: f64, count: u64, duration: f64) {
        self.total += total;
        self.min = Some(self.min.map_or(min, |m| m.min(min)));
        self.max = Some(self.max.map_or(max, |m| m.max(max)));
        self.count += count;
        self.duration += duration;
    }

    fn finish(self, key: AggregateKey) -> Option<Aggregate> {
        if self.count == 0 {
            return None;
        }

        // Ties go to the lexicographically smallest source
        let mut primary: Option<(&String, u64)> = None;
        for (source, &n) in &self.source_counts {
            if primary.map_or(true, |(_, best)| n > best) {
                primary = Some((source, n));
            }
        }
        let primary_source = primary.map(|(s, _)| s.clone());

        let duration_minutes = key.metric_type.is_duration().then_some(self.duration);

        Some(Aggregate {
            total: self.total,
            average: self.total / self.count as f64,
            min: self.min.unwrap_or(0.0),
            max: self.max.unwrap_or(0.0),
            count: self.count,
            duration_minutes,
            primary_source,
            sources_included: self.source_counts.keys().cloned().collect(),
            source_counts: self.source_counts,
            key,
        })
    }
}
