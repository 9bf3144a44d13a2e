//! Integration tests for the backend store and aggregation workers
//!
//! Each test opens a file-backed SQLite pool in a temp directory, so the
//! workers contend for rows the same way they do under `vitals serve`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;
use vitals_sync::backend::{AggregationWorker, PassStats, RawStore};
use vitals_sync::config::{BackendConfig, DashboardWindow};
use vitals_sync::models::{Aggregate, AggregationStatus, Granularity, MetricType, Sample};

const USER: &str = "user-1";

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, day, hour, minute, 0).unwrap()
}

fn sample(metric: MetricType, value: f64, start: DateTime<Utc>, minutes: i64, source: &str) -> Sample {
    Sample {
        metric_type: metric,
        value,
        unit: "u".to_string(),
        start_time: start,
        end_time: start + Duration::minutes(minutes),
        source: source.to_string(),
        confidence: None,
    }
}

async fn open_store(temp: &TempDir) -> RawStore {
    RawStore::open(&temp.path().join("backend.db"), &BackendConfig::default())
        .await
        .expect("open store")
}

async fn all_aggregates(store: &RawStore) -> Vec<Aggregate> {
    let mut all = Vec::new();
    for granularity in [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ] {
        all.extend(store.list_aggregates(USER, granularity, None).await.unwrap());
    }
    all
}

fn find<'a>(aggregates: &'a [Aggregate], metric: MetricType, start: DateTime<Utc>) -> &'a Aggregate {
    aggregates
        .iter()
        .find(|a| a.key.metric_type == metric && a.key.bucket_start == start)
        .unwrap_or_else(|| panic!("no {} bucket at {}", metric, start))
}

/// Two days in the same Monday-based week and the same month
fn cascade_samples() -> Vec<Sample> {
    vec![
        sample(MetricType::StepCount, 100.0, at(1, 9, 0), 5, "watch"),
        sample(MetricType::StepCount, 200.0, at(1, 9, 10), 5, "watch"),
        sample(MetricType::StepCount, 300.0, at(1, 9, 20), 5, "watch"),
        sample(MetricType::StepCount, 50.0, at(2, 10, 0), 5, "phone"),
        sample(MetricType::StepCount, 50.0, at(2, 10, 30), 5, "phone"),
        sample(MetricType::Sleep, 1.0, at(1, 1, 0), 420, "watch"),
    ]
}

mod cascade_tests {
    use super::*;

    #[tokio::test]
    async fn test_hourly_buckets_roll_up_to_every_granularity() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.ingest(USER, &cascade_samples()).await.unwrap();

        let worker = AggregationWorker::new(0, store.clone(), &BackendConfig::default());
        let stats = worker.run_pass().await.unwrap();
        assert_eq!(stats.processed, 6);
        assert_eq!(stats.failed, 0);

        let hourly = store.list_aggregates(USER, Granularity::Hour, None).await.unwrap();
        let steps_day1 = find(&hourly, MetricType::StepCount, at(1, 9, 0));
        assert_eq!(steps_day1.count, 3);
        assert_eq!(steps_day1.total, 600.0);
        assert_eq!(steps_day1.average, 200.0);
        assert_eq!(steps_day1.min, 100.0);
        assert_eq!(steps_day1.max, 300.0);
        assert_eq!(steps_day1.duration_minutes, None);

        let daily = store.list_aggregates(USER, Granularity::Day, None).await.unwrap();
        assert_eq!(find(&daily, MetricType::StepCount, at(1, 0, 0)).total, 600.0);
        assert_eq!(find(&daily, MetricType::StepCount, at(2, 0, 0)).total, 100.0);

        // 2025-03-31 is the Monday of that week
        let weekly = store.list_aggregates(USER, Granularity::Week, None).await.unwrap();
        let week_start = Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap();
        let week = find(&weekly, MetricType::StepCount, week_start);
        assert_eq!(week.count, 5);
        assert_eq!(week.total, 700.0);
        assert_eq!(week.min, 50.0);
        assert_eq!(week.max, 300.0);
        assert_eq!(week.primary_source.as_deref(), Some("watch"));
        assert_eq!(
            week.sources_included.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["phone", "watch"]
        );
        assert_eq!(week.source_counts["phone"], 2);

        let monthly = store.list_aggregates(USER, Granularity::Month, None).await.unwrap();
        let month = find(&monthly, MetricType::StepCount, at(1, 0, 0));
        assert_eq!(month.total, 700.0);

        let sleep = find(&monthly, MetricType::Sleep, at(1, 0, 0));
        assert_eq!(sleep.duration_minutes, Some(420.0));
    }

    #[tokio::test]
    async fn test_late_sample_updates_existing_buckets() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.ingest(USER, &cascade_samples()).await.unwrap();

        let worker = AggregationWorker::new(0, store.clone(), &BackendConfig::default());
        worker.run_pass().await.unwrap();

        store
            .ingest(
                USER,
                &[sample(MetricType::StepCount, 400.0, at(1, 9, 45), 5, "phone")],
            )
            .await
            .unwrap();
        let stats = worker.run_pass().await.unwrap();
        assert_eq!(stats.processed, 1);

        let hourly = store.list_aggregates(USER, Granularity::Hour, None).await.unwrap();
        let hour = find(&hourly, MetricType::StepCount, at(1, 9, 0));
        assert_eq!(hour.count, 4);
        assert_eq!(hour.total, 1000.0);
        assert_eq!(hour.max, 400.0);

        let weekly = store.list_aggregates(USER, Granularity::Week, None).await.unwrap();
        let week = find(
            &weekly,
            MetricType::StepCount,
            Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap(),
        );
        assert_eq!(week.count, 6);
        assert_eq!(week.total, 1100.0);
        // 3 phone vs 3 watch; ties go to the smaller name
        assert_eq!(week.primary_source.as_deref(), Some("phone"));
    }

    #[tokio::test]
    async fn test_rebuild_reproduces_incremental_aggregates() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        // Aggregate in several small batches and passes
        let cfg = BackendConfig {
            batch_size: 2,
            ..BackendConfig::default()
        };
        let worker = AggregationWorker::new(0, store.clone(), &cfg);
        let samples = cascade_samples();
        for chunk in samples.chunks(3) {
            store.ingest(USER, chunk).await.unwrap();
            worker.run_pass().await.unwrap();
        }

        let incremental = all_aggregates(&store).await;
        assert!(!incremental.is_empty());

        let written = store.rebuild_aggregates(USER).await.unwrap();
        assert_eq!(written, incremental.len());
        assert_eq!(all_aggregates(&store).await, incremental);

        // A second rebuild changes nothing either
        store.rebuild_aggregates(USER).await.unwrap();
        assert_eq!(all_aggregates(&store).await, incremental);
    }

    #[tokio::test]
    async fn test_aggregates_are_scoped_per_user() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.ingest(USER, &cascade_samples()).await.unwrap();
        store
            .ingest(
                "user-2",
                &[sample(MetricType::StepCount, 9.0, at(1, 9, 0), 5, "watch")],
            )
            .await
            .unwrap();

        AggregationWorker::new(0, store.clone(), &BackendConfig::default())
            .run_pass()
            .await
            .unwrap();

        let other = store
            .list_aggregates("user-2", Granularity::Hour, None)
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].total, 9.0);

        let hourly = store.list_aggregates(USER, Granularity::Hour, None).await.unwrap();
        assert_eq!(find(&hourly, MetricType::StepCount, at(1, 9, 0)).total, 600.0);
    }
}

mod worker_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_aggregate_each_row_once() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        // 600 samples over 10 hours, one per minute
        let samples: Vec<Sample> = (0..600)
            .map(|i| {
                let start = at(3, 0, 0) + Duration::minutes(i);
                sample(MetricType::HeartRate, 60.0 + (i % 40) as f64, start, 1, "watch")
            })
            .collect();
        for chunk in samples.chunks(200) {
            store.ingest(USER, chunk).await.unwrap();
        }

        let cfg = BackendConfig {
            batch_size: 25,
            ..BackendConfig::default()
        };
        let handles: Vec<_> = (0..4)
            .map(|id| {
                let worker = AggregationWorker::new(id, store.clone(), &cfg);
                tokio::spawn(async move { worker.run_pass().await })
            })
            .collect();

        let mut processed = 0;
        for handle in handles {
            let stats = handle.await.unwrap().unwrap();
            assert_eq!(stats.failed, 0);
            processed += stats.processed;
        }
        assert_eq!(processed, 600);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.get(&AggregationStatus::Aggregated), Some(&600));
        assert_eq!(counts.get(&AggregationStatus::Pending), None);
        assert_eq!(counts.get(&AggregationStatus::Processing), None);

        let hourly = store.list_aggregates(USER, Granularity::Hour, None).await.unwrap();
        assert_eq!(hourly.len(), 10);
        assert_eq!(hourly.iter().map(|a| a.count).sum::<u64>(), 600);
        let expected_total: f64 = samples.iter().map(|s| s.value).sum();
        assert_eq!(hourly.iter().map(|a| a.total).sum::<f64>(), expected_total);

        let daily = store.list_aggregates(USER, Granularity::Day, None).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 600);
    }

    #[tokio::test]
    async fn test_malformed_row_fails_after_max_attempts() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .ingest(
                USER,
                &[sample(MetricType::StepCount, 10.0, at(1, 9, 0), 5, "watch")],
            )
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO raw_samples
                 (user_id, metric_type, value, unit, start_ms, end_ms, source, ingested_at_ms)
             VALUES (?, 'not_a_metric', 1.0, 'u', ?, ?, 'watch', 0)",
        )
        .bind(USER)
        .bind(at(1, 9, 0).timestamp_millis())
        .bind(at(1, 9, 1).timestamp_millis())
        .execute(store.pool())
        .await
        .unwrap();

        let worker = AggregationWorker::new(0, store.clone(), &BackendConfig::default());

        let first = worker.run_pass().await.unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.released, 1);
        assert_eq!(first.failed, 0);

        let second = worker.run_pass().await.unwrap();
        assert_eq!(second.released, 1);

        let third = worker.run_pass().await.unwrap();
        assert_eq!(third.failed, 1);
        assert_eq!(third.released, 0);

        let fourth = worker.run_pass().await.unwrap();
        assert_eq!(fourth, PassStats::default());

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.get(&AggregationStatus::Failed), Some(&1));
        assert_eq!(counts.get(&AggregationStatus::Aggregated), Some(&1));
    }
}

mod dashboard_tests {
    use super::*;

    #[tokio::test]
    async fn test_dashboard_window_limits_buckets() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store.ingest(USER, &cascade_samples()).await.unwrap();
        AggregationWorker::new(0, store.clone(), &BackendConfig::default())
            .run_pass()
            .await
            .unwrap();

        let now = at(2, 11, 30);
        let view = store
            .dashboard(USER, &DashboardWindow::default(), now)
            .await
            .unwrap();
        assert_eq!(view.user_id, USER);
        assert_eq!(view.generated_at, now);
        // steps on both days plus the sleep hour
        assert_eq!(view.hourly.len(), 3);
        assert_eq!(view.daily.len(), 3);
        assert_eq!(view.weekly.len(), 2);
        assert_eq!(view.monthly.len(), 2);

        // Only the current hour and day
        let narrow = DashboardWindow {
            hours: 2,
            days: 1,
            weeks: 1,
            months: 0,
        };
        let view = store.dashboard(USER, &narrow, now).await.unwrap();
        assert_eq!(view.hourly.len(), 1);
        assert_eq!(view.hourly[0].key.bucket_start, at(2, 10, 0));
        assert_eq!(view.daily.len(), 1);
        assert_eq!(view.weekly.len(), 2);
        assert!(view.monthly.is_empty());
    }
}
