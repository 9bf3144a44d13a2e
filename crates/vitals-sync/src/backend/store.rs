//! Raw sample store and aggregate tables on a pooled SQLite database
//!
//! `raw_samples.aggregation_status` doubles as the aggregation work queue:
//! rows move pending -> processing (claimed) -> aggregated, or to failed once
//! their claim attempts run out.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::Row;

use crate::config::{BackendConfig, DashboardWindow};
use crate::error::{Result, VitalsError};
use crate::models::{
    Aggregate, AggregateKey, AggregationStatus, DashboardView, Granularity, IngestReceipt,
    MetricType, RawSample, Sample,
};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS raw_samples (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        metric_type TEXT NOT NULL,
        value REAL NOT NULL,
        unit TEXT NOT NULL,
        start_ms INTEGER NOT NULL,
        end_ms INTEGER NOT NULL,
        source TEXT NOT NULL,
        confidence REAL,
        aggregation_status TEXT NOT NULL DEFAULT 'pending',
        aggregated_at_ms INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        claim_token TEXT,
        claimed_at_ms INTEGER,
        ingested_at_ms INTEGER NOT NULL,
        UNIQUE (user_id, metric_type, start_ms, end_ms, source)
    )",
    "CREATE INDEX IF NOT EXISTS idx_raw_samples_queue
     ON raw_samples(aggregation_status, id)",
    "CREATE INDEX IF NOT EXISTS idx_raw_samples_bucket
     ON raw_samples(user_id, metric_type, start_ms)",
    "CREATE TABLE IF NOT EXISTS aggregates (
        user_id TEXT NOT NULL,
        metric_type TEXT NOT NULL,
        granularity TEXT NOT NULL,
        bucket_start_ms INTEGER NOT NULL,
        total REAL NOT NULL,
        average REAL NOT NULL,
        min REAL NOT NULL,
        max REAL NOT NULL,
        count INTEGER NOT NULL,
        duration_minutes REAL,
        primary_source TEXT,
        sources_included TEXT NOT NULL,
        source_counts TEXT NOT NULL,
        PRIMARY KEY (user_id, metric_type, granularity, bucket_start_ms)
    )",
    "CREATE INDEX IF NOT EXISTS idx_aggregates_view
     ON aggregates(user_id, granularity, bucket_start_ms)",
];

const SAMPLE_COLUMNS: &str =
    "id, user_id, metric_type, value, unit, start_ms, end_ms, source, confidence, attempts";

/// A row handed to a worker by a claim.
///
/// Rows whose stored fields no longer decode into a valid sample keep the
/// reason so the worker can release them without aborting the batch.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    pub id: i64,
    pub user_id: String,
    pub attempts: u32,
    pub sample: std::result::Result<Sample, String>,
}

/// Outcome of returning claimed rows to the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseCounts {
    pub pending: u64,
    pub failed: u64,
}

/// Backend store for raw samples and their aggregates
#[derive(Clone)]
pub struct RawStore {
    pool: SqlitePool,
}

impl RawStore {
    /// Open the database at `path` with a pool sized from `cfg`.
    ///
    /// The pool keeps `pool_size` connections and may grow by `max_overflow`;
    /// API handlers and aggregation workers share it.
    pub async fn open(path: &Path, cfg: &BackendConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::config::ensure_dir(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .min_connections(cfg.pool_size)
            .max_connections(cfg.pool_size + cfg.max_overflow)
            .acquire_timeout(cfg.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| VitalsError::database("Failed to open backend database", e))?;

        tracing::info!(
            path = %path.display(),
            pool_size = cfg.pool_size,
            max_overflow = cfg.max_overflow,
            "opened backend store"
        );

        Self::with_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| VitalsError::database("Failed to run migrations", e))?;
        }

        // Databases created before claims were timestamped
        let has_claimed_at: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('raw_samples') WHERE name = 'claimed_at_ms'",
        )
        .fetch_one(&self.pool)
        .await?;
        if has_claimed_at == 0 {
            sqlx::query("ALTER TABLE raw_samples ADD COLUMN claimed_at_ms INTEGER")
                .execute(&self.pool)
                .await
                .map_err(|e| VitalsError::database("Failed to run migrations", e))?;
        }
        Ok(())
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Persist a chunk of samples for a user.
    ///
    /// Samples are keyed by (user, metric, start, end, source); a sample that
    /// is already stored is left untouched, so re-submitting a chunk is a no-op.
    pub async fn ingest(&self, user_id: &str, samples: &[Sample]) -> Result<IngestReceipt> {
        if user_id.is_empty() {
            return Err(VitalsError::invalid_sample("user_id is required"));
        }
        for sample in samples {
            sample.validate()?;
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut inserted = 0usize;
        let mut tx = self.pool.begin().await?;

        for sample in samples {
            let result = sqlx::query(
                "INSERT INTO raw_samples
                     (user_id, metric_type, value, unit, start_ms, end_ms, source, confidence, ingested_at_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (user_id, metric_type, start_ms, end_ms, source) DO NOTHING",
            )
            .bind(user_id)
            .bind(sample.metric_type.as_str())
            .bind(sample.value)
            .bind(&sample.unit)
            .bind(sample.start_time.timestamp_millis())
            .bind(sample.end_time.timestamp_millis())
            .bind(&sample.source)
            .bind(sample.confidence)
            .bind(now_ms)
            .execute(&mut *tx)
            .await
            .map_err(|e| VitalsError::database("Failed to insert sample", e))?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;

        Ok(IngestReceipt {
            accepted: samples.len(),
            inserted,
            latest: samples.iter().map(|s| s.end_time).max(),
        })
    }

    /// Latest persisted sample end time per metric for a user
    pub async fn latest_timestamps(&self, user_id: &str) -> Result<HashMap<MetricType, DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT metric_type, MAX(end_ms) AS latest
             FROM raw_samples
             WHERE user_id = ?
             GROUP BY metric_type",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut latest = HashMap::new();
        for row in rows {
            let metric: String = row.try_get("metric_type")?;
            let Ok(metric) = metric.parse::<MetricType>() else {
                tracing::warn!(%metric, "skipping unknown metric in sync status");
                continue;
            };
            latest.insert(metric, from_ms(row.try_get("latest")?)?);
        }
        Ok(latest)
    }

    /// Fetch one raw row by id
    pub async fn raw_sample(&self, id: i64) -> Result<Option<RawSample>> {
        let row = sqlx::query(&format!(
            "SELECT {}, aggregation_status, aggregated_at_ms FROM raw_samples WHERE id = ?",
            SAMPLE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let claimed = row_to_claimed(&row)?;
        let sample = claimed.sample.map_err(VitalsError::InvalidSample)?;
        let status: String = row.try_get("aggregation_status")?;
        let aggregated_at: Option<i64> = row.try_get("aggregated_at_ms")?;

        Ok(Some(RawSample {
            id: claimed.id,
            user_id: claimed.user_id,
            sample,
            aggregation_status: AggregationStatus::parse(&status)?,
            aggregated_at: aggregated_at.map(from_ms).transpose()?,
            attempts: claimed.attempts,
        }))
    }

    /// Row counts per aggregation status
    pub async fn status_counts(&self) -> Result<HashMap<AggregationStatus, u64>> {
        let rows = sqlx::query(
            "SELECT aggregation_status, COUNT(*) AS n FROM raw_samples GROUP BY aggregation_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("aggregation_status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(AggregationStatus::parse(&status)?, n as u64);
        }
        Ok(counts)
    }

    // =========================================================================
    // Work queue
    // =========================================================================

    /// Claim up to `limit` pending rows with id greater than `after_id`.
    ///
    /// The claim is a single conditional UPDATE, so when several workers race
    /// for the same rows each row goes to exactly one claimant.
    pub async fn claim_batch(&self, token: &str, limit: usize, after_id: i64) -> Result<Vec<ClaimedRow>> {
        let rows = sqlx::query(&format!(
            "UPDATE raw_samples
             SET aggregation_status = 'processing', claim_token = ?1, claimed_at_ms = ?4,
                 attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM raw_samples
                 WHERE aggregation_status = 'pending' AND id > ?2
                 ORDER BY id
                 LIMIT ?3
             )
             AND aggregation_status = 'pending'
             RETURNING {}",
            SAMPLE_COLUMNS
        ))
        .bind(token)
        .bind(after_id)
        .bind(limit as i64)
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VitalsError::database("Failed to claim batch", e))?;

        let mut claimed = rows.iter().map(row_to_claimed).collect::<Result<Vec<_>>>()?;
        claimed.sort_by_key(|row| row.id);
        Ok(claimed)
    }

    /// Return specific claimed rows to the queue, failing those out of attempts
    pub async fn release_rows(&self, token: &str, rows: &[ClaimedRow], max_attempts: u32) -> Result<ReleaseCounts> {
        let mut counts = ReleaseCounts::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let status = if row.attempts >= max_attempts {
                AggregationStatus::Failed
            } else {
                AggregationStatus::Pending
            };
            let result = sqlx::query(
                "UPDATE raw_samples SET aggregation_status = ?, claim_token = NULL
                 WHERE id = ? AND claim_token = ?",
            )
            .bind(status.as_str())
            .bind(row.id)
            .bind(token)
            .execute(&mut *tx)
            .await?;

            match status {
                AggregationStatus::Failed => counts.failed += result.rows_affected(),
                _ => counts.pending += result.rows_affected(),
            }
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Return every row still held by `token` to the queue.
    ///
    /// Rows that have used up `max_attempts` claims are marked failed.
    pub async fn release_claim(&self, token: &str, max_attempts: u32) -> Result<ReleaseCounts> {
        let failed = sqlx::query(
            "UPDATE raw_samples SET aggregation_status = 'failed', claim_token = NULL
             WHERE claim_token = ? AND aggregation_status = 'processing' AND attempts >= ?",
        )
        .bind(token)
        .bind(max_attempts as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let pending = sqlx::query(
            "UPDATE raw_samples SET aggregation_status = 'pending', claim_token = NULL
             WHERE claim_token = ? AND aggregation_status = 'processing'",
        )
        .bind(token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(ReleaseCounts { pending, failed })
    }

    /// Return every row held by `token` to pending without charging the claim.
    ///
    /// For batches that failed on the database rather than on their rows.
    pub async fn requeue_claim(&self, token: &str) -> Result<u64> {
        let requeued = sqlx::query(
            "UPDATE raw_samples
             SET aggregation_status = 'pending', claim_token = NULL, attempts = MAX(attempts - 1, 0)
             WHERE claim_token = ? AND aggregation_status = 'processing'",
        )
        .bind(token)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(requeued)
    }

    /// Return rows claimed at least `older_than` ago to pending.
    ///
    /// Live workers finish a batch well within the threshold, so only claims
    /// abandoned by a crashed worker are taken back.
    pub async fn recover_stale_claims(&self, older_than: Duration) -> Result<u64> {
        let cutoff_ms = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let recovered = sqlx::query(
            "UPDATE raw_samples SET aggregation_status = 'pending', claim_token = NULL
             WHERE aggregation_status = 'processing'
               AND (claimed_at_ms IS NULL OR claimed_at_ms <= ?)",
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(recovered)
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Aggregate a claimed batch in a single transaction.
    ///
    /// Marks the rows aggregated, recomputes every hourly bucket they touch
    /// from all aggregated rows in that hour, then re-derives the daily,
    /// weekly and monthly parents from their hourly buckets. Dropping the
    /// transaction on error rolls all of it back.
    pub async fn apply_batch(&self, token: &str, rows: &[RawSample]) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock before reading
        let marked = sqlx::query(
            "UPDATE raw_samples
             SET aggregation_status = 'aggregated', aggregated_at_ms = ?, claim_token = NULL
             WHERE claim_token = ? AND aggregation_status = 'processing'",
        )
        .bind(now_ms)
        .bind(token)
        .execute(&mut *tx)
        .await?
        .rows_affected() as usize;

        if marked != rows.len() {
            return Err(VitalsError::Aggregation(format!(
                "claim {} holds {} rows, expected {}",
                token,
                marked,
                rows.len()
            )));
        }

        let hourly: BTreeSet<AggregateKey> = rows
            .iter()
            .map(|r| {
                AggregateKey::containing(
                    &r.user_id,
                    r.sample.metric_type,
                    Granularity::Hour,
                    r.sample.start_time,
                )
            })
            .collect();

        if let Err(e) = refresh_buckets(&mut tx, &hourly).await {
            tx.rollback().await?;
            return Err(e);
        }

        tx.commit().await?;
        Ok(marked)
    }

    /// Drop and recompute every aggregate for a user from aggregated rows
    pub async fn rebuild_aggregates(&self, user_id: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM aggregates WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            "SELECT DISTINCT metric_type, start_ms FROM raw_samples
             WHERE user_id = ? AND aggregation_status = 'aggregated'",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut hourly = BTreeSet::new();
        for row in rows {
            let metric: String = row.try_get("metric_type")?;
            let Ok(metric) = metric.parse::<MetricType>() else {
                continue;
            };
            let start = from_ms(row.try_get("start_ms")?)?;
            hourly.insert(AggregateKey::containing(user_id, metric, Granularity::Hour, start));
        }

        let written = refresh_buckets(&mut tx, &hourly).await?;
        tx.commit().await?;

        tracing::info!(user_id, buckets = written, "rebuilt aggregates");
        Ok(written)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Aggregates for a user at one granularity, oldest bucket first
    pub async fn list_aggregates(
        &self,
        user_id: &str,
        granularity: Granularity,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Aggregate>> {
        let since_ms = since.map(|s| s.timestamp_millis()).unwrap_or(i64::MIN);
        let rows = sqlx::query(
            "SELECT * FROM aggregates
             WHERE user_id = ? AND granularity = ? AND bucket_start_ms >= ?
             ORDER BY bucket_start_ms, metric_type",
        )
        .bind(user_id)
        .bind(granularity.as_str())
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_aggregate).collect()
    }

    /// Recent buckets at all four granularities
    pub async fn dashboard(
        &self,
        user_id: &str,
        window: &DashboardWindow,
        now: DateTime<Utc>,
    ) -> Result<DashboardView> {
        let mut view = DashboardView::empty(user_id);
        view.generated_at = now;

        for (granularity, buckets) in [
            (Granularity::Hour, window.hours),
            (Granularity::Day, window.days),
            (Granularity::Week, window.weeks),
            (Granularity::Month, window.months),
        ] {
            if buckets == 0 {
                continue;
            }
            let since = window_start(granularity, now, buckets);
            let aggregates = self.list_aggregates(user_id, granularity, Some(since)).await?;
            match granularity {
                Granularity::Hour => view.hourly = aggregates,
                Granularity::Day => view.daily = aggregates,
                Granularity::Week => view.weekly = aggregates,
                Granularity::Month => view.monthly = aggregates,
            }
        }

        Ok(view)
    }
}

/// Start of the oldest of the `buckets` most recent buckets ending at `now`
fn window_start(granularity: Granularity, now: DateTime<Utc>, buckets: u32) -> DateTime<Utc> {
    let mut start = granularity.bucket_start(now);
    for _ in 1..buckets {
        start = granularity.bucket_start(start - chrono::Duration::milliseconds(1));
    }
    start
}

/// Recompute the given hourly buckets and cascade into their parents
async fn refresh_buckets(conn: &mut SqliteConnection, hourly: &BTreeSet<AggregateKey>) -> Result<usize> {
    for key in hourly {
        recompute_hourly(conn, key).await?;
    }

    let parents: BTreeSet<AggregateKey> = hourly
        .iter()
        .flat_map(|key| Granularity::PARENTS.iter().map(move |g| key.parent(*g)))
        .collect();

    for key in &parents {
        recompute_parent(conn, key).await?;
    }

    Ok(hourly.len() + parents.len())
}

async fn recompute_hourly(conn: &mut SqliteConnection, key: &AggregateKey) -> Result<()> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM raw_samples
         WHERE user_id = ? AND metric_type = ? AND aggregation_status = 'aggregated'
           AND start_ms >= ? AND start_ms < ?
         ORDER BY id",
        SAMPLE_COLUMNS
    ))
    .bind(&key.user_id)
    .bind(key.metric_type.as_str())
    .bind(key.bucket_start.timestamp_millis())
    .bind(key.bucket_end().timestamp_millis())
    .fetch_all(&mut *conn)
    .await?;

    let mut samples = Vec::with_capacity(rows.len());
    for row in &rows {
        let claimed = row_to_claimed(row)?;
        match claimed.sample {
            Ok(sample) => samples.push(sample),
            Err(reason) => {
                return Err(VitalsError::Aggregation(format!(
                    "aggregated row {} is malformed: {}",
                    claimed.id, reason
                )))
            }
        }
    }

    match Aggregate::from_samples(key.clone(), &samples) {
        Some(aggregate) => upsert_aggregate(conn, &aggregate).await,
        None => delete_aggregate(conn, key).await,
    }
}

async fn recompute_parent(conn: &mut SqliteConnection, key: &AggregateKey) -> Result<()> {
    let rows = sqlx::query(
        "SELECT * FROM aggregates
         WHERE user_id = ? AND metric_type = ? AND granularity = 'hour'
           AND bucket_start_ms >= ? AND bucket_start_ms < ?
         ORDER BY bucket_start_ms",
    )
    .bind(&key.user_id)
    .bind(key.metric_type.as_str())
    .bind(key.bucket_start.timestamp_millis())
    .bind(key.bucket_end().timestamp_millis())
    .fetch_all(&mut *conn)
    .await?;

    let children = rows.iter().map(row_to_aggregate).collect::<Result<Vec<_>>>()?;

    match Aggregate::derive(key.clone(), &children) {
        Some(aggregate) => upsert_aggregate(conn, &aggregate).await,
        None => delete_aggregate(conn, key).await,
    }
}

async fn upsert_aggregate(conn: &mut SqliteConnection, agg: &Aggregate) -> Result<()> {
    let sources_included = serde_json::to_string(&agg.sources_included)?;
    let source_counts = serde_json::to_string(&agg.source_counts)?;

    sqlx::query(
        "INSERT INTO aggregates
             (user_id, metric_type, granularity, bucket_start_ms, total, average, min, max,
              count, duration_minutes, primary_source, sources_included, source_counts)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (user_id, metric_type, granularity, bucket_start_ms) DO UPDATE SET
             total = excluded.total,
             average = excluded.average,
             min = excluded.min,
             max = excluded.max,
             count = excluded.count,
             duration_minutes = excluded.duration_minutes,
             primary_source = excluded.primary_source,
             sources_included = excluded.sources_included,
             source_counts = excluded.source_counts",
    )
    .bind(&agg.key.user_id)
    .bind(agg.key.metric_type.as_str())
    .bind(agg.key.granularity.as_str())
    .bind(agg.key.bucket_start.timestamp_millis())
    .bind(agg.total)
    .bind(agg.average)
    .bind(agg.min)
    .bind(agg.max)
    .bind(agg.count as i64)
    .bind(agg.duration_minutes)
    .bind(&agg.primary_source)
    .bind(sources_included)
    .bind(source_counts)
    .execute(&mut *conn)
    .await
    .map_err(|e| VitalsError::database("Failed to upsert aggregate", e))?;

    Ok(())
}

async fn delete_aggregate(conn: &mut SqliteConnection, key: &AggregateKey) -> Result<()> {
    sqlx::query(
        "DELETE FROM aggregates
         WHERE user_id = ? AND metric_type = ? AND granularity = ? AND bucket_start_ms = ?",
    )
    .bind(&key.user_id)
    .bind(key.metric_type.as_str())
    .bind(key.granularity.as_str())
    .bind(key.bucket_start.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| VitalsError::Database(format!("timestamp {} out of range", ms)))
}

fn row_to_claimed(row: &SqliteRow) -> Result<ClaimedRow> {
    let id: i64 = row.try_get("id")?;
    let user_id: String = row.try_get("user_id")?;
    let attempts: i64 = row.try_get("attempts")?;

    let metric: String = row.try_get("metric_type")?;
    let value: f64 = row.try_get("value")?;
    let unit: String = row.try_get("unit")?;
    let start_ms: i64 = row.try_get("start_ms")?;
    let end_ms: i64 = row.try_get("end_ms")?;
    let source: String = row.try_get("source")?;
    let confidence: Option<f64> = row.try_get("confidence")?;

    let sample = (|| {
        let sample = Sample {
            metric_type: metric.parse::<MetricType>()?,
            value,
            unit,
            start_time: from_ms(start_ms)?,
            end_time: from_ms(end_ms)?,
            source,
            confidence,
        };
        sample.validate()?;
        Ok::<_, VitalsError>(sample)
    })()
    .map_err(|e| e.to_string());

    Ok(ClaimedRow {
        id,
        user_id,
        attempts: attempts.max(0) as u32,
        sample,
    })
}

fn row_to_aggregate(row: &SqliteRow) -> Result<Aggregate> {
    let metric: String = row.try_get("metric_type")?;
    let granularity: String = row.try_get("granularity")?;
    let count: i64 = row.try_get("count")?;
    let sources_included: String = row.try_get("sources_included")?;
    let source_counts: String = row.try_get("source_counts")?;

    Ok(Aggregate {
        key: AggregateKey {
            user_id: row.try_get("user_id")?,
            metric_type: metric.parse()?,
            granularity: Granularity::parse(&granularity)?,
            bucket_start: from_ms(row.try_get("bucket_start_ms")?)?,
        },
        total: row.try_get("total")?,
        average: row.try_get("average")?,
        min: row.try_get("min")?,
        max: row.try_get("max")?,
        count: count.max(0) as u64,
        duration_minutes: row.try_get("duration_minutes")?,
        primary_source: row.try_get("primary_source")?,
        sources_included: serde_json::from_str(&sources_included)?,
        source_counts: serde_json::from_str(&source_counts)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn open_store(temp: &TempDir) -> RawStore {
        let cfg = BackendConfig {
            pool_size: 1,
            max_overflow: 3,
            ..BackendConfig::default()
        };
        RawStore::open(&temp.path().join("backend.db"), &cfg).await.unwrap()
    }

    fn sample(metric: MetricType, value: f64, minute: u32, source: &str) -> Sample {
        let start = Utc.with_ymd_and_hms(2025, 1, 16, 8, minute, 0).unwrap();
        Sample {
            metric_type: metric,
            value,
            unit: "u".to_string(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(1),
            source: source.to_string(),
            confidence: None,
        }
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let batch = vec![
            sample(MetricType::HeartRate, 60.0, 0, "watch"),
            sample(MetricType::HeartRate, 62.0, 1, "watch"),
        ];

        let first = store.ingest("u1", &batch).await.unwrap();
        assert_eq!(first.accepted, 2);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.latest, Some(batch[1].end_time));

        let second = store.ingest("u1", &batch).await.unwrap();
        assert_eq!(second.accepted, 2);
        assert_eq!(second.inserted, 0);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts[&AggregationStatus::Pending], 2);
    }

    #[tokio::test]
    async fn test_same_window_from_other_source_is_a_new_row() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        store.ingest("u1", &[sample(MetricType::StepCount, 10.0, 0, "watch")]).await.unwrap();
        let receipt = store
            .ingest("u1", &[sample(MetricType::StepCount, 10.0, 0, "phone")])
            .await
            .unwrap();
        assert_eq!(receipt.inserted, 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_invalid_samples() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let bad = sample(MetricType::HeartRate, f64::NAN, 0, "watch");
        let err = store.ingest("u1", &[bad]).await.unwrap_err();
        assert!(matches!(err, VitalsError::InvalidSample(_)));
        assert!(store.status_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_timestamps_per_metric() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let batch = vec![
            sample(MetricType::HeartRate, 60.0, 0, "watch"),
            sample(MetricType::HeartRate, 61.0, 30, "watch"),
            sample(MetricType::StepCount, 100.0, 10, "watch"),
        ];
        store.ingest("u1", &batch).await.unwrap();

        let latest = store.latest_timestamps("u1").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&MetricType::HeartRate], batch[1].end_time);
        assert_eq!(latest[&MetricType::StepCount], batch[2].end_time);
        assert!(store.latest_timestamps("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_cursor() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;

        let batch: Vec<Sample> = (0..10)
            .map(|m| sample(MetricType::HeartRate, 60.0 + m as f64, m, "watch"))
            .collect();
        store.ingest("u1", &batch).await.unwrap();

        let first = store.claim_batch("a", 4, 0).await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|r| r.attempts == 1 && r.sample.is_ok()));

        let last_id = first.last().unwrap().id;
        let second = store.claim_batch("b", 100, last_id).await.unwrap();
        assert_eq!(second.len(), 6);
        assert!(second.iter().all(|r| r.id > last_id));

        assert!(store.claim_batch("c", 100, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_claim_fails_rows_out_of_attempts() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .ingest("u1", &[sample(MetricType::HeartRate, 60.0, 0, "watch")])
            .await
            .unwrap();

        for attempt in 1..=3u32 {
            let claimed = store.claim_batch("w", 10, 0).await.unwrap();
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].attempts, attempt);
            let released = store.release_claim("w", 3).await.unwrap();
            if attempt < 3 {
                assert_eq!(released, ReleaseCounts { pending: 1, failed: 0 });
            } else {
                assert_eq!(released, ReleaseCounts { pending: 0, failed: 1 });
            }
        }

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts[&AggregationStatus::Failed], 1);
        assert!(store.claim_batch("w", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_stale_claims() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .ingest("u1", &[sample(MetricType::HeartRate, 60.0, 0, "watch")])
            .await
            .unwrap();

        store.claim_batch("crashed", 10, 0).await.unwrap();
        assert_eq!(store.recover_stale_claims(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.claim_batch("next", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_claims_survive_recovery() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .ingest("u1", &[sample(MetricType::HeartRate, 60.0, 0, "watch")])
            .await
            .unwrap();

        let claimed = store.claim_batch("live", 10, 0).await.unwrap();
        assert_eq!(store.recover_stale_claims(Duration::from_secs(600)).await.unwrap(), 0);

        let row = store.raw_sample(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(row.aggregation_status, AggregationStatus::Processing);
        assert_eq!(store.release_claim("live", 3).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_requeue_refunds_the_claim() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .ingest("u1", &[sample(MetricType::HeartRate, 60.0, 0, "watch")])
            .await
            .unwrap();

        for _ in 0..4 {
            let claimed = store.claim_batch("w", 10, 0).await.unwrap();
            assert_eq!(claimed[0].attempts, 1);
            assert_eq!(store.requeue_claim("w").await.unwrap(), 1);
        }
        assert_eq!(store.requeue_claim("w").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_batch_rejects_lost_claim() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp).await;
        store
            .ingest("u1", &[sample(MetricType::HeartRate, 60.0, 0, "watch")])
            .await
            .unwrap();

        let claimed = store.claim_batch("w", 10, 0).await.unwrap();
        let rows: Vec<RawSample> = claimed
            .iter()
            .map(|c| RawSample {
                id: c.id,
                user_id: c.user_id.clone(),
                sample: c.sample.clone().unwrap(),
                aggregation_status: AggregationStatus::Processing,
                aggregated_at: None,
                attempts: c.attempts,
            })
            .collect();

        store.recover_stale_claims(Duration::ZERO).await.unwrap();
        let err = store.apply_batch("w", &rows).await.unwrap_err();
        assert!(matches!(err, VitalsError::Aggregation(_)));

        let row = store.raw_sample(rows[0].id).await.unwrap().unwrap();
        assert_eq!(row.aggregation_status, AggregationStatus::Pending);
        assert!(store.list_aggregates("u1", Granularity::Hour, None).await.unwrap().is_empty());
    }

    #[test]
    fn test_window_start() {
        let now = Utc.with_ymd_and_hms(2025, 3, 12, 15, 20, 0).unwrap();
        assert_eq!(
            window_start(Granularity::Hour, now, 3),
            Utc.with_ymd_and_hms(2025, 3, 12, 13, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(Granularity::Month, now, 3),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            window_start(Granularity::Week, now, 1),
            Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap()
        );
    }
}
