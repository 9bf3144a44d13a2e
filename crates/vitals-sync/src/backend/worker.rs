//! Aggregation workers draining the raw sample queue

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::store::{ClaimedRow, RawStore};
use crate::config::{BackendConfig, MAX_BATCH_SIZE};
use crate::error::{Result, VitalsError};
use crate::models::{AggregationStatus, RawSample};

/// Outcome of one pass over the pending queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    /// Rows aggregated
    pub processed: usize,
    /// Rows marked failed after exhausting their attempts
    pub failed: usize,
    /// Rows returned to pending for a later pass
    pub released: usize,
    /// Batch transactions attempted
    pub batches: usize,
}

impl std::fmt::Display for PassStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed: {}, Failed: {}, Batches: {}",
            self.processed, self.failed, self.batches
        )?;
        if self.released > 0 {
            write!(f, ", Released: {}", self.released)?;
        }
        Ok(())
    }
}

/// A single aggregation worker.
///
/// Any number of workers may share one store; rows are handed out by
/// exclusive claims, so each row is aggregated by exactly one of them.
pub struct AggregationWorker {
    id: usize,
    store: RawStore,
    batch_size: usize,
    max_attempts: u32,
    idle_interval: Duration,
    stale_claim_after: Duration,
}

impl AggregationWorker {
    pub fn new(id: usize, store: RawStore, cfg: &BackendConfig) -> Self {
        Self {
            id,
            store,
            batch_size: cfg.batch_size.clamp(1, MAX_BATCH_SIZE),
            max_attempts: cfg.max_attempts.max(1),
            idle_interval: cfg.idle_interval,
            stale_claim_after: cfg.stale_claim_after,
        }
    }

    /// Drain the pending queue once.
    ///
    /// Claims batches in id order until no pending row is left past the
    /// pass cursor. Rows released during the pass are picked up by the next
    /// pass rather than retried in a tight loop.
    pub async fn run_pass(&self) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let mut after_id = 0i64;

        loop {
            let token = Uuid::new_v4().to_string();
            let claimed = self.store.claim_batch(&token, self.batch_size, after_id).await?;
            let Some(last) = claimed.last() else {
                break;
            };
            after_id = last.id;

            let (rows, malformed) = split_claim(claimed);

            if !malformed.is_empty() {
                for row in &malformed {
                    if let Err(reason) = &row.sample {
                        tracing::warn!(worker = self.id, row_id = row.id, %reason, "malformed raw sample");
                    }
                }
                let counts = self
                    .store
                    .release_rows(&token, &malformed, self.max_attempts)
                    .await?;
                stats.failed += counts.failed as usize;
                stats.released += counts.pending as usize;
            }

            if rows.is_empty() {
                continue;
            }

            stats.batches += 1;
            match self.store.apply_batch(&token, &rows).await {
                Ok(count) => {
                    tracing::debug!(worker = self.id, rows = count, after_id, "aggregated batch");
                    stats.processed += count;
                }
                Err(e @ VitalsError::Database(_)) => {
                    // Not the rows' fault; they go back without spending an attempt
                    let requeued = self.store.requeue_claim(&token).await?;
                    tracing::warn!(
                        worker = self.id,
                        error = %e,
                        requeued,
                        "aggregation batch hit a database error"
                    );
                    stats.released += requeued as usize;
                }
                Err(e) => {
                    let counts = self.store.release_claim(&token, self.max_attempts).await?;
                    tracing::warn!(
                        worker = self.id,
                        error = %e,
                        released = counts.pending,
                        failed = counts.failed,
                        "aggregation batch rolled back"
                    );
                    stats.failed += counts.failed as usize;
                    stats.released += counts.pending as usize;
                }
            }
        }

        Ok(stats)
    }

    /// Run passes until `shutdown` flips to true, idling between them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(worker = self.id, batch_size = self.batch_size, "aggregation worker started");

        while !*shutdown.borrow() {
            if self.id == 0 {
                match self.store.recover_stale_claims(self.stale_claim_after).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        tracing::info!(worker = self.id, recovered, "returned stale claims to the queue");
                    }
                    Err(e) => {
                        tracing::warn!(worker = self.id, error = %e, "stale claim sweep failed");
                    }
                }
            }

            match self.run_pass().await {
                Ok(stats) if stats.batches > 0 || stats.failed > 0 => {
                    tracing::info!(worker = self.id, %stats, "aggregation pass complete");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(worker = self.id, error = %e, "aggregation pass failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.idle_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = self.id, "aggregation worker stopped");
        Ok(())
    }
}

/// Spawn the configured number of workers on one store
pub fn spawn_workers(
    store: &RawStore,
    cfg: &BackendConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<Result<()>>> {
    (0..cfg.workers.max(1))
        .map(|id| {
            let worker = AggregationWorker::new(id, store.clone(), cfg);
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

fn split_claim(claimed: Vec<ClaimedRow>) -> (Vec<RawSample>, Vec<ClaimedRow>) {
    let mut rows = Vec::with_capacity(claimed.len());
    let mut malformed = Vec::new();

    for row in claimed {
        match row.sample {
            Ok(sample) => rows.push(RawSample {
                id: row.id,
                user_id: row.user_id,
                sample,
                aggregation_status: AggregationStatus::Processing,
                aggregated_at: None,
                attempts: row.attempts,
            }),
            Err(_) => malformed.push(row),
        }
    }

    (rows, malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Granularity, MetricType, Sample};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    async fn store_with(temp: &TempDir, samples: &[Sample]) -> RawStore {
        let store = RawStore::open(&temp.path().join("backend.db"), &BackendConfig::default())
            .await
            .unwrap();
        store.ingest("u1", samples).await.unwrap();
        store
    }

    fn steps(n: u32) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let start = Utc.with_ymd_and_hms(2025, 4, 2, 9, 0, 0).unwrap()
                    + chrono::Duration::seconds(i as i64 * 30);
                Sample {
                    metric_type: MetricType::StepCount,
                    value: 10.0,
                    unit: "count".to_string(),
                    start_time: start,
                    end_time: start + chrono::Duration::seconds(30),
                    source: "phone".to_string(),
                    confidence: None,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_pass_drains_queue() {
        let temp = TempDir::new().unwrap();
        let store = store_with(&temp, &steps(120)).await;
        let cfg = BackendConfig {
            batch_size: 50,
            ..BackendConfig::default()
        };

        let worker = AggregationWorker::new(0, store.clone(), &cfg);
        let stats = worker.run_pass().await.unwrap();
        assert_eq!(stats.processed, 120);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.batches, 3);

        let hourly = store.list_aggregates("u1", Granularity::Hour, None).await.unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].count, 120);
        assert_eq!(hourly[0].total, 1200.0);

        let again = worker.run_pass().await.unwrap();
        assert_eq!(again, PassStats::default());
    }

    #[tokio::test]
    async fn test_batch_size_is_capped() {
        let temp = TempDir::new().unwrap();
        let store = store_with(&temp, &steps(450)).await;
        let cfg = BackendConfig {
            batch_size: 10_000,
            ..BackendConfig::default()
        };

        let stats = AggregationWorker::new(0, store, &cfg).run_pass().await.unwrap();
        assert_eq!(stats.processed, 450);
        assert_eq!(stats.batches, 3);
    }

    #[tokio::test]
    async fn test_database_errors_do_not_spend_attempts() {
        let temp = TempDir::new().unwrap();
        let store = store_with(&temp, &steps(10)).await;
        let worker = AggregationWorker::new(0, store.clone(), &BackendConfig::default());

        sqlx::query("DROP TABLE aggregates")
            .execute(store.pool())
            .await
            .unwrap();

        // Well past max_attempts; every batch fails on the missing table
        for _ in 0..5 {
            let stats = worker.run_pass().await.unwrap();
            assert_eq!(stats.processed, 0);
            assert_eq!(stats.failed, 0);
            assert_eq!(stats.released, 10);
        }

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts[&AggregationStatus::Pending], 10);
        assert!(!counts.contains_key(&AggregationStatus::Failed));

        let first = store.claim_batch("peek", 1, 0).await.unwrap();
        assert_eq!(first[0].attempts, 1);
        store.requeue_claim("peek").await.unwrap();

        // The table comes back and the same rows aggregate normally
        let store = RawStore::with_pool(store.pool().clone()).await.unwrap();
        let stats = AggregationWorker::new(0, store, &BackendConfig::default())
            .run_pass()
            .await
            .unwrap();
        assert_eq!(stats.processed, 10);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let store = store_with(&temp, &steps(5)).await;
        let (tx, rx) = watch::channel(false);

        let handles = spawn_workers(&store, &BackendConfig::default(), rx);
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}
