//! Chunked sample upload with per-metric sync cursors

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::client::IngestApi;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::models::{MetricType, Sample, SyncStatus};
use crate::storage::SharedSyncDb;

/// Result of a completed upload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    /// Samples accepted by the backend
    pub submitted: usize,
    /// Samples that were new to the backend
    pub inserted: usize,
    /// Requests sent, including in-call retries
    pub requests: usize,
    /// Status rows after the upload, one per metric uploaded
    pub statuses: Vec<SyncStatus>,
}

/// Uploads samples in bounded chunks and keeps the sync cursors honest.
///
/// A metric's cursor only moves to the latest `end_time` of a chunk the
/// backend acknowledged. A chunk that fails stops the upload; everything
/// before it stays persisted and counted.
pub struct SyncTransport {
    api: Arc<dyn IngestApi>,
    db: SharedSyncDb,
    user_id: String,
    source: String,
    chunk_size: usize,
    chunk_attempts: u32,
    /// Metrics whose status rows uploads wrote since the last recorded attempt
    written: Mutex<BTreeSet<MetricType>>,
}

impl SyncTransport {
    pub fn new(api: Arc<dyn IngestApi>, db: SharedSyncDb, cfg: &ClientConfig) -> Self {
        Self {
            api,
            db,
            user_id: cfg.user_id.clone(),
            source: cfg.source.clone(),
            chunk_size: cfg.chunk_size.max(1),
            chunk_attempts: cfg.chunk_attempts.max(1),
            written: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn db(&self) -> &SharedSyncDb {
        &self.db
    }

    /// Upload `samples`, advancing each metric's cursor as chunks land.
    pub async fn upload(&self, mut samples: Vec<Sample>) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        if samples.is_empty() {
            return Ok(report);
        }

        samples.sort_by_key(|s| (s.metric_type, s.end_time, s.start_time));

        let mut statuses: BTreeMap<MetricType, SyncStatus> = BTreeMap::new();
        for sample in &samples {
            if !statuses.contains_key(&sample.metric_type) {
                let status = self
                    .db
                    .get_status(&self.user_id, &self.source, sample.metric_type)
                    .await?
                    .unwrap_or_else(|| SyncStatus::new(&self.user_id, &self.source, sample.metric_type));
                statuses.insert(sample.metric_type, status);
            }
        }

        let total_chunks = samples.len().div_ceil(self.chunk_size);
        for (index, chunk) in samples.chunks(self.chunk_size).enumerate() {
            match self.send_chunk(chunk, &mut report).await {
                Ok(()) => {
                    // A chunk boundary may split samples sharing an end time;
                    // the cursor stays short of that end time until all are sent
                    let held = samples
                        .get(index * self.chunk_size + chunk.len())
                        .map(|next| (next.metric_type, next.end_time));
                    for sample in chunk {
                        if held == Some((sample.metric_type, sample.end_time)) {
                            continue;
                        }
                        if let Some(status) = statuses.get_mut(&sample.metric_type) {
                            status.advance(sample.end_time);
                        }
                    }
                    self.persist(&mut statuses, chunk, None).await?;
                    tracing::debug!(chunk = index + 1, total_chunks, samples = chunk.len(), "chunk uploaded");
                }
                Err(e) => {
                    tracing::warn!(
                        chunk = index + 1,
                        total_chunks,
                        error = %e,
                        "chunk upload failed"
                    );
                    let message = e.to_string();
                    let remaining: Vec<Sample> = samples[index * self.chunk_size..].to_vec();
                    self.persist(&mut statuses, &remaining, Some(&message)).await?;
                    return Err(e);
                }
            }
        }

        report.statuses = statuses.into_values().collect();
        Ok(report)
    }

    /// Record the outcome of a whole sync attempt for every metric in `metrics`.
    ///
    /// Rows written by uploads during the attempt keep their own outcome.
    /// Cursors never move here.
    pub async fn record_attempt(&self, metrics: &[MetricType], error: Option<&str>) -> Result<()> {
        let written = std::mem::take(&mut *self.written.lock().await);
        let now = Utc::now();
        for metric in metrics.iter().filter(|m| !written.contains(*m)) {
            let mut status = self
                .db
                .get_status(&self.user_id, &self.source, *metric)
                .await?
                .unwrap_or_else(|| SyncStatus::new(&self.user_id, &self.source, *metric));
            status.success = error.is_none();
            status.error_message = error.map(str::to_string);
            status.updated_at = now;
            self.db.upsert_status(&status).await?;
        }
        Ok(())
    }

    /// Send one chunk, retrying network failures in place
    async fn send_chunk(&self, chunk: &[Sample], report: &mut UploadReport) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            report.requests += 1;
            match self.api.ingest(&self.user_id, chunk).await {
                Ok(receipt) => {
                    report.submitted += receipt.accepted;
                    report.inserted += receipt.inserted;
                    return Ok(());
                }
                Err(e) if e.is_network() && attempt < self.chunk_attempts => {
                    tracing::debug!(attempt, error = %e, "retrying chunk");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the status rows of every metric present in `samples`
    async fn persist(
        &self,
        statuses: &mut BTreeMap<MetricType, SyncStatus>,
        samples: &[Sample],
        error: Option<&str>,
    ) -> Result<()> {
        let mut touched: Vec<MetricType> = samples.iter().map(|s| s.metric_type).collect();
        touched.dedup();

        let now = Utc::now();
        for metric in touched {
            if let Some(status) = statuses.get_mut(&metric) {
                status.success = error.is_none();
                status.error_message = error.map(str::to_string);
                status.updated_at = now;
                self.db.upsert_status(status).await?;
                self.written.lock().await.insert(metric);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VitalsError;
    use crate::models::{DashboardView, IngestReceipt};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Accepts the first `ok_calls` requests, then fails with `error`
    struct FlakyApi {
        ok_calls: usize,
        calls: Mutex<usize>,
        network: bool,
    }

    #[async_trait]
    impl IngestApi for FlakyApi {
        async fn ingest(&self, _user_id: &str, samples: &[Sample]) -> Result<IngestReceipt> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls > self.ok_calls {
                return Err(if self.network {
                    VitalsError::Network("unreachable".to_string())
                } else {
                    VitalsError::Api {
                        status: 500,
                        message: "boom".to_string(),
                    }
                });
            }
            Ok(IngestReceipt {
                accepted: samples.len(),
                inserted: samples.len(),
                latest: samples.iter().map(|s| s.end_time).max(),
            })
        }

        async fn sync_status(&self, _user_id: &str) -> Result<HashMap<MetricType, DateTime<Utc>>> {
            Ok(HashMap::new())
        }

        async fn dashboard(&self, user_id: &str) -> Result<DashboardView> {
            Ok(DashboardView::empty(user_id))
        }
    }

    fn minute(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, m, 0).unwrap()
    }

    fn samples(metric: MetricType, n: u32) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample {
                metric_type: metric,
                value: i as f64,
                unit: "count".to_string(),
                start_time: minute(i),
                end_time: minute(i + 1),
                source: "watch".to_string(),
                confidence: None,
            })
            .collect()
    }

    fn transport(api: FlakyApi, chunk_size: usize) -> SyncTransport {
        let cfg = ClientConfig {
            user_id: "u1".to_string(),
            source: "watch".to_string(),
            chunk_size,
            chunk_attempts: 2,
            ..ClientConfig::default()
        };
        SyncTransport::new(Arc::new(api), SharedSyncDb::open_in_memory().unwrap(), &cfg)
    }

    #[tokio::test]
    async fn test_cursor_stops_at_last_persisted_sample() {
        let api = FlakyApi {
            ok_calls: 1,
            calls: Mutex::new(0),
            network: false,
        };
        let transport = transport(api, 7);

        let err = transport.upload(samples(MetricType::StepCount, 10)).await.unwrap_err();
        assert!(matches!(err, VitalsError::Api { status: 500, .. }));

        let status = transport
            .db()
            .get_status("u1", "watch", MetricType::StepCount)
            .await
            .unwrap()
            .unwrap();
        // 7th sample ends at minute 7
        assert_eq!(status.last_sync_date, Some(minute(7)));
        assert!(!status.success);
        assert!(status.error_message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_network_failure_retries_chunk_in_place() {
        let api = FlakyApi {
            ok_calls: 1,
            calls: Mutex::new(0),
            network: true,
        };
        let transport = transport(api, 5);

        let err = transport.upload(samples(MetricType::HeartRate, 10)).await.unwrap_err();
        assert!(err.is_network());

        let status = transport
            .db()
            .get_status("u1", "watch", MetricType::HeartRate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.last_sync_date, Some(minute(5)));
    }

    #[tokio::test]
    async fn test_successful_upload_marks_every_metric() {
        let api = FlakyApi {
            ok_calls: usize::MAX,
            calls: Mutex::new(0),
            network: false,
        };
        let transport = transport(api, 4);

        let mut batch = samples(MetricType::HeartRate, 3);
        batch.extend(samples(MetricType::StepCount, 6));
        let report = transport.upload(batch).await.unwrap();

        assert_eq!(report.submitted, 9);
        assert_eq!(report.requests, 3);
        assert_eq!(report.statuses.len(), 2);
        assert!(report.statuses.iter().all(|s| s.success));

        let cursors = transport.db().cursors("u1", "watch").await.unwrap();
        assert_eq!(cursors[&MetricType::HeartRate], minute(3));
        assert_eq!(cursors[&MetricType::StepCount], minute(6));
    }

    #[tokio::test]
    async fn test_cursor_holds_before_split_end_time() {
        let api = FlakyApi {
            ok_calls: 1,
            calls: Mutex::new(0),
            network: false,
        };
        let transport = transport(api, 2);

        // Two sources report the same window; the chunk boundary falls between them
        let heart = samples(MetricType::HeartRate, 5);
        let mut phone = heart[4].clone();
        phone.source = "phone".to_string();
        let batch = vec![heart[0].clone(), heart[4].clone(), phone];

        let err = transport.upload(batch).await.unwrap_err();
        assert!(matches!(err, VitalsError::Api { status: 500, .. }));

        let status = transport
            .db()
            .get_status("u1", "watch", MetricType::HeartRate)
            .await
            .unwrap()
            .unwrap();
        // minute 5 went out for "watch" only, so the cursor stays at minute 1
        assert_eq!(status.last_sync_date, Some(minute(1)));
    }

    #[tokio::test]
    async fn test_split_group_alone_leaves_cursor_unset() {
        let api = FlakyApi {
            ok_calls: 1,
            calls: Mutex::new(0),
            network: false,
        };
        let transport = transport(api, 1);

        let watch = samples(MetricType::HeartRate, 1).remove(0);
        let mut phone = watch.clone();
        phone.source = "phone".to_string();

        transport.upload(vec![watch, phone]).await.unwrap_err();

        let status = transport
            .db()
            .get_status("u1", "watch", MetricType::HeartRate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.last_sync_date, None);
        assert!(!status.success);
    }

    #[tokio::test]
    async fn test_record_attempt_keeps_upload_outcomes() {
        let api = FlakyApi {
            ok_calls: usize::MAX,
            calls: Mutex::new(0),
            network: false,
        };
        let transport = transport(api, 4);

        transport.upload(samples(MetricType::StepCount, 3)).await.unwrap();
        transport
            .record_attempt(&[MetricType::StepCount, MetricType::Sleep], Some("device unavailable"))
            .await
            .unwrap();

        let steps = transport
            .db()
            .get_status("u1", "watch", MetricType::StepCount)
            .await
            .unwrap()
            .unwrap();
        assert!(steps.success);
        assert_eq!(steps.last_sync_date, Some(minute(3)));

        let sleep = transport
            .db()
            .get_status("u1", "watch", MetricType::Sleep)
            .await
            .unwrap()
            .unwrap();
        assert!(!sleep.success);
        assert_eq!(sleep.last_sync_date, None);
        assert_eq!(sleep.error_message.as_deref(), Some("device unavailable"));
    }

    #[tokio::test]
    async fn test_empty_upload_is_a_noop() {
        let api = FlakyApi {
            ok_calls: 0,
            calls: Mutex::new(0),
            network: false,
        };
        let report = transport(api, 4).upload(Vec::new()).await.unwrap();
        assert_eq!(report, UploadReport::default());
    }
}
