//! Sync strategy selection and single-flight sync runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::network::NetworkMonitor;
use super::retry::{RetryDecision, RetryPolicy};
use super::transport::SyncTransport;
use crate::client::IngestApi;
use crate::config::{NetworkConfig, SyncConfig};
use crate::dashboard::DashboardCache;
use crate::device::DeviceSource;
use crate::error::{Result, VitalsError};
use crate::models::{MetricType, Sample, SyncStrategy};

/// Pick the sync strategy from the timestamps the backend already holds.
///
/// Incremental only when at least `threshold` core metrics have data;
/// thinner coverage is not trusted and triggers a full backfill.
pub fn decide_sync_strategy(
    existing: &HashMap<MetricType, DateTime<Utc>>,
    core_metrics: &[MetricType],
    threshold: usize,
) -> SyncStrategy {
    let present = core_metrics
        .iter()
        .filter(|metric| existing.contains_key(metric))
        .count();

    if present >= threshold.max(1) {
        SyncStrategy::Incremental
    } else {
        SyncStrategy::Historical
    }
}

/// Summary of one completed sync run
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub strategy: SyncStrategy,
    /// Samples returned by the device
    pub fetched: usize,
    /// Samples dropped as invalid
    pub skipped: usize,
    pub submitted: usize,
    pub inserted: usize,
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sync: {} fetched, {} uploaded ({} new)",
            self.strategy, self.fetched, self.submitted, self.inserted
        )?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another sync was already running
    Skipped,
    /// Network failure while online; a retry is due after `delay`
    RetryScheduled { attempt: u32, delay: Duration },
    /// Network failure while offline; retried when the network returns
    WaitingForNetwork,
}

/// User-facing sync status messages
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    Started(SyncStrategy),
    Completed(SyncReport),
    WaitingForNetwork,
    Retrying { attempt: u32, delay: Duration },
    Failed(String),
}

impl std::fmt::Display for SyncNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncNotice::Started(strategy) => write!(f, "Starting {} sync...", strategy),
            SyncNotice::Completed(report) => write!(f, "{}", report),
            SyncNotice::WaitingForNetwork => write!(f, "No network - will retry when restored"),
            SyncNotice::Retrying { delay, .. } => write!(f, "Retrying in {}s...", delay.as_secs()),
            SyncNotice::Failed(message) => write!(f, "{}", message),
        }
    }
}

/// Marks a sync as in flight for as long as it is held
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives device reads and uploads for one user session.
pub struct SyncOrchestrator {
    device: Arc<dyn DeviceSource>,
    api: Arc<dyn IngestApi>,
    transport: SyncTransport,
    monitor: Arc<NetworkMonitor>,
    dashboard: Option<Arc<DashboardCache>>,
    metrics: Vec<MetricType>,
    core_metrics: Vec<MetricType>,
    incremental_threshold: usize,
    history_lookback: chrono::Duration,
    settle_delay: Duration,
    retry: Mutex<RetryPolicy>,
    syncing: AtomicBool,
    notices: broadcast::Sender<SyncNotice>,
    /// Latest scheduled dashboard refresh
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        device: Arc<dyn DeviceSource>,
        api: Arc<dyn IngestApi>,
        transport: SyncTransport,
        monitor: Arc<NetworkMonitor>,
        sync: &SyncConfig,
        network: &NetworkConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(32);
        Self {
            device,
            api,
            transport,
            monitor,
            dashboard: None,
            metrics: sync.metrics.clone(),
            core_metrics: sync.core_metrics.clone(),
            incremental_threshold: sync.incremental_threshold,
            history_lookback: chrono::Duration::days(i64::from(sync.history_lookback_days)),
            settle_delay: sync.settle_delay,
            retry: Mutex::new(RetryPolicy::from_config(network)),
            syncing: AtomicBool::new(false),
            notices,
            refresh: Mutex::new(None),
        }
    }

    /// Refresh `cache` a settle delay after each sync run
    pub fn with_dashboard(mut self, cache: Arc<DashboardCache>) -> Self {
        self.dashboard = Some(cache);
        self
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn decide_sync_strategy(&self, existing: &HashMap<MetricType, DateTime<Utc>>) -> SyncStrategy {
        decide_sync_strategy(existing, &self.core_metrics, self.incremental_threshold)
    }

    /// Ask the backend what it holds, pick a strategy and run it.
    ///
    /// Returns [`SyncOutcome::Skipped`] if a sync is already in flight.
    pub async fn sync(&self) -> Result<SyncOutcome> {
        self.run_guarded(None).await
    }

    /// Forced historical sync, used on first authorization
    pub async fn perform_initial_sync(&self) -> Result<SyncOutcome> {
        self.run_guarded(Some(SyncStrategy::Historical)).await
    }

    /// Backfill every metric over the full lookback window
    pub async fn perform_historical_sync(&self) -> Result<SyncReport> {
        self.notify(SyncNotice::Started(SyncStrategy::Historical));
        let now = Utc::now();
        let from = now - self.history_lookback;
        let ranges = self.metrics.iter().map(|m| (*m, from)).collect::<Vec<_>>();
        self.fetch_and_upload(SyncStrategy::Historical, &ranges, now).await
    }

    /// Fetch only samples ending at or after each metric's cursor.
    ///
    /// Samples ending exactly at the cursor are read again so that a group
    /// sharing that end time is never half skipped; the backend drops the
    /// duplicates.
    pub async fn perform_incremental_sync(&self) -> Result<SyncReport> {
        let remote = self.api.sync_status(self.transport.user_id()).await?;
        self.incremental_from(&remote).await
    }

    async fn incremental_from(&self, remote: &HashMap<MetricType, DateTime<Utc>>) -> Result<SyncReport> {
        self.notify(SyncNotice::Started(SyncStrategy::Incremental));
        let now = Utc::now();
        let local = self
            .transport
            .db()
            .cursors(self.transport.user_id(), self.transport.source())
            .await?;

        let ranges = self
            .metrics
            .iter()
            .map(|metric| {
                let cursor = match (remote.get(metric), local.get(metric)) {
                    (Some(r), Some(l)) => Some(*r.max(l)),
                    (Some(r), None) => Some(*r),
                    (None, Some(l)) => Some(*l),
                    (None, None) => None,
                };
                let from = match cursor {
                    Some(cursor) => cursor - chrono::Duration::milliseconds(1),
                    None => now - self.history_lookback,
                };
                (*metric, from)
            })
            .collect::<Vec<_>>();

        self.fetch_and_upload(SyncStrategy::Incremental, &ranges, now).await
    }

    async fn run_guarded(&self, forced: Option<SyncStrategy>) -> Result<SyncOutcome> {
        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            tracing::debug!("sync already in flight, ignoring request");
            return Ok(SyncOutcome::Skipped);
        };

        if self.retry.lock().await.take_pending() {
            tracing::info!("running owed sync retry");
        }

        let result = match forced {
            Some(SyncStrategy::Historical) => self.perform_historical_sync().await,
            Some(SyncStrategy::Incremental) => self.perform_incremental_sync().await,
            None => self.decide_and_run().await,
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .transport
            .record_attempt(&self.metrics, error.as_deref())
            .await
        {
            tracing::warn!(error = %e, "failed to record sync status");
        }

        if let Some(cache) = &self.dashboard {
            let next = cache.refresh_after(self.settle_delay);
            if let Some(previous) = self.refresh.lock().await.replace(next) {
                previous.abort();
            }
        }

        match result {
            Ok(report) => {
                self.retry.lock().await.on_success();
                self.monitor.set_retry_pending(false);
                tracing::info!(
                    strategy = %report.strategy,
                    fetched = report.fetched,
                    submitted = report.submitted,
                    inserted = report.inserted,
                    skipped = report.skipped,
                    "sync complete"
                );
                self.notify(SyncNotice::Completed(report.clone()));
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => self.handle_failure(e).await,
        }
    }

    async fn decide_and_run(&self) -> Result<SyncReport> {
        let remote = self.api.sync_status(self.transport.user_id()).await?;
        let strategy = self.decide_sync_strategy(&remote);
        tracing::debug!(%strategy, known_metrics = remote.len(), "sync strategy decided");

        match strategy {
            SyncStrategy::Historical => self.perform_historical_sync().await,
            SyncStrategy::Incremental => self.incremental_from(&remote).await,
        }
    }

    async fn handle_failure(&self, err: VitalsError) -> Result<SyncOutcome> {
        let online = self.monitor.is_online();
        let decision = self.retry.lock().await.on_failure(&err, online);

        match decision {
            RetryDecision::RetryAfter { attempt, delay } => {
                tracing::warn!(attempt, delay_s = delay.as_secs(), error = %err, "sync failed, retrying");
                self.notify(SyncNotice::Retrying { attempt, delay });
                Ok(SyncOutcome::RetryScheduled { attempt, delay })
            }
            RetryDecision::WaitForNetwork => {
                tracing::warn!(error = %err, "sync failed while offline");
                self.monitor.set_retry_pending(true);
                self.notify(SyncNotice::WaitingForNetwork);
                Ok(SyncOutcome::WaitingForNetwork)
            }
            RetryDecision::GiveUp { attempts } => {
                self.monitor.set_retry_pending(false);
                let err = VitalsError::PermanentFailure {
                    attempts,
                    message: err.to_string(),
                };
                tracing::error!(error = %err, "giving up on sync");
                self.notify(SyncNotice::Failed(err.to_string()));
                Err(err)
            }
            RetryDecision::NotRetryable => {
                tracing::error!(error = %err, "sync failed");
                self.notify(SyncNotice::Failed(format!("Sync failed: {}", err)));
                Err(err)
            }
        }
    }

    async fn fetch_and_upload(
        &self,
        strategy: SyncStrategy,
        ranges: &[(MetricType, DateTime<Utc>)],
        to: DateTime<Utc>,
    ) -> Result<SyncReport> {
        let mut fetched = 0;
        let mut skipped = 0;
        let mut batch: Vec<Sample> = Vec::new();

        for (metric, from) in ranges {
            let samples = self.device.query(*metric, *from, to).await?;
            fetched += samples.len();

            for sample in samples {
                let valid = if sample.metric_type != *metric {
                    Err(VitalsError::invalid_sample(format!(
                        "expected {}, got {}",
                        metric, sample.metric_type
                    )))
                } else {
                    sample.validate()
                };

                match valid {
                    Ok(()) => batch.push(sample),
                    Err(e) => {
                        tracing::warn!(%metric, error = %e, "skipping invalid sample");
                        skipped += 1;
                    }
                }
            }
        }

        let upload = self.transport.upload(batch).await?;

        Ok(SyncReport {
            strategy,
            fetched,
            skipped,
            submitted: upload.submitted,
            inserted: upload.inserted,
        })
    }

    fn notify(&self, notice: SyncNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }
}
