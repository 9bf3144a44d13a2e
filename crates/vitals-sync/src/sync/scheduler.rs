//! Cooperative loop that decides when to sync
//!
//! One task owns the loop. Periodic ticks, foreground signals, network
//! restoration and scheduled retries all arrive as [`SyncTrigger`]s; the
//! orchestrator's single-flight guard drops overlapping requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::network::NetworkEvent;
use super::orchestrator::{SyncOrchestrator, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Periodic,
    Foreground,
    NetworkRestored,
    Retry,
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::NetworkRestored => "network-restored",
            SyncTrigger::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Sends triggers into a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SyncTrigger>,
}

impl SchedulerHandle {
    /// The app came to the foreground
    pub async fn foreground(&self) {
        self.trigger(SyncTrigger::Foreground).await;
    }

    pub async fn trigger(&self, trigger: SyncTrigger) {
        if self.tx.send(trigger).await.is_err() {
            tracing::debug!(%trigger, "scheduler stopped, dropping trigger");
        }
    }
}

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
    tx: mpsc::Sender<SyncTrigger>,
    rx: mpsc::Receiver<SyncTrigger>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            orchestrator,
            interval,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle { tx: self.tx.clone() }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// The first periodic tick fires immediately, so a sync runs on start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            orchestrator,
            interval,
            tx,
            mut rx,
        } = self;

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = orchestrator.monitor().subscribe_events();
        let mut timer: Option<DelayedTrigger> = None;

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => SyncTrigger::Periodic,
                Some(trigger) = rx.recv() => trigger,
                event = events.recv() => {
                    match event {
                        Ok(NetworkEvent::Restored { retry_pending, delay }) => {
                            let trigger = if retry_pending {
                                SyncTrigger::Retry
                            } else {
                                SyncTrigger::NetworkRestored
                            };
                            replace_timer(&mut timer, schedule(tx.clone(), trigger, delay));
                        }
                        Ok(NetworkEvent::Lost) => {
                            if cancel_timer(&mut timer) == Some(SyncTrigger::Retry) {
                                tracing::debug!("network lost, deferring retry until restored");
                                orchestrator.monitor().set_retry_pending(true);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "missed network events");
                        }
                        Err(RecvError::Closed) => {}
                    }
                    continue;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            if !orchestrator.monitor().is_online() {
                match trigger {
                    SyncTrigger::Periodic => {
                        tracing::debug!("offline, skipping periodic sync");
                        continue;
                    }
                    SyncTrigger::Retry => {
                        tracing::debug!("offline, deferring retry until restored");
                        orchestrator.monitor().set_retry_pending(true);
                        continue;
                    }
                    SyncTrigger::Foreground | SyncTrigger::NetworkRestored => {}
                }
            }

            tracing::debug!(%trigger, "sync triggered");
            match orchestrator.sync().await {
                Ok(SyncOutcome::RetryScheduled { delay, .. }) => {
                    replace_timer(&mut timer, schedule(tx.clone(), SyncTrigger::Retry, delay));
                }
                Ok(_) => {}
                Err(e) => tracing::error!(%trigger, error = %e, "sync failed"),
            }
        }

        cancel_timer(&mut timer);
    }
}

/// A trigger waiting to be sent
struct DelayedTrigger {
    trigger: SyncTrigger,
    handle: JoinHandle<()>,
}

/// Send `trigger` once `delay` has passed
fn schedule(tx: mpsc::Sender<SyncTrigger>, trigger: SyncTrigger, delay: Duration) -> DelayedTrigger {
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(trigger).await;
    });
    DelayedTrigger { trigger, handle }
}

/// Only one delayed trigger is outstanding at a time
fn replace_timer(slot: &mut Option<DelayedTrigger>, next: DelayedTrigger) {
    if let Some(previous) = slot.replace(next) {
        previous.handle.abort();
    }
}

/// Abort the outstanding timer, returning its trigger if it had not fired yet
fn cancel_timer(slot: &mut Option<DelayedTrigger>) -> Option<SyncTrigger> {
    let pending = slot.take()?;
    if pending.handle.is_finished() {
        return None;
    }
    pending.handle.abort();
    Some(pending.trigger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let (tx, mut rx) = mpsc::channel(1);
        let _timer = schedule(tx, SyncTrigger::Retry, Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        assert_eq!(rx.recv().await, Some(SyncTrigger::Retry));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_timer_cancels_previous() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut slot = None;
        replace_timer(&mut slot, schedule(tx.clone(), SyncTrigger::Retry, Duration::from_secs(2)));
        replace_timer(
            &mut slot,
            schedule(tx.clone(), SyncTrigger::NetworkRestored, Duration::from_secs(3)),
        );
        drop(tx);

        assert_eq!(rx.recv().await, Some(SyncTrigger::NetworkRestored));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_timer_reports_unfired_trigger() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut slot = Some(schedule(tx.clone(), SyncTrigger::Retry, Duration::from_secs(5)));
        assert_eq!(cancel_timer(&mut slot), Some(SyncTrigger::Retry));
        assert!(slot.is_none());

        let mut slot = Some(schedule(tx.clone(), SyncTrigger::Retry, Duration::from_secs(1)));
        assert_eq!(rx.recv().await, Some(SyncTrigger::Retry));
        tokio::task::yield_now().await;
        assert_eq!(cancel_timer(&mut slot), None);
    }
}
