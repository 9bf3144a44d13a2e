//! Connectivity monitoring
//!
//! The monitor probes the backend on an interval and publishes the current
//! [`NetworkState`] on a watch channel. Transitions are also emitted as
//! [`NetworkEvent`]s; a restoration event says whether a failed sync is
//! owed a retry and how long to let the link settle before acting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::client::BackendClient;
use crate::config::NetworkConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Lost,
    /// Link is back. `retry_pending` is set when a network-failed sync is
    /// waiting; act after `delay`.
    Restored { retry_pending: bool, delay: Duration },
}

/// A single reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probe that calls the backend health endpoint with a short timeout
pub struct HttpProbe {
    client: BackendClient,
}

impl HttpProbe {
    pub fn new(backend_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: BackendClient::new(backend_url, timeout)?,
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.health().await {
            Ok(()) => true,
            Err(e) if e.is_network() => false,
            // Any answer at all means the host is reachable
            Err(_) => true,
        }
    }
}

pub struct NetworkMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    probe_interval: Duration,
    restore_retry_delay: Duration,
    restore_check_delay: Duration,
    state: watch::Sender<NetworkState>,
    events: broadcast::Sender<NetworkEvent>,
    retry_pending: AtomicBool,
}

impl NetworkMonitor {
    /// Create a monitor that starts out assuming the network is up
    pub fn new(probe: Arc<dyn ConnectivityProbe>, cfg: &NetworkConfig) -> Self {
        let (state, _) = watch::channel(NetworkState::Online);
        let (events, _) = broadcast::channel(16);
        Self {
            probe,
            probe_interval: cfg.probe_interval,
            restore_retry_delay: cfg.restore_retry_delay,
            restore_check_delay: cfg.restore_check_delay,
            state,
            events,
            retry_pending: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> NetworkState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == NetworkState::Online
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NetworkState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Note that a sync failed on the network and should run again on restore
    pub fn set_retry_pending(&self, pending: bool) {
        self.retry_pending.store(pending, Ordering::SeqCst);
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending.load(Ordering::SeqCst)
    }

    /// Probe once and apply the result
    pub async fn check(&self) -> NetworkState {
        let reachable = self.probe.is_reachable().await;
        self.record(reachable);
        self.state()
    }

    /// Apply an observed reachability, emitting an event on transitions
    pub fn record(&self, reachable: bool) -> Option<NetworkEvent> {
        let next = if reachable {
            NetworkState::Online
        } else {
            NetworkState::Offline
        };

        let previous = self.state.send_replace(next);
        let event = match (previous, next) {
            (NetworkState::Online, NetworkState::Offline) => {
                tracing::warn!("network lost");
                NetworkEvent::Lost
            }
            (NetworkState::Offline, NetworkState::Online) => {
                let retry_pending = self.retry_pending.swap(false, Ordering::SeqCst);
                let delay = if retry_pending {
                    self.restore_retry_delay
                } else {
                    self.restore_check_delay
                };
                tracing::info!(retry_pending, delay_ms = delay.as_millis() as u64, "network restored");
                NetworkEvent::Restored { retry_pending, delay }
            }
            _ => return None,
        };

        // No subscribers is fine
        let _ = self.events.send(event);
        Some(event)
    }

    /// Probe on an interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
