//! Configuration loading and default locations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, VitalsError};
use crate::models::MetricType;

/// Default configuration directory name
const CONFIG_DIR_NAME: &str = "vitals-sync";

/// Hard ceiling on rows claimed by one aggregation batch
pub const MAX_BATCH_SIZE: usize = 200;

/// Get the configuration directory path
/// Returns ~/.config/vitals-sync on Unix, ~/Library/Application Support/vitals-sync on macOS
pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(CONFIG_DIR_NAME))
        .ok_or_else(|| VitalsError::config("Could not determine config directory"))
}

/// Get the data directory path for local sync state and the backend database
/// Returns ~/.local/share/vitals-sync on Unix, ~/Library/Application Support/vitals-sync on macOS
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|p| p.join(CONFIG_DIR_NAME))
        .ok_or_else(|| VitalsError::config("Could not determine data directory"))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub dashboard: DashboardConfig,
}

/// Device-side client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the ingestion backend.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// User the session syncs for.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Source identifier stamped on sync status rows.
    #[serde(default = "default_source")]
    pub source: String,

    /// Per-request HTTP timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Samples per upload request. Default: 500.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// In-call attempts for a chunk that fails with a network error. Default: 2.
    #[serde(default = "default_chunk_attempts")]
    pub chunk_attempts: u32,

    /// JSON export read by the file device source.
    #[serde(default)]
    pub device_export: Option<PathBuf>,

    /// Local sync state database. Default: <data_dir>/sync.db.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

/// Sync strategy and scheduling.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Periodic incremental sync interval. Default: 15m.
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Delay between sync completion and dashboard refresh. Default: 10s.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,

    /// How far back a historical sync reaches. Default: 3650 days.
    #[serde(default = "default_history_lookback_days")]
    pub history_lookback_days: u32,

    /// Metrics whose presence signals sync coverage.
    #[serde(default = "default_core_metrics")]
    pub core_metrics: Vec<MetricType>,

    /// Core metrics that must already be present to sync incrementally. Default: 2.
    #[serde(default = "default_incremental_threshold")]
    pub incremental_threshold: usize,

    /// Metrics fetched from the device.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricType>,
}

/// Connectivity probing and network retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// How often connectivity is probed. Default: 5s.
    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Probe request timeout. Default: 3s.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Retry delay multiplied by the attempt number. Default: 5s.
    #[serde(default = "default_retry_base_delay", with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// Network failures tolerated while online before giving up. Default: 3.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Delay before retrying a failed sync once the network returns. Default: 2s.
    #[serde(default = "default_restore_retry_delay", with = "humantime_serde")]
    pub restore_retry_delay: Duration,

    /// Delay before checking for new data once the network returns. Default: 3s.
    #[serde(default = "default_restore_check_delay", with = "humantime_serde")]
    pub restore_check_delay: Duration,
}

/// Ingestion backend and aggregation worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// HTTP listen address. Default: 127.0.0.1:8080.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// SQLite database file. Default: <data_dir>/backend.db.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Connections kept open in the pool. Default: 5.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Extra connections the pool may open under load. Default: 10.
    #[serde(default = "default_max_overflow")]
    pub max_overflow: u32,

    /// How long a caller waits for a pooled connection. Default: 30s.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Concurrent aggregation workers. Default: 2.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Rows claimed per aggregation batch. Default: 50, ceiling 200.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Claims a row may go through before it is marked failed. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep between passes when the queue is empty. Default: 5s.
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,

    /// Age after which a claim is presumed abandoned and returned to the queue. Default: 10m.
    #[serde(default = "default_stale_claim_after", with = "humantime_serde")]
    pub stale_claim_after: Duration,

    /// Recent buckets returned per granularity by the dashboard endpoint.
    #[serde(default)]
    pub dashboard_window: DashboardWindow,
}

/// Number of most recent buckets per granularity in a dashboard view.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardWindow {
    #[serde(default = "default_window_hours")]
    pub hours: u32,
    #[serde(default = "default_window_days")]
    pub days: u32,
    #[serde(default = "default_window_weeks")]
    pub weeks: u32,
    #[serde(default = "default_window_months")]
    pub months: u32,
}

/// Client-side dashboard cache.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Freshness window of a cached view. Default: 5m.
    #[serde(default = "default_dashboard_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_user_id() -> String {
    "default".to_string()
}

fn default_source() -> String {
    "device".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_attempts() -> u32 {
    2
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_history_lookback_days() -> u32 {
    3650
}

fn default_core_metrics() -> Vec<MetricType> {
    MetricType::CORE.to_vec()
}

fn default_incremental_threshold() -> usize {
    2
}

fn default_metrics() -> Vec<MetricType> {
    MetricType::ALL.to_vec()
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_restore_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_restore_check_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_pool_size() -> u32 {
    5
}

fn default_max_overflow() -> u32 {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    3
}

fn default_idle_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stale_claim_after() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_window_hours() -> u32 {
    48
}

fn default_window_days() -> u32 {
    31
}

fn default_window_weeks() -> u32 {
    12
}

fn default_window_months() -> u32 {
    12
}

fn default_dashboard_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            user_id: default_user_id(),
            source: default_source(),
            request_timeout: default_request_timeout(),
            chunk_size: default_chunk_size(),
            chunk_attempts: default_chunk_attempts(),
            device_export: None,
            state_path: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_sync_interval(),
            settle_delay: default_settle_delay(),
            history_lookback_days: default_history_lookback_days(),
            core_metrics: default_core_metrics(),
            incremental_threshold: default_incremental_threshold(),
            metrics: default_metrics(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            retry_base_delay: default_retry_base_delay(),
            max_retry_attempts: default_max_retry_attempts(),
            restore_retry_delay: default_restore_retry_delay(),
            restore_check_delay: default_restore_check_delay(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_path: None,
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            acquire_timeout: default_acquire_timeout(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            idle_interval: default_idle_interval(),
            stale_claim_after: default_stale_claim_after(),
            dashboard_window: DashboardWindow::default(),
        }
    }
}

impl Default for DashboardWindow {
    fn default() -> Self {
        Self {
            hours: default_window_hours(),
            days: default_window_days(),
            weeks: default_window_weeks(),
            months: default_window_months(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            ttl: default_dashboard_ttl(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("config.yaml"))
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            VitalsError::config(format!("reading config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
    }

    /// Load from `path` if given, else from the default location if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = Self::default_path()?;
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate YAML configuration.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)
            .map_err(|e| VitalsError::config(format!("parsing config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.client.chunk_size == 0 {
            return Err(VitalsError::config("client.chunk_size must be positive"));
        }
        if self.client.chunk_attempts == 0 {
            return Err(VitalsError::config("client.chunk_attempts must be positive"));
        }
        if self.client.user_id.is_empty() {
            return Err(VitalsError::config("client.user_id is required"));
        }
        if self.sync.core_metrics.is_empty() {
            return Err(VitalsError::config("sync.core_metrics must not be empty"));
        }
        if self.sync.incremental_threshold == 0 {
            return Err(VitalsError::config("sync.incremental_threshold must be positive"));
        }
        if self.sync.interval.is_zero() {
            return Err(VitalsError::config("sync.interval must be positive"));
        }
        if self.network.max_retry_attempts == 0 {
            return Err(VitalsError::config("network.max_retry_attempts must be positive"));
        }
        if self.network.probe_interval.is_zero() {
            return Err(VitalsError::config("network.probe_interval must be positive"));
        }
        if self.backend.batch_size == 0 || self.backend.batch_size > MAX_BATCH_SIZE {
            return Err(VitalsError::config(format!(
                "backend.batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.backend.pool_size == 0 {
            return Err(VitalsError::config("backend.pool_size must be positive"));
        }
        if self.backend.workers == 0 {
            return Err(VitalsError::config("backend.workers must be positive"));
        }
        if self.backend.max_attempts == 0 {
            return Err(VitalsError::config("backend.max_attempts must be positive"));
        }
        if self.dashboard.ttl.is_zero() {
            return Err(VitalsError::config("dashboard.ttl must be positive"));
        }
        Ok(())
    }

    /// Local sync state database path
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.client.state_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("sync.db")),
        }
    }

    /// Backend database path
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.backend.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("backend.db")),
        }
    }
}
