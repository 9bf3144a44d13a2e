//! TTL-bounded cache of the backend dashboard view

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::IngestApi;
use crate::error::Result;
use crate::models::DashboardView;

struct CachedView {
    view: DashboardView,
    fetched_at: Instant,
}

pub struct DashboardCache {
    api: Arc<dyn IngestApi>,
    user_id: String,
    ttl: Duration,
    entry: Mutex<Option<CachedView>>,
    refreshing: AtomicBool,
}

/// Clears the in-flight flag when a refresh ends, even on error
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DashboardCache {
    pub fn new(api: Arc<dyn IngestApi>, user_id: &str, ttl: Duration) -> Self {
        Self {
            api,
            user_id: user_id.to_string(),
            ttl,
            entry: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Cached view if younger than the TTL, otherwise a fresh fetch
    pub async fn get_dashboard(&self) -> Result<DashboardView> {
        let mut entry = self.entry.lock().await;
        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.view.clone());
            }
        }

        let view = self.api.dashboard(&self.user_id).await?;
        tracing::debug!(user_id = %self.user_id, "dashboard fetched");
        *entry = Some(CachedView {
            view: view.clone(),
            fetched_at: Instant::now(),
        });
        Ok(view)
    }

    /// Fetch regardless of the TTL.
    ///
    /// A refresh that starts while another is running does nothing and
    /// returns whatever is cached.
    pub async fn refresh(&self) -> Result<Option<DashboardView>> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("dashboard refresh already in flight");
            return Ok(self.cached().await);
        }
        let _guard = RefreshGuard(&self.refreshing);

        let view = self.api.dashboard(&self.user_id).await?;
        *self.entry.lock().await = Some(CachedView {
            view: view.clone(),
            fetched_at: Instant::now(),
        });
        Ok(Some(view))
    }

    /// Drop the cached view; the next read fetches
    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }

    /// Current cached view, fresh or not
    pub async fn cached(&self) -> Option<DashboardView> {
        self.entry.lock().await.as_ref().map(|c| c.view.clone())
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Invalidate and refresh once `delay` has passed
    pub fn refresh_after(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.invalidate().await;
            if let Err(e) = cache.refresh().await {
                tracing::warn!(error = %e, "dashboard refresh failed");
            }
        })
    }
}
