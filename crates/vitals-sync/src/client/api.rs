//! HTTP client for the ingestion backend
//!
//! The sync pipeline talks to the backend through the [`IngestApi`] trait so
//! tests can swap in an in-process fake; [`BackendClient`] is the reqwest
//! implementation used by the CLI.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::error::{Result, VitalsError};
use crate::models::{DashboardView, IngestReceipt, MetricType, Sample};

const CLIENT_USER_AGENT: &str = concat!("vitals-sync/", env!("CARGO_PKG_VERSION"));

/// Backend operations the sync pipeline depends on
#[async_trait]
pub trait IngestApi: Send + Sync {
    /// Submit one chunk of samples
    async fn ingest(&self, user_id: &str, samples: &[Sample]) -> Result<IngestReceipt>;

    /// Latest persisted sample end time per metric
    async fn sync_status(&self, user_id: &str) -> Result<HashMap<MetricType, DateTime<Utc>>>;

    /// Four-granularity aggregate view
    async fn dashboard(&self, user_id: &str) -> Result<DashboardView>;
}

#[derive(Serialize)]
struct IngestBody<'a> {
    user_id: &'a str,
    samples: &'a [Sample],
}

/// reqwest client for the ingestion backend
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: Url,
}

impl BackendClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| VitalsError::config(format!("Invalid backend URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(VitalsError::config(format!("Invalid backend URL '{}'", base_url)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VitalsError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn from_config(cfg: &ClientConfig) -> Result<Self> {
        Self::new(&cfg.backend_url, cfg.request_timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build the full URL from path segments; segments are percent-encoded
    fn build_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Check the backend health endpoint
    pub async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(self.build_url(&["health"]))
            .header(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT))
            .send()
            .await
            .map_err(map_transport_error)?;
        handle_response_status(response).await?;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let response = self
            .client
            .get(self.build_url(segments))
            .header(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT))
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = handle_response_status(response).await?;
        response.json().await.map_err(|e| {
            VitalsError::invalid_response(format!("Failed to parse JSON response: {}", e))
        })
    }
}

#[async_trait]
impl IngestApi for BackendClient {
    async fn ingest(&self, user_id: &str, samples: &[Sample]) -> Result<IngestReceipt> {
        let response = self
            .client
            .post(self.build_url(&["api", "v1", "samples"]))
            .header(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT))
            .json(&IngestBody { user_id, samples })
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = handle_response_status(response).await?;
        response.json().await.map_err(|e| {
            VitalsError::invalid_response(format!("Failed to parse ingest response: {}", e))
        })
    }

    async fn sync_status(&self, user_id: &str) -> Result<HashMap<MetricType, DateTime<Utc>>> {
        self.get_json(&["api", "v1", "users", user_id, "sync-status"]).await
    }

    async fn dashboard(&self, user_id: &str) -> Result<DashboardView> {
        self.get_json(&["api", "v1", "users", user_id, "dashboard"]).await
    }
}

/// Classify reqwest failures that never produced a response
fn map_transport_error(err: reqwest::Error) -> VitalsError {
    if err.is_timeout() {
        VitalsError::Timeout(err.to_string())
    } else if err.is_connect() {
        VitalsError::Network(err.to_string())
    } else {
        VitalsError::Http(err)
    }
}

/// Handle response status codes and convert to errors
async fn handle_response_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(VitalsError::Api {
        status: status.as_u16(),
        message: body,
    })
}
