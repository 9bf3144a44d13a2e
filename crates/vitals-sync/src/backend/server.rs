//! HTTP ingestion API
//!
//! Routes:
//! - `POST /api/v1/samples` ingest a chunk of samples
//! - `GET /api/v1/users/:user_id/sync-status` latest persisted end time per metric
//! - `GET /api/v1/users/:user_id/dashboard` recent aggregates at every granularity
//! - `GET /health` connectivity probe target

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use super::store::RawStore;
use super::worker::spawn_workers;
use crate::config::{BackendConfig, DashboardWindow};
use crate::error::{Result, VitalsError};
use crate::models::{IngestRequest, MetricType};

/// Shared state for the API routes.
#[derive(Clone)]
pub struct AppState {
    pub store: RawStore,
    pub window: Arc<DashboardWindow>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/samples", post(ingest_samples))
        .route("/api/v1/users/:user_id/sync-status", get(sync_status))
        .route("/api/v1/users/:user_id/dashboard", get(dashboard))
        .with_state(state)
}

/// Map store errors to HTTP responses.
fn error_response(err: VitalsError) -> Response {
    match err {
        VitalsError::InvalidSample(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg).into_response(),
        VitalsError::Database(msg) => {
            warn!("database error: {msg}");
            (StatusCode::SERVICE_UNAVAILABLE, msg).into_response()
        }
        other => {
            warn!("request failed: {other}");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// POST /api/v1/samples, idempotent on the sample identity
async fn ingest_samples(State(state): State<AppState>, Json(request): Json<IngestRequest>) -> Response {
    match state.store.ingest(&request.user_id, &request.samples).await {
        Ok(receipt) => {
            info!(
                user_id = %request.user_id,
                accepted = receipt.accepted,
                inserted = receipt.inserted,
                "ingested samples"
            );
            (StatusCode::OK, Json(receipt)).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// GET /api/v1/users/:user_id/sync-status
async fn sync_status(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match state.store.latest_timestamps(&user_id).await {
        Ok(latest) => {
            let body: BTreeMap<MetricType, DateTime<Utc>> = latest.into_iter().collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// GET /api/v1/users/:user_id/dashboard
async fn dashboard(State(state): State<AppState>, Path(user_id): Path<String>) -> Response {
    match state.store.dashboard(&user_id, &state.window, Utc::now()).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Run the API and aggregation workers until ctrl-c.
pub async fn serve(store: RawStore, cfg: &BackendConfig) -> Result<()> {
    let recovered = store.recover_stale_claims(cfg.stale_claim_after).await?;
    if recovered > 0 {
        info!(recovered, "returned stale claims to the queue");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = spawn_workers(&store, cfg, shutdown_rx);

    let app = router(AppState {
        store,
        window: Arc::new(cfg.dashboard_window.clone()),
    });

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    info!("listening on http://{}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("worker exited with error: {e}"),
            Err(e) => warn!("worker task panicked: {e}"),
        }
    }

    Ok(())
}
