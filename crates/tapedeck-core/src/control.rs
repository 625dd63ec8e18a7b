//! HTTP control API
//!
//! Lets a harness in another process drive the proxy:
//!
//! - `POST /__tapedeck/config` binds a snapshot and working directory
//! - `POST /__tapedeck/flush` closes the window, persisting on success
//! - `GET /__tapedeck/exchanges` returns the captured log
//! - `GET /__tapedeck/health` reports mode and counts
//!
//! Everything outside this prefix is proxied.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::engine::{error_response, status_for, Engine, ProxyMode};
use crate::error::Error;
use crate::snapshot::SnapshotContext;

pub const CONTROL_PREFIX: &str = "/__tapedeck";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    pub snapshot_path: PathBuf,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlushRequest {
    #[serde(default)]
    pub test_failed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigureResponse {
    pub mode: ProxyMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub mode: ProxyMode,
    pub exchange_count: usize,
    pub upstream: String,
}

pub(crate) fn routes() -> Router<Arc<Engine>> {
    Router::new()
        .route(&format!("{CONTROL_PREFIX}/config"), post(configure_handler))
        .route(&format!("{CONTROL_PREFIX}/flush"), post(flush_handler))
        .route(&format!("{CONTROL_PREFIX}/exchanges"), get(exchanges_handler))
        .route(&format!("{CONTROL_PREFIX}/health"), get(health_handler))
}

async fn configure_handler(
    State(engine): State<Arc<Engine>>,
    Json(request): Json<ConfigureRequest>,
) -> Response {
    let context = SnapshotContext {
        suite: request.suite,
        test: request.test,
    };
    match engine
        .configure(&request.snapshot_path, &request.work_dir, context)
        .await
    {
        Ok(mode) => Json(ConfigureResponse { mode }).into_response(),
        Err(e) => {
            warn!("Configure failed: {}", e);
            error_response(status_for(&e), &e)
        }
    }
}

/// The body is optional; an empty one means the test passed
async fn flush_handler(State(engine): State<Arc<Engine>>, body: Bytes) -> Response {
    let request = if body.is_empty() {
        FlushRequest::default()
    } else {
        match serde_json::from_slice::<FlushRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                let err = Error::Configuration(format!("Invalid flush request: {e}"));
                return error_response(StatusCode::BAD_REQUEST, &err);
            }
        }
    };

    match engine.flush(request.test_failed).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            warn!("Flush reported: {}", e);
            let status = match e {
                Error::NoMatch { .. } => StatusCode::CONFLICT,
                _ => status_for(&e),
            };
            error_response(status, &e)
        }
    }
}

async fn exchanges_handler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.exchanges().await)
}

async fn health_handler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        mode: engine.mode().await,
        exchange_count: engine.exchange_count().await,
        upstream: engine.options().upstream_url.clone(),
    })
}
