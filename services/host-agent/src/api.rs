//! HTTP API served to the master.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use devlab_model::{
    BindingsResponse, StartDriverRequest, StartDriverResponse, StopDriverRequest,
    StopDriverResponse,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::pool::{PoolManager, StartRequest};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pool: Arc<PoolManager>,
    log_dir: PathBuf,
}

impl AppState {
    pub fn new(pool: Arc<PoolManager>, log_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(AppStateInner { pool, log_dir }),
        }
    }

    pub fn pool(&self) -> &PoolManager {
        &self.inner.pool
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/driver/start", post(start_driver))
        .route("/driver/stop", post(stop_driver))
        .route("/driver/bindings", get(bindings))
        .route("/driver/logs/{device_id}/{file}", get(log_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "available_ports": state.pool().available_ports().await,
    }))
}

/// Start the device's driver, replacing any driver it already has.
async fn start_driver(
    State(state): State<AppState>,
    Json(req): Json<StartDriverRequest>,
) -> Result<Json<StartDriverResponse>, ApiError> {
    if req.device_id.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_request", "device_id is required"));
    }

    let request = StartRequest {
        device_id: req.device_id,
        is_android: req.is_android,
        request_id: req.request_id,
        browser_version: req.browser_version,
    };

    match state.pool().restart(&request).await? {
        Some(session_url) => {
            info!(device_id = %request.device_id, session_url = %session_url, "Driver session ready");
            Ok(Json(StartDriverResponse { session_url }))
        }
        None => Err(ApiError::service_unavailable(
            "driver_superseded",
            format!("driver start for device {} was cancelled by a stop", request.device_id),
        )),
    }
}

async fn stop_driver(
    State(state): State<AppState>,
    Json(req): Json<StopDriverRequest>,
) -> Result<Json<StopDriverResponse>, ApiError> {
    state.pool().stop(&req.device_id).await?;
    Ok(Json(StopDriverResponse { stopped: true }))
}

async fn bindings(State(state): State<AppState>) -> Json<BindingsResponse> {
    Json(BindingsResponse {
        host: state.pool().host_ip().to_string(),
        bindings: state.pool().bindings().await,
    })
}

async fn log_file(
    State(state): State<AppState>,
    Path((device_id, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_plain_name(&device_id) || !is_plain_name(&file) {
        return Err(ApiError::bad_request(
            "invalid_path",
            "log path segments must be plain file names",
        ));
    }

    let path = state.inner.log_dir.join(&device_id).join(&file);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ApiError::not_found(
            "log_not_found",
            format!("no log {file} for device {device_id}"),
        )),
        Err(e) => Err(ApiError::internal("log_read_failed", e.to_string())),
    }
}

fn is_plain_name(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && !segment.contains("..")
        && !segment.contains(['/', '\\'])
}
