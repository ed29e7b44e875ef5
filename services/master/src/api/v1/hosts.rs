//! Status reports for single devices.
//!
//! Host agents call this to report a disconnected device (REMOVE); the
//! release path and operators use FREE and BUSY.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use devlab_model::{StatusUpdateRequest, StatusUpdateResponse};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{host}/devices/{device_id}/status", post(update_status))
}

async fn update_status(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((host, device_id)): Path<(String, String)>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<StatusUpdateResponse>, ApiError> {
    let updated = state
        .coordinator()
        .transition(&device_id, &host, req.action, &ctx.session())
        .await
        .map_err(|e| ApiError::from_allocation(e, &ctx.request_id))?;

    info!(
        request_id = %ctx.request_id,
        device_id = %device_id,
        host = %host,
        action = %req.action,
        updated,
        "Device status update"
    );
    Ok(Json(StatusUpdateResponse { updated }))
}
