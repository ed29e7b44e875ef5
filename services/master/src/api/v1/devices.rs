//! Device API endpoints.
//!
//! Allocation, bulk release and blacklist management for test requesters.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use devlab_model::{Device, DeviceRequest, DeviceRestrictionRequest, SessionDescriptor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

/// Device routes: /v1/devices
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_devices))
        .route("/allocate", post(allocate))
        .route("/unallocate", post(unallocate))
        .route("/blacklist", post(blacklist))
        .route("/whitelist", post(whitelist))
        .route("/{host}/{device_id}", get(get_device))
}

#[derive(Debug, Deserialize)]
pub struct AllocateQuery {
    /// Seconds to keep polling. Unset or negative means the default.
    pub timeout_seconds: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub items: Vec<Device>,
}

async fn list_devices(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let items = state
        .store()
        .find_all()
        .await
        .map_err(|e| ApiError::from_allocation(e.into(), &ctx.request_id))?;
    Ok(Json(DeviceListResponse { items }))
}

async fn get_device(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((host, device_id)): Path<(String, String)>,
) -> Result<Json<Device>, ApiError> {
    let device = state
        .store()
        .find(&device_id, &host)
        .await
        .map_err(|e| ApiError::from_allocation(e.into(), &ctx.request_id))?;

    match device {
        Some(device) => Ok(Json(device)),
        None => Err(ApiError::not_found(
            "device_not_found",
            format!("Device {device_id} on {host} not found"),
        )
        .with_request_id(ctx.request_id)),
    }
}

async fn allocate(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<AllocateQuery>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<SessionDescriptor>, ApiError> {
    let session = state
        .allocator()
        .allocate(request, query.timeout_seconds, ctx.session())
        .await
        .map_err(|e| ApiError::from_allocation(e, &ctx.request_id))?;

    info!(
        request_id = %ctx.request_id,
        device_id = %session.device_id,
        host = %session.host,
        "Device allocated to requester"
    );
    Ok(Json(session))
}

/// Release busy devices. An empty body releases every busy device.
async fn unallocate(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let restriction: Option<DeviceRestrictionRequest> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(serde_json::from_slice(&body).map_err(|e| {
            ApiError::bad_request("invalid_body", format!("Invalid restriction request: {e}"))
                .with_request_id(ctx.request_id.clone())
        })?)
    };

    let items = state
        .allocator()
        .unallocate(restriction.as_ref(), &ctx.session())
        .await
        .map_err(|e| ApiError::from_allocation(e, &ctx.request_id))?;

    Ok(Json(DeviceListResponse { items }))
}

async fn blacklist(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(restriction): Json<DeviceRestrictionRequest>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    set_blacklisted(&state, &ctx, &restriction, true).await
}

async fn whitelist(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(restriction): Json<DeviceRestrictionRequest>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    set_blacklisted(&state, &ctx, &restriction, false).await
}

async fn set_blacklisted(
    state: &AppState,
    ctx: &RequestContext,
    restriction: &DeviceRestrictionRequest,
    blacklisted: bool,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let items = state
        .coordinator()
        .set_blacklisted(restriction, blacklisted)
        .await
        .map_err(|e| ApiError::from_allocation(e, &ctx.request_id))?;
    Ok(Json(DeviceListResponse { items }))
}
