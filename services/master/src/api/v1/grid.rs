//! Node selection for a test-grid hub adapter.
//!
//! The hub asks which device a session with the given capabilities would
//! land on. Nothing is claimed; the real allocation happens later through
//! the regular allocate path.

use axum::{extract::State, routing::post, Json, Router};
use devlab_model::{DeviceRequest, GridMatchRequest, GridMatchResponse, GridNode};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/match", post(match_node))
}

fn to_device_request(req: &GridMatchRequest) -> Result<DeviceRequest, ApiError> {
    let is_android = match req.capability.platform.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(p) if p.eq_ignore_ascii_case("android") => Some(true),
        Some(p) if p.eq_ignore_ascii_case("ios") => Some(false),
        Some(other) => {
            return Err(ApiError::bad_request(
                "invalid_platform",
                format!("Unknown platform '{other}'"),
            ))
        }
    };

    Ok(DeviceRequest {
        is_android,
        is_real_device: req.capability.real_device,
        brand: req.capability.brand.clone(),
        device_name: req.capability.device_name.clone(),
        version: req.capability.version.clone(),
        team: req.filter.team.clone(),
        job_link: req.filter.job_link.clone(),
        ..Default::default()
    })
}

async fn match_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<GridMatchRequest>,
) -> Result<Json<GridMatchResponse>, ApiError> {
    let request = to_device_request(&req).map_err(|e| e.with_request_id(ctx.request_id.clone()))?;
    let udid = req.capability.udid.as_deref().filter(|u| !u.trim().is_empty());

    let device = state
        .allocator()
        .preview(&request, udid)
        .await
        .map_err(|e| ApiError::from_allocation(e, &ctx.request_id))?;

    Ok(Json(GridMatchResponse {
        node: device.map(|d| GridNode {
            device_name: d.display_name().to_string(),
            platform: if d.is_android { "android" } else { "ios" }.to_string(),
            device_id: d.id,
            host: d.host,
            os_version: d.os_version,
        }),
    }))
}
