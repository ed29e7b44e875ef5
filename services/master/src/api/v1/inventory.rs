//! Inventory reports from host agents.

use axum::{extract::State, routing::post, Json, Router};
use devlab_model::InventoryReport;

use crate::allocation::InventoryOutcome;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", post(report_inventory))
}

async fn report_inventory(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(report): Json<InventoryReport>,
) -> Result<Json<InventoryOutcome>, ApiError> {
    let outcome = state
        .coordinator()
        .apply_inventory(&report)
        .await
        .map_err(|e| ApiError::from_allocation(e, &ctx.request_id))?;
    Ok(Json(outcome))
}
