//! API v1 routes.

mod devices;
mod grid;
mod hosts;
mod inventory;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/devices", devices::routes())
        // Status reports from host agents: /v1/hosts/{host}/devices/{device_id}/status
        .nest("/hosts", hosts::routes())
        .nest("/inventory", inventory::routes())
        .nest("/grid", grid::routes())
}
