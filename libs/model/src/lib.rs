//! # devlab-model
//!
//! Record and wire types shared by the devlab master and its host agents.
//!
//! ## Layout
//!
//! - `device`: the persisted device record and inventory reports from hosts
//! - `request`: allocation, restriction and status-update payloads
//! - `agent`: driver start/stop/bindings messages exchanged with host agents
//! - `grid`: the node-selection contract used by a test-grid hub adapter
//! - `headers`: request-context header names

mod agent;
mod device;
mod grid;
pub mod headers;
mod request;

pub use agent::*;
pub use device::*;
pub use grid::*;
pub use request::*;

/// Team used when a request does not name one.
pub const DEFAULT_TEAM: &str = "common";
