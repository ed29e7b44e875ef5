//! devlab master library.
//!
//! The master owns the device pool: it matches requests to devices, commits
//! allocations, asks host agents to start drivers and reaps sessions that no
//! longer reflect reality. It ships a `master` binary; the library surface
//! exists for integration testing.

pub mod allocation;
pub mod api;
pub mod config;
pub mod hosts;
pub mod reaper;
pub mod state;
pub mod store;
pub mod usage;
