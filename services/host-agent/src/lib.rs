//! devlab host agent
//!
//! Runs on every machine with devices attached. Owns a fixed range of
//! driver ports and starts, stops and reports driver processes for the
//! master.

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod logs;
pub mod pool;
pub mod ports;
