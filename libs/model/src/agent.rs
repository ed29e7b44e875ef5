//! Messages exchanged between the master and host agents.

use serde::{Deserialize, Serialize};

/// Ask a host agent to (re)start the driver process for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDriverRequest {
    pub device_id: String,
    pub is_android: bool,
    pub request_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDriverResponse {
    /// Externally reachable driver endpoint, e.g. `http://10.0.0.5:4723/wd/hub`.
    pub session_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopDriverRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopDriverResponse {
    pub stopped: bool,
}

/// Lifecycle of a device's driver slot on a host agent. Idle slots are not
/// reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Starting,
    Ready,
    Stopping,
}

/// A device currently bound to a driver port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveBinding {
    pub device_id: String,
    pub port: u16,
    pub state: DriverState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingsResponse {
    pub host: String,
    pub bindings: Vec<LiveBinding>,
}
