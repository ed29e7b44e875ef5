//! Node-selection contract for a test-grid hub adapter.
//!
//! The hub forwards the capabilities of a new session and receives the
//! device that would be chosen, without any state change.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridCapability {
    /// `android` or `ios`, case-insensitive.
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub device_name: Option<String>,

    #[serde(default)]
    pub brand: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub real_device: Option<bool>,

    /// Pins the session to one device id.
    #[serde(default)]
    pub udid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridFilter {
    #[serde(default)]
    pub team: Option<String>,

    #[serde(default)]
    pub job_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMatchRequest {
    #[serde(default)]
    pub capability: GridCapability,

    #[serde(default)]
    pub filter: GridFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridNode {
    pub device_id: String,
    pub host: String,
    pub device_name: String,
    pub platform: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridMatchResponse {
    pub node: Option<GridNode>,
}
