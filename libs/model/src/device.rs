//! Device records and inventory reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who currently holds a busy device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedTo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_link: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

/// A device attached to a host, identified by `(id, host)`.
///
/// A free device has no holder and either an `allocation_end` or no
/// allocation history at all. A busy device has an `allocation_start`
/// and no `allocation_end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Serial or UDID reported by the host.
    pub id: String,

    /// Address of the host agent the device is attached to.
    pub host: String,

    pub is_android: bool,
    pub is_real_device: bool,
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_name: Option<String>,

    pub manufacturer: String,
    pub os_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,

    pub free: bool,

    #[serde(default)]
    pub blacklisted: bool,

    #[serde(default = "default_connected")]
    pub connected: bool,

    #[serde(default)]
    pub allocation_start: Option<DateTime<Utc>>,

    #[serde(default)]
    pub allocation_end: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_session_duration_ms: Option<i64>,

    #[serde(default)]
    pub allocated_to: Option<AllocatedTo>,

    pub last_modified: DateTime<Utc>,
}

fn default_connected() -> bool {
    true
}

impl Device {
    /// Build a fresh, free record from an inventory entry.
    pub fn from_info(host: &str, info: &DeviceInfo, now: DateTime<Utc>) -> Self {
        Self {
            id: info.device_id.clone(),
            host: host.to_string(),
            is_android: info.is_android,
            is_real_device: info.is_real_device,
            model: info.model.clone(),
            market_name: info.market_name.clone(),
            manufacturer: info.manufacturer.clone(),
            os_version: info.sdk_version.clone(),
            browser_version: info.browser_version.clone(),
            free: true,
            blacklisted: false,
            connected: true,
            allocation_start: None,
            allocation_end: None,
            last_session_duration_ms: None,
            allocated_to: None,
            last_modified: now,
        }
    }

    /// Refresh platform attributes from a newer inventory entry.
    ///
    /// Allocation state and the blacklist flag are left untouched.
    pub fn refresh_from(&mut self, info: &DeviceInfo, now: DateTime<Utc>) {
        self.is_android = info.is_android;
        self.is_real_device = info.is_real_device;
        self.model = info.model.clone();
        self.market_name = info.market_name.clone();
        self.manufacturer = info.manufacturer.clone();
        self.os_version = info.sdk_version.clone();
        self.browser_version = info.browser_version.clone();
        self.connected = true;
        self.last_modified = now;
    }

    /// Human-facing name: the market name when known, the model otherwise.
    pub fn display_name(&self) -> &str {
        match self.market_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.model,
        }
    }

    pub fn is_busy(&self) -> bool {
        !self.free
    }

    /// Major component of the OS version (`"11.2"` -> `"11"`).
    pub fn major_version(&self) -> &str {
        major_version(&self.os_version)
    }

    pub fn is_identified_by(&self, id: &str, host: &str) -> bool {
        self.id == id && self.host == host
    }

    /// Team holding the device, if any.
    pub fn holder_team(&self) -> Option<&str> {
        self.allocated_to.as_ref().and_then(|a| a.team.as_deref())
    }
}

/// Text before the first `.`, trimmed.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version).trim()
}

/// One device as seen by a host's periodic inventory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub sdk_version: String,
    pub model: String,

    #[serde(default)]
    pub market_name: Option<String>,

    #[serde(default)]
    pub manufacturer: String,

    pub is_android: bool,

    #[serde(default = "default_real_device")]
    pub is_real_device: bool,

    #[serde(default)]
    pub browser_version: Option<String>,
}

fn default_real_device() -> bool {
    true
}

/// Everything currently connected to one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryReport {
    pub host: String,

    #[serde(default)]
    pub android_devices: Vec<DeviceInfo>,

    #[serde(default)]
    pub ios_devices: Vec<DeviceInfo>,
}

impl InventoryReport {
    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.android_devices.iter().chain(self.ios_devices.iter())
    }
}
