//! Allocation, restriction and status-update payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a requester needs from a device.
///
/// `brand`, `device_name` and `version` accept comma-separated alternatives.
/// `clear_user_data`, `app_package` and `browser_version` only prepare the
/// session and take no part in matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_android: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_real_device: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_link: Option<String>,

    #[serde(default)]
    pub clear_user_data: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_package: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_version: Option<String>,
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(android) = self.is_android {
            parts.push(format!(
                "platform={}",
                if android { "android" } else { "ios" }
            ));
        }
        if let Some(real) = self.is_real_device {
            parts.push(format!("real_device={real}"));
        }
        for (name, value) in [
            ("brand", &self.brand),
            ("device_name", &self.device_name),
            ("version", &self.version),
            ("team", &self.team),
            ("job_link", &self.job_link),
        ] {
            if let Some(value) = value {
                parts.push(format!("{name}={value}"));
            }
        }
        if parts.is_empty() {
            f.write_str("any device")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

/// Selects devices for bulk operations (unallocate, blacklist, whitelist).
///
/// `host` narrows the selection; the remaining fields are alternatives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRestrictionRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DeviceRestrictionRequest {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        self.device_ids.is_empty()
            && is_blank(&self.host)
            && is_blank(&self.brand)
            && is_blank(&self.name)
            && is_blank(&self.version)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|v| v.trim().is_empty())
}

/// Status transitions a caller may request for a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceAction {
    Free,
    Busy,
    Remove,
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAction::Free => write!(f, "FREE"),
            DeviceAction::Busy => write!(f, "BUSY"),
            DeviceAction::Remove => write!(f, "REMOVE"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub action: DeviceAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateResponse {
    pub updated: bool,
}

/// Returned to the requester once a device is held and its driver is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub device_id: String,
    pub device_name: String,
    pub is_android: bool,
    pub is_real_device: bool,
    pub os_version: String,
    pub host: String,
    pub session_url: String,
    pub logs_url: String,
}
