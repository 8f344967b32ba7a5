use crate::ids::DeviceId;
use serde::{Deserialize, Serialize};

/// Entry of `GET /devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub last_seen_ip: Option<String>,
    #[serde(default)]
    pub last_seen_ts: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesResponse {
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}
