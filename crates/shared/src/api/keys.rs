use std::collections::BTreeMap;

use crate::ids::{DeviceId, UserId};
use serde::{Deserialize, Serialize};

/// `user_id -> key_id -> signature`
pub type Signatures = BTreeMap<String, BTreeMap<String, String>>;

/// Published identity keys of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub algorithms: Vec<String>,
    /// `"curve25519:<device>"` and `"ed25519:<device>"` to base64 keys.
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: Signatures,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<UnsignedDeviceInfo>,
}

impl DeviceKeys {
    pub fn curve25519(&self) -> Option<&str> {
        self.keys
            .get(&format!("curve25519:{}", self.device_id))
            .map(String::as_str)
    }

    pub fn ed25519(&self) -> Option<&str> {
        self.keys
            .get(&format!("ed25519:{}", self.device_id))
            .map(String::as_str)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.unsigned
            .as_ref()
            .and_then(|u| u.device_display_name.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

/// A signed one-time or fallback key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedKey {
    pub key: String,
    #[serde(default)]
    pub signatures: Signatures,
}

/// `POST /keys/upload` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// `POST /keys/query` body. An empty device list means all devices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    pub device_keys: BTreeMap<UserId, Vec<DeviceId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
    #[serde(default)]
    pub failures: BTreeMap<String, serde_json::Value>,
}

/// `POST /keys/claim` body: `user -> device -> algorithm`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// `user -> device -> "signed_curve25519:<id>" -> key`
    #[serde(default)]
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<String, SignedKey>>>,
    #[serde(default)]
    pub failures: BTreeMap<String, serde_json::Value>,
}
