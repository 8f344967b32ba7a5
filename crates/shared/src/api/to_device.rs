use std::collections::BTreeMap;

use crate::ids::{DeviceId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// `PUT /sendToDevice/{eventType}/{txnId}` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendToDeviceRequest {
    pub messages: BTreeMap<UserId, BTreeMap<DeviceId, serde_json::Value>>,
}

impl SendToDeviceRequest {
    pub fn single(user: &UserId, device: &DeviceId, content: serde_json::Value) -> Self {
        let mut req = Self::default();
        req.insert(user, device, content);
        req
    }

    pub fn insert(&mut self, user: &UserId, device: &DeviceId, content: serde_json::Value) {
        self.messages
            .entry(user.clone())
            .or_default()
            .insert(device.clone(), content);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.values().all(BTreeMap::is_empty)
    }
}

/// One Olm ciphertext addressed to a curve25519 key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// 0 for pre-key messages, 1 for normal messages.
    #[serde(rename = "type")]
    pub message_type: usize,
    pub body: String,
}

/// `m.room.encrypted` content with `m.olm.v1.curve25519-aes-sha2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    pub algorithm: String,
    pub sender_key: String,
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ed25519Keys {
    pub ed25519: String,
}

/// Decrypted Olm plaintext envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: serde_json::Value,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<DeviceId>,
    pub recipient: UserId,
    pub recipient_keys: Ed25519Keys,
    pub keys: Ed25519Keys,
}

/// `m.room_key` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: RoomId,
    pub session_id: String,
    pub session_key: String,
}

/// `m.forwarded_room_key` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    pub algorithm: String,
    pub room_id: RoomId,
    pub sender_key: String,
    pub session_id: String,
    pub session_key: String,
    #[serde(default)]
    pub sender_claimed_ed25519_key: String,
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    pub algorithm: String,
    pub room_id: RoomId,
    #[serde(default)]
    pub sender_key: String,
    pub session_id: String,
}

/// `m.room_key_request` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// `request` or `request_cancellation`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    pub request_id: String,
    pub requesting_device_id: DeviceId,
}

impl RoomKeyRequestContent {
    pub fn is_cancellation(&self) -> bool {
        self.action == "request_cancellation"
    }
}
