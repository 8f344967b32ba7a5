use std::collections::BTreeMap;

use crate::ids::{DeviceId, EventId, UserId};
use serde::{Deserialize, Serialize};

/// `m.room.encrypted` content with `m.megolm.v1.aes-sha2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    pub algorithm: String,
    pub ciphertext: String,
    pub session_id: String,
    #[serde(default)]
    pub sender_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// `m.room.message` content with a text body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessageContent {
    pub msgtype: String,
    pub body: String,
}

impl RoomMessageContent {
    pub fn text(body: &str) -> Self {
        Self {
            msgtype: "m.text".into(),
            body: body.to_string(),
        }
    }
}

/// Plaintext of a megolm payload before encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MegolmPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: serde_json::Value,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEventResponse {
    pub event_id: EventId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedMembersResponse {
    #[serde(default)]
    pub joined: BTreeMap<UserId, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveAliasResponse {
    pub room_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn megolm_content_without_deprecated_fields() {
        let json = r#"{"algorithm":"m.megolm.v1.aes-sha2","ciphertext":"AwgA","session_id":"sess"}"#;
        let content: MegolmEncryptedContent = serde_json::from_str(json).unwrap();
        assert_eq!(content.session_id, "sess");
        assert!(content.sender_key.is_empty());
        assert!(content.device_id.is_none());
    }

    #[test]
    fn text_message_content() {
        let content = RoomMessageContent::text("hello");
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["msgtype"], "m.text");
        assert_eq!(json["body"], "hello");
    }
}
