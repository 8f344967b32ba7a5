use std::collections::BTreeMap;

use crate::ids::{EventId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// `GET /sync` response, limited to the sections the agent consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(default)]
    pub to_device: ToDevice,
    #[serde(default)]
    pub device_lists: DeviceLists,
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<RoomId, JoinedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<RoomId, LeftRoom>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub state: StateEvents,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeftRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateEvents {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

/// A timeline or state event. Content stays untyped until the event type is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: UserId,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
}

impl RoomEvent {
    /// Membership value for `m.room.member` events.
    pub fn membership(&self) -> Option<&str> {
        if self.event_type != crate::constants::EVENT_ROOM_MEMBER {
            return None;
        }
        self.content.get("membership").and_then(|m| m.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToDevice {
    #[serde(default)]
    pub events: Vec<ToDeviceEvent>,
}

/// Event delivered over the to-device channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToDeviceEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: UserId,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<UserId>,
    #[serde(default)]
    pub left: Vec<UserId>,
}

/// `GET /rooms/{roomId}/messages` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<RoomEvent>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}
