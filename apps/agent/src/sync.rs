//! Long-poll `/sync` loop.
//!
//! A response is flattened into a [`SyncBatch`] and handed to the
//! [`CryptoManager`], which applies it and stores the new cursor in one
//! transaction. A crash before that commit replays the same batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mxagent_shared::api::sync::{DeviceLists, RoomEvent, SyncResponse, ToDeviceEvent};
use mxagent_shared::error::MxError;
use tokio::time::Instant;

use crate::http::MatrixApi;
use crate::manager::{BatchOutcome, CryptoManager};
use crate::retry::RetryPolicy;

/// Long-poll timeout and overall bound of the first sync of a store.
pub const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RoomEventEnvelope {
    pub room_id: String,
    pub event: RoomEvent,
}

/// The parts of one sync response the crypto layer consumes.
#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    pub next_batch: String,
    pub room_events: Vec<RoomEventEnvelope>,
    pub to_device_events: Vec<ToDeviceEvent>,
    pub device_list_changes: DeviceLists,
    pub one_time_key_counts: BTreeMap<String, u64>,
    /// (room, user) for members that joined or were invited.
    pub joined_members: Vec<(String, String)>,
    /// (room, user) for members that left or were banned.
    pub left_members: Vec<(String, String)>,
    /// Rooms we left ourselves.
    pub left_rooms: Vec<String>,
}

fn member_change(event: &RoomEvent) -> Option<(&str, &str)> {
    let membership = event.membership()?;
    let user = event.state_key.as_deref()?;
    Some((membership, user))
}

impl From<SyncResponse> for SyncBatch {
    fn from(resp: SyncResponse) -> Self {
        let mut batch = SyncBatch {
            next_batch: resp.next_batch,
            to_device_events: resp.to_device.events,
            device_list_changes: resp.device_lists,
            one_time_key_counts: resp.device_one_time_keys_count,
            ..SyncBatch::default()
        };

        for (room_id, room) in resp.rooms.join {
            let room_id = room_id.to_string();
            for event in room.state.events.iter().chain(room.timeline.events.iter()) {
                match member_change(event) {
                    Some(("join" | "invite", user)) => {
                        batch.joined_members.push((room_id.clone(), user.to_string()));
                    }
                    Some(("leave" | "ban", user)) => {
                        batch.left_members.push((room_id.clone(), user.to_string()));
                    }
                    _ => {}
                }
            }
            batch
                .room_events
                .extend(room.timeline.events.into_iter().map(|event| RoomEventEnvelope {
                    room_id: room_id.clone(),
                    event,
                }));
        }
        batch.left_rooms = resp.rooms.leave.into_keys().map(|r| r.to_string()).collect();
        batch
    }
}

pub struct SyncEngine {
    api: Arc<dyn MatrixApi>,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn MatrixApi>, retry: RetryPolicy, operation_timeout: Duration) -> Self {
        Self {
            api,
            retry,
            operation_timeout,
        }
    }

    /// One `/sync` call from `cursor`, retried on transient failures and
    /// bounded by the operation timeout.
    pub async fn sync(&self, cursor: Option<&str>, timeout: Duration) -> Result<SyncBatch, MxError> {
        self.sync_bounded(cursor, timeout, self.operation_timeout).await
    }

    async fn sync_bounded(
        &self,
        cursor: Option<&str>,
        timeout: Duration,
        bound: Duration,
    ) -> Result<SyncBatch, MxError> {
        let call = self.retry.run("sync", || self.api.sync(cursor, timeout));
        let resp = tokio::time::timeout(bound, call)
            .await
            .map_err(|_| MxError::Timeout(format!("sync did not finish within {}s", bound.as_secs())))??;
        Ok(SyncBatch::from(resp))
    }

    /// Sync once from the persisted cursor and apply the batch.
    ///
    /// A store without a cursor does an initial sync: no long-poll, a wider
    /// bound, and a device list query for every tracked user.
    pub async fn sync_once(&self, manager: &CryptoManager, timeout: Duration) -> Result<BatchOutcome, MxError> {
        let cursor = manager.sync_token()?;
        let initial = cursor.is_none();
        let batch = if initial {
            tracing::info!("initial sync");
            self.sync_bounded(None, Duration::ZERO, self.operation_timeout.max(INITIAL_SYNC_TIMEOUT))
                .await?
        } else {
            self.sync(cursor.as_deref(), timeout).await?
        };
        tracing::debug!(
            since = cursor.as_deref().unwrap_or("-"),
            next_batch = %batch.next_batch,
            room_events = batch.room_events.len(),
            to_device = batch.to_device_events.len(),
            "sync response"
        );
        manager.apply_batch(&batch, initial).await
    }

    /// Sync repeatedly until `done` holds for a batch or `deadline` passes.
    /// Returns whether `done` was satisfied.
    pub async fn sync_until<F>(
        &self,
        manager: &CryptoManager,
        deadline: Instant,
        poll: Duration,
        mut done: F,
    ) -> Result<bool, MxError>
    where
        F: FnMut(&BatchOutcome) -> Result<bool, MxError>,
    {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let outcome = self.sync_once(manager, poll.min(deadline - now)).await?;
            if done(&outcome)? {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> SyncResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn batch_collects_membership_changes() {
        let batch = SyncBatch::from(response(serde_json::json!({
            "next_batch": "s9",
            "rooms": {
                "join": {"!r:hs": {
                    "state": {"events": [
                        {"event_id": "$1", "type": "m.room.member", "sender": "@carol:hs",
                         "state_key": "@carol:hs", "content": {"membership": "join"}}
                    ]},
                    "timeline": {"events": [
                        {"event_id": "$2", "type": "m.room.member", "sender": "@bob:hs",
                         "state_key": "@bob:hs", "content": {"membership": "leave"}},
                        {"event_id": "$3", "type": "m.room.encrypted", "sender": "@carol:hs",
                         "content": {"algorithm": "m.megolm.v1.aes-sha2"}}
                    ]}
                }},
                "leave": {"!gone:hs": {}}
            }
        })));

        assert_eq!(batch.next_batch, "s9");
        assert_eq!(batch.joined_members, vec![("!r:hs".to_string(), "@carol:hs".to_string())]);
        assert_eq!(batch.left_members, vec![("!r:hs".to_string(), "@bob:hs".to_string())]);
        assert_eq!(batch.left_rooms, vec!["!gone:hs".to_string()]);
        assert_eq!(batch.room_events.len(), 2);
        assert_eq!(batch.room_events[1].event.event_id.as_str(), "$3");
    }

    #[test]
    fn batch_keeps_to_device_and_key_counts() {
        let batch = SyncBatch::from(response(serde_json::json!({
            "next_batch": "s2",
            "to_device": {"events": [{"type": "m.dummy", "sender": "@bob:hs", "content": {}}]},
            "device_lists": {"changed": ["@bob:hs"], "left": ["@eve:hs"]},
            "device_one_time_keys_count": {"signed_curve25519": 3}
        })));
        assert_eq!(batch.to_device_events.len(), 1);
        assert_eq!(batch.device_list_changes.changed[0].as_str(), "@bob:hs");
        assert_eq!(batch.device_list_changes.left[0].as_str(), "@eve:hs");
        assert_eq!(batch.one_time_key_counts["signed_curve25519"], 3);
    }

    #[test]
    fn non_member_state_is_ignored() {
        let batch = SyncBatch::from(response(serde_json::json!({
            "next_batch": "s3",
            "rooms": {"join": {"!r:hs": {"state": {"events": [
                {"event_id": "$e", "type": "m.room.encryption", "sender": "@a:hs",
                 "state_key": "", "content": {"algorithm": "m.megolm.v1.aes-sha2"}}
            ]}}}}
        })));
        assert!(batch.joined_members.is_empty());
        assert!(batch.left_members.is_empty());
    }
}
