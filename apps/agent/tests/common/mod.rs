//! Mock homeserver and peer devices shared by the integration tests.
#![allow(dead_code)]

use std::path::Path;

use mxagent::config::{AgentConfig, RetryConfig};
use mxagent_crypto::storage::migrations::run_crypto_migrations;
use mxagent_crypto::group::{self, RotationPolicy};
use mxagent_crypto::{devices, identity, prekeys};
use mxagent_shared::api::events::MegolmEncryptedContent;
use mxagent_shared::api::keys::{DeviceKeys, KeysUploadRequest, SignedKey};
use rusqlite::Connection;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const USER: &str = "@agent:hs";
pub const DEVICE: &str = "AGENTDEV";
pub const CLIENT: &str = "/_matrix/client/v3";

pub fn endpoint(rest: &str) -> String {
    format!("{CLIENT}/{rest}")
}

/// A second device with its own in-memory store, driven through the crypto
/// crate directly.
pub struct Peer {
    pub user_id: String,
    pub device_id: String,
    pub conn: Connection,
}

impl Peer {
    pub fn new(user_id: &str, device_id: &str) -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "PRAGMA key = \"x'0000000000000000000000000000000000000000000000000000000000000000'\";",
        )
        .unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        run_crypto_migrations(&conn).unwrap();
        identity::generate_identity(&conn, user_id, device_id).unwrap();
        devices::record_own_device(&conn, 0).unwrap();
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            conn,
        }
    }

    pub fn device_keys(&self, display_name: Option<&str>) -> DeviceKeys {
        let mut keys = identity::device_keys(&self.conn).unwrap();
        keys.unsigned = display_name.map(|name| mxagent_shared::api::keys::UnsignedDeviceInfo {
            device_display_name: Some(name.into()),
        });
        keys
    }

    /// One signed one-time key, as `/keys/claim` would hand it out.
    pub fn claim_one_time_key(&self) -> (String, SignedKey) {
        let key = prekeys::keys_to_upload(&self.conn, 0)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        prekeys::mark_keys_published(&self.conn).unwrap();
        key
    }

    /// A room message under a session nobody else has been given.
    pub fn encrypt_unshared(&self, room_id: &str, body: &str) -> MegolmEncryptedContent {
        group::prepare_outbound(&self.conn, room_id, &[], &RotationPolicy::default(), 0).unwrap();
        group::encrypt_room_event(
            &self.conn,
            room_id,
            &[],
            "m.room.message",
            json!({"msgtype": "m.text", "body": body}),
            0,
        )
        .unwrap()
    }

    pub fn identity(&self) -> identity::OwnIdentity {
        identity::own_identity(&self.conn).unwrap()
    }
}

/// Homeserver accepting the agent's access token and key upload.
pub async fn homeserver() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(endpoint("account/whoami")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": USER,
            "device_id": DEVICE,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoint("keys/upload")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "one_time_key_counts": {"signed_curve25519": 50}
        })))
        .mount(&server)
        .await;
    server
}

pub fn config(server: &MockServer, store: &Path) -> AgentConfig {
    AgentConfig {
        homeserver: server.uri(),
        user_id: USER.into(),
        access_token: Some("syt_agent".into()),
        store_dir: Some(store.to_path_buf()),
        db_key_source: "file".into(),
        lock_timeout_secs: 2,
        operation_timeout_secs: 10,
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..AgentConfig::default()
    }
}

pub async fn mount_device_query(server: &MockServer, devices: &[(&str, DeviceKeys)]) {
    let mut by_user = serde_json::Map::new();
    for (user, keys) in devices {
        let entry = by_user
            .entry(user.to_string())
            .or_insert_with(|| json!({}));
        entry[keys.device_id.as_str()] = serde_json::to_value(keys).unwrap();
    }
    Mock::given(method("POST"))
        .and(path(endpoint("keys/query")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "device_keys": by_user })))
        .mount(server)
        .await;
}

pub async fn mount_empty_sync(server: &MockServer, next_batch: &str) {
    Mock::given(method("GET"))
        .and(path(endpoint("sync")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "next_batch": next_batch })))
        .mount(server)
        .await;
}

/// Bodies of every request the server received on `path`.
pub async fn request_bodies(server: &MockServer, prefix: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path().starts_with(prefix))
        .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
        .collect()
}

/// Serve `events` (newest first) from `/rooms/{room}/messages`.
pub async fn mount_messages(server: &MockServer, room_id: &str, events: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(endpoint(&format!("rooms/{room_id}/messages"))))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "chunk": events })))
        .mount(server)
        .await;
}

/// An `m.room.encrypted` timeline event from `sender`.
pub fn encrypted_event(event_id: &str, sender: &str, ts: u64, content: &MegolmEncryptedContent) -> Value {
    json!({
        "event_id": event_id,
        "type": "m.room.encrypted",
        "sender": sender,
        "origin_server_ts": ts,
        "content": serde_json::to_value(content).unwrap(),
    })
}

/// The agent's device keys, taken from its upload.
pub async fn uploaded_device_keys(server: &MockServer) -> DeviceKeys {
    request_bodies(server, &endpoint("keys/upload"))
        .await
        .into_iter()
        .filter_map(|body| serde_json::from_value::<KeysUploadRequest>(body).ok())
        .find_map(|req| req.device_keys)
        .unwrap()
}

/// One of the agent's uploaded one-time keys.
pub async fn uploaded_one_time_key(server: &MockServer) -> SignedKey {
    request_bodies(server, &endpoint("keys/upload"))
        .await
        .into_iter()
        .filter_map(|body| serde_json::from_value::<KeysUploadRequest>(body).ok())
        .find_map(|req| req.one_time_keys.into_values().next())
        .unwrap()
}
