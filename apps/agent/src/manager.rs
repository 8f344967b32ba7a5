//! Crypto session manager: the network-facing side of the crypto crate.
//!
//! Owns the crypto store connection and a handle to the homeserver. Sync
//! batches are applied in one transaction (cursor included); the network
//! work they trigger (key uploads, device queries, key forwarding) runs
//! after the commit. The connection lock is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mxagent_crypto::devices;
use mxagent_crypto::error::CryptoError;
use mxagent_crypto::group::{
    self, DecryptedRoomEvent, IngestOutcome, KeyOrigin, RoomDecryption, RoomKeyMaterial, RotationPolicy,
};
use mxagent_crypto::identity::{self, OwnIdentity};
use mxagent_crypto::message;
use mxagent_crypto::prekeys::{self, SIGNED_CURVE25519};
use mxagent_crypto::session;
use mxagent_crypto::storage::device_store::DeviceRecord;
use mxagent_crypto::storage::gap_store::PendingGap;
use mxagent_crypto::storage::{with_transaction, CryptoStore};
use mxagent_crypto::trust::{self, TrustPolicy, TrustState};
use mxagent_shared::api::events::{MegolmEncryptedContent, RoomMessageContent};
use mxagent_shared::api::keys::{KeysClaimRequest, KeysQueryRequest, KeysUploadRequest};
use mxagent_shared::api::sync::RoomEvent;
use mxagent_shared::api::to_device::{
    ForwardedRoomKeyContent, OlmEncryptedContent, RequestedKeyInfo, RoomKeyContent,
    RoomKeyRequestContent, SendToDeviceRequest,
};
use mxagent_shared::api::verification::VerificationEvent;
use mxagent_shared::constants::{
    EVENT_DUMMY, EVENT_FORWARDED_ROOM_KEY, EVENT_ROOM_ENCRYPTED, EVENT_ROOM_KEY,
    EVENT_ROOM_KEY_REQUEST, EVENT_ROOM_MESSAGE, MEGOLM_ALGORITHM, UNABLE_TO_DECRYPT,
};
use mxagent_shared::error::MxError;
use mxagent_shared::ids::{DeviceId, TransactionId, UserId};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};

use crate::http::MatrixApi;
use crate::retry::RetryPolicy;
use crate::sync::SyncBatch;

const QUERY_TIMEOUT_MS: u64 = 10_000;
const KEY_REQUEST_SENT: &str = "sent";
const KEY_REQUEST_FULFILLED: &str = "fulfilled";
const KEY_REQUEST_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub trust_policy: TrustPolicy,
    pub rotation: RotationPolicy,
    pub retry: RetryPolicy,
}

/// What applying one sync batch changed.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub next_batch: String,
    pub to_device_decrypted: usize,
    /// (room, session) pairs whose inbound session was installed or improved.
    pub keys_ingested: Vec<(String, String)>,
    /// Verification events in arrival order, with their sender.
    pub verification_events: Vec<(String, VerificationEvent)>,
    pub new_devices: usize,
    pub key_requests_answered: usize,
}

/// Work produced while the batch transaction is open, run after commit.
#[derive(Default)]
struct StagedFollowUps {
    key_requests: Vec<(String, RoomKeyRequestContent)>,
    wedged_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Plaintext,
    Decrypted,
    Undecryptable { session_id: String },
}

/// One timeline message as shown by `read`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineMessage {
    pub event_id: String,
    pub sender: String,
    pub origin_server_ts: i64,
    pub body: String,
    pub status: MessageStatus,
}

/// Result of a round of `m.room_key_request`s.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeyRequestRound {
    pub request_ids: Vec<String>,
    pub target_devices: usize,
}

pub struct CryptoManager {
    conn: Mutex<Connection>,
    api: Arc<dyn MatrixApi>,
    identity: OwnIdentity,
    settings: ManagerSettings,
}

impl std::fmt::Debug for CryptoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoManager")
            .field("user_id", &self.identity.user_id)
            .field("device_id", &self.identity.device_id)
            .field("settings", &self.settings)
            .finish()
    }
}

impl CryptoManager {
    /// Wrap a store that already holds a device identity.
    pub fn new(
        conn: Connection,
        api: Arc<dyn MatrixApi>,
        settings: ManagerSettings,
    ) -> Result<Self, MxError> {
        let identity = identity::own_identity(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            api,
            identity,
            settings,
        })
    }

    pub fn identity(&self) -> &OwnIdentity {
        &self.identity
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn api(&self) -> &Arc<dyn MatrixApi> {
        &self.api
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MxError> {
        self.conn
            .lock()
            .map_err(|e| MxError::Storage(format!("crypto store lock poisoned: {e}")))
    }

    /// Run synchronous store work under the connection lock.
    pub fn with_store<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CryptoError>,
    ) -> Result<T, MxError> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    pub fn sync_token(&self) -> Result<Option<String>, MxError> {
        self.with_store(|conn| CryptoStore::new(conn).sync_token())
    }

    pub fn pending_gaps(&self) -> Result<Vec<PendingGap>, MxError> {
        self.with_store(|conn| CryptoStore::new(conn).pending_gaps())
    }

    pub fn gaps_for_room(&self, room_id: &str) -> Result<Vec<PendingGap>, MxError> {
        self.with_store(|conn| CryptoStore::new(conn).gaps_for_room(room_id))
    }

    pub fn device(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceRecord>, MxError> {
        self.with_store(|conn| CryptoStore::new(conn).get_device(user_id, device_id))
    }

    pub fn devices_of(&self, user_id: &str) -> Result<Vec<DeviceRecord>, MxError> {
        self.with_store(|conn| devices::list_devices(conn, user_id))
    }

    /// Force a fresh device query for `user_id` on the next refresh.
    pub fn invalidate_devices(&self, user_id: &str) -> Result<(), MxError> {
        self.with_store(|conn| {
            let store = CryptoStore::new(conn);
            store.track_user(user_id)?;
            store.mark_user_dirty(user_id)
        })
    }

    pub fn mark_device_verified(&self, user_id: &str, device_id: &str) -> Result<(), MxError> {
        self.with_store(|conn| trust::verify_device(conn, user_id, device_id))
    }

    /// Replace any old cursor so the next sync starts from scratch.
    pub fn reset_sync_token(&self) -> Result<(), MxError> {
        self.with_store(|conn| {
            conn.execute("DELETE FROM crypto_sync_state", [])?;
            Ok(())
        })
    }

    // -- Sync batches -------------------------------------------------------

    /// Apply a sync batch and persist its cursor in the same transaction.
    ///
    /// `initial` marks the first sync of this store: every tracked user is
    /// queried again so the device list is complete.
    pub async fn apply_batch(&self, batch: &SyncBatch, initial: bool) -> Result<BatchOutcome, MxError> {
        let (mut outcome, follow_ups) = self.with_store(|conn| {
            with_transaction(conn, |store| self.stage_batch(conn, store, batch, initial))
        })?;
        tracing::debug!(
            next_batch = %outcome.next_batch,
            to_device = outcome.to_device_decrypted,
            keys = outcome.keys_ingested.len(),
            verification = outcome.verification_events.len(),
            "sync batch applied"
        );

        if !batch.one_time_key_counts.is_empty() {
            self.replenish_one_time_keys(prekeys::signed_key_count(&batch.one_time_key_counts))
                .await?;
        }
        outcome.new_devices = self.refresh_device_lists().await?;

        for peer_key in follow_ups.wedged_peers {
            if let Err(e) = self.unwedge(&peer_key).await {
                tracing::warn!(peer_key = %peer_key, error = %e, "could not re-establish olm session");
            }
        }
        for (sender, request) in follow_ups.key_requests {
            match self.answer_key_request(&sender, &request).await {
                Ok(true) => outcome.key_requests_answered += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(request_id = %request.request_id, error = %e, "key request not answered"),
            }
        }
        Ok(outcome)
    }

    fn stage_batch(
        &self,
        conn: &Connection,
        store: &CryptoStore<'_>,
        batch: &SyncBatch,
        initial: bool,
    ) -> Result<(BatchOutcome, StagedFollowUps), CryptoError> {
        let mut outcome = BatchOutcome {
            next_batch: batch.next_batch.clone(),
            ..BatchOutcome::default()
        };
        let mut follow_ups = StagedFollowUps::default();

        let changed: Vec<String> = batch.device_list_changes.changed.iter().map(|u| u.to_string()).collect();
        let left: Vec<String> = batch.device_list_changes.left.iter().map(|u| u.to_string()).collect();
        devices::apply_device_list_changes(conn, &changed, &left)?;

        let joined: Vec<String> = batch.joined_members.iter().map(|(_, user)| user.clone()).collect();
        devices::track_users(conn, &joined)?;
        for (room_id, user_id) in &batch.left_members {
            if group::rooms_shared_with(conn, user_id)?.contains(room_id) {
                tracing::info!(room_id = %room_id, user_id = %user_id, "member left, discarding room session");
                group::discard_outbound(conn, room_id)?;
            }
        }
        for room_id in &batch.left_rooms {
            group::discard_outbound(conn, room_id)?;
        }
        if initial {
            for user in store.tracked_users()? {
                store.mark_user_dirty(&user)?;
            }
        }

        for event in &batch.to_device_events {
            let sender = event.sender.as_str();
            match event.event_type.as_str() {
                EVENT_ROOM_ENCRYPTED => {
                    let content: OlmEncryptedContent = match serde_json::from_value(event.content.clone()) {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::warn!(sender, error = %e, "malformed encrypted to-device event");
                            continue;
                        }
                    };
                    // A failing event rolls back alone; the rest of the batch still applies.
                    let result = with_transaction(conn, |_| {
                        self.handle_olm_event(conn, sender, &content, &mut outcome)
                    });
                    match result {
                        Ok(()) => {}
                        Err(CryptoError::SessionCorrupted { peer_key, detail }) => {
                            tracing::warn!(sender, peer_key = %peer_key, detail = %detail, "olm session wedged");
                            session::recover_session(conn, &peer_key)?;
                            follow_ups.wedged_peers.push(peer_key);
                        }
                        Err(e) => tracing::warn!(sender, error = %e, "dropping undecryptable to-device event"),
                    }
                }
                EVENT_ROOM_KEY_REQUEST => {
                    if sender != self.identity.user_id {
                        continue;
                    }
                    match serde_json::from_value::<RoomKeyRequestContent>(event.content.clone()) {
                        Ok(request) => follow_ups.key_requests.push((sender.to_string(), request)),
                        Err(e) => tracing::debug!(error = %e, "malformed room key request"),
                    }
                }
                other => match VerificationEvent::parse(other, &event.content) {
                    Some(Ok(parsed)) => outcome.verification_events.push((sender.to_string(), parsed)),
                    Some(Err(e)) => tracing::warn!(sender, event_type = other, error = %e, "malformed verification event"),
                    None => tracing::debug!(sender, event_type = other, "ignoring to-device event"),
                },
            }
        }

        store.set_sync_token(&batch.next_batch)?;
        Ok((outcome, follow_ups))
    }

    fn handle_olm_event(
        &self,
        conn: &Connection,
        sender: &str,
        content: &OlmEncryptedContent,
        outcome: &mut BatchOutcome,
    ) -> Result<(), CryptoError> {
        let decrypted = message::decrypt_to_device(conn, sender, content)?;
        outcome.to_device_decrypted += 1;

        match decrypted.event_type.as_str() {
            EVENT_ROOM_KEY => {
                let key: RoomKeyContent = serde_json::from_value(decrypted.content)?;
                if key.algorithm != MEGOLM_ALGORITHM {
                    tracing::debug!(algorithm = %key.algorithm, "ignoring room key");
                    return Ok(());
                }
                let result = group::ingest_room_key(
                    conn,
                    key.room_id.as_str(),
                    &key.session_id,
                    &decrypted.sender_key,
                    RoomKeyMaterial::Session(&key.session_key),
                    KeyOrigin::RoomKey,
                )?;
                if result != IngestOutcome::Unchanged {
                    outcome.keys_ingested.push((key.room_id.to_string(), key.session_id));
                }
            }
            EVENT_FORWARDED_ROOM_KEY => {
                if !self.is_own_verified_device(conn, sender, &decrypted.sender_key)? {
                    tracing::warn!(sender, sender_key = %decrypted.sender_key, "ignoring forwarded key from unverified device");
                    return Ok(());
                }
                let key: ForwardedRoomKeyContent = serde_json::from_value(decrypted.content)?;
                let room_id = key.room_id.as_str();
                let result = group::ingest_room_key(
                    conn,
                    room_id,
                    &key.session_id,
                    &key.sender_key,
                    RoomKeyMaterial::Exported(&key.session_key),
                    KeyOrigin::Forwarded,
                )?;
                let store = CryptoStore::new(conn);
                if let Some(request) = store.open_key_request(room_id, &key.session_id)? {
                    store.set_key_request_state(&request.request_id, KEY_REQUEST_FULFILLED)?;
                }
                if result != IngestOutcome::Unchanged {
                    tracing::info!(room_id, session_id = %key.session_id, "forwarded room key installed");
                    outcome.keys_ingested.push((room_id.to_string(), key.session_id));
                }
            }
            EVENT_DUMMY => {}
            other => match VerificationEvent::parse(other, &decrypted.content) {
                Some(Ok(parsed)) => outcome.verification_events.push((sender.to_string(), parsed)),
                Some(Err(e)) => return Err(CryptoError::SerializationError(e.to_string())),
                None => tracing::debug!(event_type = other, "ignoring decrypted to-device event"),
            },
        }
        Ok(())
    }

    fn is_own_verified_device(
        &self,
        conn: &Connection,
        sender: &str,
        sender_key: &str,
    ) -> Result<bool, CryptoError> {
        if sender != self.identity.user_id {
            return Ok(false);
        }
        Ok(CryptoStore::new(conn)
            .device_by_curve_key(sender_key)?
            .is_some_and(|d| {
                d.user_id == self.identity.user_id
                    && d.device_id != self.identity.device_id
                    && d.trust == TrustState::Verified
                    && !d.deleted
            }))
    }

    // -- Keys -----------------------------------------------------------------

    /// Upload the signed device keys and an initial batch of one-time keys
    /// if that has not happened for this device yet.
    pub async fn ensure_device_keys_uploaded(&self) -> Result<(), MxError> {
        let pending = self.with_store(|conn| {
            if identity::device_keys_uploaded(conn)? {
                return Ok(None);
            }
            let device_keys = identity::device_keys(conn)?;
            let one_time_keys = prekeys::keys_to_upload(conn, 0)?;
            Ok(Some(KeysUploadRequest {
                device_keys: Some(device_keys),
                one_time_keys,
            }))
        })?;
        let Some(request) = pending else {
            return Ok(());
        };

        let response = self
            .settings
            .retry
            .run("keys/upload", || self.api.upload_keys(&request))
            .await?;
        self.with_store(|conn| {
            with_transaction(conn, |_| {
                identity::mark_device_keys_uploaded(conn)?;
                prekeys::mark_keys_published(conn)
            })
        })?;
        tracing::info!(
            one_time_keys = request.one_time_keys.len(),
            server_count = prekeys::signed_key_count(&response.one_time_key_counts),
            "device keys uploaded"
        );
        Ok(())
    }

    /// Top up the server's one-time keys when it holds fewer than half the
    /// account maximum.
    pub async fn replenish_one_time_keys(&self, server_count: u64) -> Result<usize, MxError> {
        let keys = self.with_store(|conn| prekeys::keys_to_upload(conn, server_count))?;
        if keys.is_empty() {
            return Ok(0);
        }
        let request = KeysUploadRequest {
            device_keys: None,
            one_time_keys: keys,
        };
        self.settings
            .retry
            .run("keys/upload", || self.api.upload_keys(&request))
            .await?;
        self.with_store(prekeys::mark_keys_published)?;
        tracing::info!(server_count, uploaded = request.one_time_keys.len(), "one-time keys replenished");
        Ok(request.one_time_keys.len())
    }

    /// Query device keys for every tracked user whose list may have changed.
    /// Returns the number of devices seen for the first time.
    pub async fn refresh_device_lists(&self) -> Result<usize, MxError> {
        let users = self.with_store(devices::users_needing_query)?;
        if users.is_empty() {
            return Ok(0);
        }
        let request = KeysQueryRequest {
            device_keys: users.iter().map(|u| (UserId::from(u.as_str()), Vec::new())).collect(),
            timeout: Some(QUERY_TIMEOUT_MS),
        };
        let response = self
            .settings
            .retry
            .run("keys/query", || self.api.query_keys(&request))
            .await?;
        if !response.failures.is_empty() {
            tracing::warn!(servers = ?response.failures.keys().collect::<Vec<_>>(), "device query failed for some servers");
        }

        let now = crate::now_secs();
        self.with_store(|conn| {
            let mut new_devices = 0;
            for (user_id, keys) in &response.device_keys {
                let update = devices::ingest_device_keys(conn, user_id.as_str(), keys, now)?;
                new_devices += update.new_devices.len();
            }
            Ok(new_devices)
        })
    }

    /// Make sure each device has an Olm session, claiming one-time keys for
    /// those that lack one. Returns the devices that have a session afterwards.
    pub async fn ensure_olm_sessions(&self, targets: &[DeviceRecord]) -> Result<Vec<DeviceRecord>, MxError> {
        let missing = self.with_store(|conn| {
            let mut missing = Vec::new();
            for device in targets {
                if !session::has_session(conn, &device.curve25519_key)? {
                    missing.push(device.clone());
                }
            }
            Ok(missing)
        })?;

        if !missing.is_empty() {
            let mut request = KeysClaimRequest {
                timeout: Some(QUERY_TIMEOUT_MS),
                ..KeysClaimRequest::default()
            };
            for device in &missing {
                request
                    .one_time_keys
                    .entry(UserId::from(device.user_id.as_str()))
                    .or_default()
                    .insert(DeviceId::from(device.device_id.as_str()), SIGNED_CURVE25519.to_string());
            }
            let response = self
                .settings
                .retry
                .run("keys/claim", || self.api.claim_keys(&request))
                .await?;

            self.with_store(|conn| {
                for device in &missing {
                    let claimed = response
                        .one_time_keys
                        .get(&UserId::from(device.user_id.as_str()))
                        .and_then(|by_device| by_device.get(&DeviceId::from(device.device_id.as_str())))
                        .and_then(|keys| keys.values().next());
                    let Some(key) = claimed else {
                        tracing::warn!(device = %device.label(), "no one-time key available, skipping device");
                        continue;
                    };
                    if let Err(e) = session::establish_from_claim(conn, device, key) {
                        tracing::warn!(device = %device.label(), error = %e, "rejected claimed one-time key");
                    }
                }
                Ok(())
            })?;
        }

        self.with_store(|conn| {
            let mut reachable = Vec::new();
            for device in targets {
                if session::has_session(conn, &device.curve25519_key)? {
                    reachable.push(device.clone());
                }
            }
            Ok(reachable)
        })
    }

    /// PUT one to-device batch; retries reuse the transaction id.
    pub async fn send_to_device(&self, event_type: &str, request: &SendToDeviceRequest) -> Result<(), MxError> {
        if request.is_empty() {
            return Ok(());
        }
        let txn_id = TransactionId::new();
        self.settings
            .retry
            .run("sendToDevice", || self.api.send_to_device(event_type, txn_id.as_str(), request))
            .await
    }

    async fn send_olm(&self, messages: Vec<(DeviceRecord, OlmEncryptedContent)>) -> Result<(), MxError> {
        let mut request = SendToDeviceRequest::default();
        for (device, content) in messages {
            request.insert(
                &UserId::from(device.user_id.as_str()),
                &DeviceId::from(device.device_id.as_str()),
                serde_json::to_value(content)?,
            );
        }
        self.send_to_device(EVENT_ROOM_ENCRYPTED, &request).await
    }

    /// Olm-encrypt one event for `device` and send it.
    pub async fn send_encrypted_to_device(
        &self,
        device: &DeviceRecord,
        event_type: &str,
        content: Value,
    ) -> Result<(), MxError> {
        if self.ensure_olm_sessions(std::slice::from_ref(device)).await?.is_empty() {
            return Err(MxError::NoSessionEstablished {
                missing: vec![device.label()],
            });
        }
        let encrypted = self.with_store(|conn| message::encrypt_to_device(conn, device, event_type, content))?;
        self.send_olm(vec![(device.clone(), encrypted)]).await
    }

    async fn unwedge(&self, peer_key: &str) -> Result<(), MxError> {
        let device = self.with_store(|conn| CryptoStore::new(conn).device_by_curve_key(peer_key))?;
        let Some(device) = device else {
            tracing::debug!(peer_key, "wedged session with unknown device");
            return Ok(());
        };
        self.send_encrypted_to_device(&device, EVENT_DUMMY, json!({})).await?;
        tracing::info!(device = %device.label(), "sent m.dummy on a fresh olm session");
        Ok(())
    }

    /// Forward a room key to one of our own verified devices that asked for it.
    async fn answer_key_request(&self, sender: &str, request: &RoomKeyRequestContent) -> Result<bool, MxError> {
        if request.is_cancellation() || request.requesting_device_id.as_str() == self.identity.device_id {
            return Ok(false);
        }
        let Some(body) = &request.body else {
            return Ok(false);
        };
        let device = self.device(sender, request.requesting_device_id.as_str())?;
        let device = match device {
            Some(d) if d.trust == TrustState::Verified && !d.deleted => d,
            _ => {
                tracing::debug!(sender, device_id = %request.requesting_device_id, "ignoring key request from unverified device");
                return Ok(false);
            }
        };
        let content = self.with_store(|conn| {
            group::forwarded_key_content(conn, body.room_id.as_str(), &body.session_id)
        })?;
        let Some(content) = content else {
            return Ok(false);
        };
        self.send_encrypted_to_device(&device, EVENT_FORWARDED_ROOM_KEY, serde_json::to_value(&content)?)
            .await?;
        tracing::info!(device = %device.label(), room_id = %body.room_id, session_id = %body.session_id, "forwarded room key");
        Ok(true)
    }

    // -- Rooms ----------------------------------------------------------------

    /// Room id for an id or `#alias:server`.
    pub async fn resolve_room(&self, room: &str) -> Result<String, MxError> {
        if !room.starts_with('#') {
            return Ok(room.to_string());
        }
        let resolved = self
            .settings
            .retry
            .run("resolve alias", || self.api.resolve_alias(room))
            .await?;
        Ok(resolved.room_id)
    }

    async fn room_recipients(&self, room_id: &str) -> Result<Vec<DeviceRecord>, MxError> {
        let members = self
            .settings
            .retry
            .run("joined members", || self.api.joined_members(room_id))
            .await?;
        let users: Vec<String> = members.joined.keys().map(|u| u.to_string()).collect();
        self.with_store(|conn| devices::track_users(conn, &users))?;
        self.refresh_device_lists().await?;
        self.with_store(|conn| devices::recipient_devices(conn, &users, self.settings.trust_policy))
    }

    /// Share the room's current session with the `unshared` devices that can
    /// be reached. Returns the devices that could not.
    async fn share_session(
        &self,
        room_id: &str,
        session_id: &str,
        unshared: &[DeviceRecord],
        already_shared: usize,
    ) -> Result<Vec<DeviceRecord>, MxError> {
        let reachable = self.ensure_olm_sessions(unshared).await?;
        let unreachable: Vec<DeviceRecord> = unshared
            .iter()
            .filter(|d| !reachable.contains(d))
            .cloned()
            .collect();
        if reachable.is_empty() && already_shared == 0 {
            return Err(MxError::NoSessionEstablished {
                missing: unreachable.iter().map(DeviceRecord::label).collect(),
            });
        }
        if !reachable.is_empty() {
            let messages = self.with_store(|conn| group::share_room_key(conn, room_id, &reachable))?;
            self.send_olm(messages).await?;
            self.with_store(|conn| group::mark_shared(conn, room_id, session_id, &reachable))?;
            tracing::info!(room_id, session_id, devices = reachable.len(), "room key shared");
        }
        Ok(unreachable)
    }

    /// Megolm-encrypt an event for `room_id`, sharing the room key with any
    /// recipient device that does not hold it yet.
    pub async fn encrypt(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<MegolmEncryptedContent, MxError> {
        let recipients = self.room_recipients(room_id).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = crate::now_secs();
            let plan = self.with_store(|conn| {
                group::prepare_outbound(conn, room_id, &recipients, &self.settings.rotation, now)
            })?;
            if plan.rotated {
                tracing::info!(room_id, session_id = %plan.session_id, "room session rotated");
            }

            let unreachable = if plan.unshared.is_empty() {
                Vec::new()
            } else {
                let already_shared = recipients.len() - plan.unshared.len();
                self.share_session(room_id, &plan.session_id, &plan.unshared, already_shared)
                    .await?
            };
            for device in &unreachable {
                tracing::warn!(room_id, device = %device.label(), "device unreachable, not sharing room key");
            }
            let readers: Vec<DeviceRecord> = recipients
                .iter()
                .filter(|d| !unreachable.contains(d))
                .cloned()
                .collect();

            let result = self.with_store(|conn| {
                group::encrypt_room_event(conn, room_id, &readers, event_type, content.clone(), now)
            });
            match result {
                Ok(encrypted) => return Ok(encrypted),
                Err(MxError::NoSessionEstablished { .. }) | Err(MxError::Crypto(_)) if attempt == 1 => {
                    tracing::debug!(room_id, "retrying encryption after key share");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypt and send a text message. Returns the event id.
    pub async fn send_message(&self, room: &str, body: &str) -> Result<String, MxError> {
        let room_id = self.resolve_room(room).await?;
        let content = serde_json::to_value(RoomMessageContent::text(body))?;
        let encrypted = serde_json::to_value(self.encrypt(&room_id, EVENT_ROOM_MESSAGE, content).await?)?;
        let txn_id = TransactionId::new();
        let response = self
            .settings
            .retry
            .run("send event", || {
                self.api
                    .send_room_event(&room_id, EVENT_ROOM_ENCRYPTED, txn_id.as_str(), &encrypted)
            })
            .await?;
        tracing::info!(room_id = %room_id, event_id = %response.event_id, "message sent");
        Ok(response.event_id.to_string())
    }

    /// Decrypt one room event. A missing key records a gap and yields
    /// `RoomDecryption::Gap` instead of an error.
    pub fn decrypt(&self, room_id: &str, event: &RoomEvent) -> Result<RoomDecryption, MxError> {
        let content: MegolmEncryptedContent = serde_json::from_value(event.content.clone())?;
        self.with_store(|conn| group::decrypt_room_event(conn, room_id, event.event_id.as_str(), &content))
    }

    /// [`Self::decrypt`] for callers that need the plaintext: a gap is
    /// still recorded, then reported as `DecryptionGap`.
    pub fn decrypt_required(&self, room_id: &str, event: &RoomEvent) -> Result<DecryptedRoomEvent, MxError> {
        match self.decrypt(room_id, event)? {
            RoomDecryption::Plaintext(decrypted) => Ok(decrypted),
            RoomDecryption::Gap { session_id, .. } => Err(MxError::DecryptionGap {
                room_id: room_id.to_string(),
                session_id,
            }),
        }
    }

    fn timeline_message(&self, room_id: &str, event: &RoomEvent) -> Option<TimelineMessage> {
        let (body, status) = match event.event_type.as_str() {
            EVENT_ROOM_MESSAGE => (body_of(&event.content)?, MessageStatus::Plaintext),
            EVENT_ROOM_ENCRYPTED => match self.decrypt(room_id, event) {
                Ok(RoomDecryption::Plaintext(decrypted)) => {
                    if decrypted.event_type != EVENT_ROOM_MESSAGE {
                        return None;
                    }
                    (body_of(&decrypted.content)?, MessageStatus::Decrypted)
                }
                Ok(RoomDecryption::Gap { session_id, .. }) => {
                    (UNABLE_TO_DECRYPT.to_string(), MessageStatus::Undecryptable { session_id })
                }
                Err(e) => {
                    tracing::warn!(room_id, event_id = %event.event_id, error = %e, "event could not be decrypted");
                    let session_id = event
                        .content
                        .get("session_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    (UNABLE_TO_DECRYPT.to_string(), MessageStatus::Undecryptable { session_id })
                }
            },
            _ => return None,
        };
        Some(TimelineMessage {
            event_id: event.event_id.to_string(),
            sender: event.sender.to_string(),
            origin_server_ts: event.origin_server_ts,
            body,
            status,
        })
    }

    /// The last `limit` messages of a room, oldest first.
    pub async fn read(&self, room: &str, limit: u32) -> Result<Vec<TimelineMessage>, MxError> {
        let room_id = self.resolve_room(room).await?;
        let page = self
            .settings
            .retry
            .run("room messages", || self.api.room_messages(&room_id, limit))
            .await?;
        // `/messages?dir=b` lists newest first.
        Ok(page
            .chunk
            .iter()
            .rev()
            .filter_map(|event| self.timeline_message(&room_id, event))
            .collect())
    }

    // -- Key requests ---------------------------------------------------------

    /// Ask our verified devices for the keys of gaps not requested within
    /// `min_interval`, optionally limited to one room.
    pub async fn request_keys_for_gaps(
        &self,
        room_id: Option<&str>,
        min_interval: Duration,
    ) -> Result<KeyRequestRound, MxError> {
        let (gaps, targets) = self.with_store(|conn| {
            let gaps: Vec<PendingGap> = CryptoStore::new(conn)
                .gaps_due_for_request(min_interval.as_secs() as i64)?
                .into_iter()
                .filter(|g| room_id.is_none_or(|r| g.room_id == r))
                .collect();
            let targets = trust::verified_devices(conn, &self.identity.user_id, &self.identity.device_id)?;
            Ok((gaps, targets))
        })?;
        if gaps.is_empty() {
            return Ok(KeyRequestRound::default());
        }
        if targets.is_empty() {
            tracing::info!(gaps = gaps.len(), "no verified devices to request keys from");
            return Ok(KeyRequestRound::default());
        }

        let mut round = KeyRequestRound {
            request_ids: Vec::new(),
            target_devices: targets.len(),
        };
        for gap in gaps {
            let existing = self.with_store(|conn| {
                CryptoStore::new(conn).open_key_request(&gap.room_id, &gap.session_id)
            })?;
            let request_id = existing
                .map(|r| r.request_id)
                .unwrap_or_else(|| TransactionId::new().to_string());
            let content = RoomKeyRequestContent {
                action: "request".into(),
                body: Some(RequestedKeyInfo {
                    algorithm: MEGOLM_ALGORITHM.into(),
                    room_id: gap.room_id.as_str().into(),
                    sender_key: gap.sender_key.clone(),
                    session_id: gap.session_id.clone(),
                }),
                request_id: request_id.clone(),
                requesting_device_id: self.identity.device_id.as_str().into(),
            };
            self.send_to_devices(&targets, EVENT_ROOM_KEY_REQUEST, serde_json::to_value(&content)?)
                .await?;
            self.with_store(|conn| {
                with_transaction(conn, |store| {
                    store.insert_key_request(&request_id, &gap.room_id, &gap.session_id, &gap.sender_key)?;
                    store.mark_gap_requested(&gap.room_id, &gap.session_id)
                })
            })?;
            tracing::info!(room_id = %gap.room_id, session_id = %gap.session_id, request_id = %request_id, "room key requested");
            round.request_ids.push(request_id);
        }
        Ok(round)
    }

    /// Withdraw requests that are still open. Fulfilled ones are left alone.
    pub async fn cancel_key_requests(&self, request_ids: &[String]) -> Result<usize, MxError> {
        let (open, targets) = self.with_store(|conn| {
            let open: Vec<_> = CryptoStore::new(conn)
                .key_requests_in_state(KEY_REQUEST_SENT)?
                .into_iter()
                .filter(|r| request_ids.contains(&r.request_id))
                .collect();
            let targets = trust::verified_devices(conn, &self.identity.user_id, &self.identity.device_id)?;
            Ok((open, targets))
        })?;

        for request in &open {
            let content = RoomKeyRequestContent {
                action: "request_cancellation".into(),
                body: None,
                request_id: request.request_id.clone(),
                requesting_device_id: self.identity.device_id.as_str().into(),
            };
            self.send_to_devices(&targets, EVENT_ROOM_KEY_REQUEST, serde_json::to_value(&content)?)
                .await?;
            self.with_store(|conn| {
                CryptoStore::new(conn).set_key_request_state(&request.request_id, KEY_REQUEST_CANCELLED)
            })?;
        }
        Ok(open.len())
    }

    /// Send the same plaintext content to several devices.
    pub async fn send_to_devices(
        &self,
        targets: &[DeviceRecord],
        event_type: &str,
        content: Value,
    ) -> Result<(), MxError> {
        let mut request = SendToDeviceRequest::default();
        for device in targets {
            request.insert(
                &UserId::from(device.user_id.as_str()),
                &DeviceId::from(device.device_id.as_str()),
                content.clone(),
            );
        }
        self.send_to_device(event_type, &request).await
    }

    /// Per-room inbound session counts, for status output.
    pub fn inbound_session_counts(&self) -> Result<BTreeMap<String, u64>, MxError> {
        self.with_store(|conn| {
            Ok(CryptoStore::new(conn)
                .inbound_session_counts()?
                .into_iter()
                .collect())
        })
    }
}

fn body_of(content: &Value) -> Option<String> {
    content.get("body").and_then(Value::as_str).map(str::to_string)
}
