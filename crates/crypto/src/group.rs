//! Megolm room sessions.
//!
//! Each room has at most one outbound session. It is replaced when it has
//! encrypted `max_messages` events, when it is older than `max_age`, or when
//! a device it was shared with is no longer a recipient. Every new outbound
//! session also installs an inbound copy so our own events stay readable.
//!
//! Inbound sessions arrive as `m.room_key`, `m.forwarded_room_key`, or backup
//! entries. A stored session is only replaced by one that knows an earlier
//! message index; installing a session clears the gap events it can decrypt.

use std::collections::BTreeSet;
use std::time::Duration;

use mxagent_shared::api::events::{MegolmEncryptedContent, MegolmPayload};
use mxagent_shared::api::to_device::{ForwardedRoomKeyContent, OlmEncryptedContent, RoomKeyContent};
use mxagent_shared::constants::{EVENT_ROOM_KEY, MEGOLM_ALGORITHM};
use rusqlite::Connection;
use serde_json::Value;
use vodozemac::megolm::{
    DecryptionError, ExportedSessionKey, GroupSession, GroupSessionPickle, InboundGroupSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::error::CryptoError;
use crate::identity::load_account;
use crate::message::encrypt_to_device;
use crate::storage::device_store::DeviceRecord;
use crate::storage::group_session_store::{InboundSessionRow, OutboundSessionRow};
use crate::storage::{with_transaction, CryptoStore};

/// When an outbound session must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_messages: u64,
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Outbound session state for a room after [`prepare_outbound`].
#[derive(Debug, Clone)]
pub struct OutboundPlan {
    pub session_id: String,
    /// A previous session was replaced.
    pub rotated: bool,
    /// Recipients that have not received the session key yet.
    pub unshared: Vec<DeviceRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedRoomEvent {
    pub event_type: String,
    pub content: Value,
    pub session_id: String,
    pub sender_key: String,
    pub message_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomDecryption {
    Plaintext(DecryptedRoomEvent),
    /// No usable key; the event was recorded against a decryption gap.
    Gap { session_id: String, sender_key: String },
}

/// Where an inbound session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Own,
    RoomKey,
    Forwarded,
    Backup,
}

impl KeyOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyOrigin::Own => "own",
            KeyOrigin::RoomKey => "room_key",
            KeyOrigin::Forwarded => "forwarded",
            KeyOrigin::Backup => "backup",
        }
    }
}

/// Session key material in either of its wire forms.
#[derive(Debug, Clone, Copy)]
pub enum RoomKeyMaterial<'a> {
    /// Signed `session_key` from `m.room_key`.
    Session(&'a str),
    /// Unsigned export from forwarding or backup.
    Exported(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    /// Replaced a session that started at a later message index.
    Improved,
    Unchanged,
}

fn rotation_reason(
    row: &OutboundSessionRow,
    shared: &[(String, String)],
    recipients: &BTreeSet<(String, String)>,
    now: i64,
) -> Option<&'static str> {
    if row.message_count >= row.max_messages {
        return Some("message limit");
    }
    if now - row.created_at >= row.max_age_secs as i64 {
        return Some("age limit");
    }
    if shared.iter().any(|d| !recipients.contains(d)) {
        return Some("recipient removed");
    }
    None
}

fn recipient_set(recipients: &[DeviceRecord]) -> BTreeSet<(String, String)> {
    recipients
        .iter()
        .map(|d| (d.user_id.clone(), d.device_id.clone()))
        .collect()
}

fn load_group_session(row: &OutboundSessionRow) -> Result<GroupSession, CryptoError> {
    let pickle: GroupSessionPickle = serde_json::from_str(&row.pickle)?;
    Ok(GroupSession::from(pickle))
}

fn load_inbound(row: &InboundSessionRow) -> Result<InboundGroupSession, CryptoError> {
    let pickle: InboundGroupSessionPickle = serde_json::from_str(&row.pickle)?;
    Ok(InboundGroupSession::from(pickle))
}

/// Make sure `room_id` has a current outbound session for `recipients`.
///
/// `recipients` are the devices allowed to read the room under the trust
/// policy. A session is created or rotated as needed.
pub fn prepare_outbound(
    conn: &Connection,
    room_id: &str,
    recipients: &[DeviceRecord],
    policy: &RotationPolicy,
    now: i64,
) -> Result<OutboundPlan, CryptoError> {
    let wanted = recipient_set(recipients);

    with_transaction(conn, |store| {
        let mut rotated = false;
        let current = match store.load_outbound_session(room_id)? {
            Some(row) => {
                let shared = store.shared_devices(&row.session_id)?;
                match rotation_reason(&row, &shared, &wanted, now) {
                    Some(reason) => {
                        tracing::info!(room_id, session_id = %row.session_id, reason, "rotating room session");
                        store.discard_outbound_session(room_id)?;
                        rotated = true;
                        None
                    }
                    None => Some(row),
                }
            }
            None => None,
        };

        let row = match current {
            Some(row) => row,
            None => create_outbound(store, room_id, policy, now)?,
        };

        let shared: BTreeSet<(String, String)> =
            store.shared_devices(&row.session_id)?.into_iter().collect();
        let unshared = recipients
            .iter()
            .filter(|d| !shared.contains(&(d.user_id.clone(), d.device_id.clone())))
            .cloned()
            .collect();

        Ok(OutboundPlan {
            session_id: row.session_id,
            rotated,
            unshared,
        })
    })
}

fn create_outbound(
    store: &CryptoStore<'_>,
    room_id: &str,
    policy: &RotationPolicy,
    now: i64,
) -> Result<OutboundSessionRow, CryptoError> {
    let (_, account) = load_account(store)?;
    let session = GroupSession::new(SessionConfig::version_1());
    let inbound = InboundGroupSession::new(&session.session_key(), SessionConfig::version_1());

    let row = OutboundSessionRow {
        room_id: room_id.to_string(),
        session_id: session.session_id(),
        pickle: serde_json::to_string(&session.pickle())?,
        message_count: 0,
        max_messages: policy.max_messages,
        max_age_secs: policy.max_age.as_secs(),
        created_at: now,
    };
    store.save_outbound_session(&row)?;
    store.save_inbound_session(&InboundSessionRow {
        room_id: room_id.to_string(),
        session_id: inbound.session_id(),
        sender_key: account.curve25519_key().to_base64(),
        pickle: serde_json::to_string(&inbound.pickle())?,
        first_known_index: inbound.first_known_index(),
        origin: KeyOrigin::Own.as_str().to_string(),
    })?;
    tracing::debug!(room_id, session_id = %row.session_id, "created room session");
    Ok(row)
}

/// Olm-encrypted `m.room_key` events carrying the room's current session key.
///
/// Fails with `NoSessionEstablished` listing every device without an Olm
/// session; nothing is encrypted in that case.
pub fn share_room_key(
    conn: &Connection,
    room_id: &str,
    devices: &[DeviceRecord],
) -> Result<Vec<(DeviceRecord, OlmEncryptedContent)>, CryptoError> {
    with_transaction(conn, |store| {
        let row = store
            .load_outbound_session(room_id)?
            .ok_or_else(|| CryptoError::NoOutboundSession {
                room_id: room_id.to_string(),
            })?;

        let mut missing = Vec::new();
        for device in devices {
            if !store.has_olm_session(&device.curve25519_key)? {
                missing.push(device.label());
            }
        }
        if !missing.is_empty() {
            return Err(CryptoError::NoSessionEstablished { missing });
        }

        let session = load_group_session(&row)?;
        let content = serde_json::to_value(RoomKeyContent {
            algorithm: MEGOLM_ALGORITHM.to_string(),
            room_id: room_id.into(),
            session_id: session.session_id(),
            session_key: session.session_key().to_base64(),
        })?;

        devices
            .iter()
            .map(|device| {
                let encrypted = encrypt_to_device(conn, device, EVENT_ROOM_KEY, content.clone())?;
                Ok((device.clone(), encrypted))
            })
            .collect()
    })
}

/// Record that `devices` received `session_id` for `room_id`.
pub fn mark_shared(
    conn: &Connection,
    room_id: &str,
    session_id: &str,
    devices: &[DeviceRecord],
) -> Result<(), CryptoError> {
    with_transaction(conn, |store| {
        for device in devices {
            store.record_share(room_id, session_id, &device.user_id, &device.device_id)?;
        }
        Ok(())
    })
}

/// Encrypt one room event with the room's outbound session.
///
/// Fails with `NoSessionEstablished` if a recipient has not received the
/// session key, and with `RotationDue` if the session must be replaced first.
pub fn encrypt_room_event(
    conn: &Connection,
    room_id: &str,
    recipients: &[DeviceRecord],
    event_type: &str,
    content: Value,
    now: i64,
) -> Result<MegolmEncryptedContent, CryptoError> {
    let wanted = recipient_set(recipients);

    with_transaction(conn, |store| {
        let (account_row, account) = load_account(store)?;
        let mut row = store
            .load_outbound_session(room_id)?
            .ok_or_else(|| CryptoError::NoOutboundSession {
                room_id: room_id.to_string(),
            })?;

        let shared = store.shared_devices(&row.session_id)?;
        if rotation_reason(&row, &shared, &wanted, now).is_some() {
            return Err(CryptoError::RotationDue {
                room_id: room_id.to_string(),
            });
        }
        let shared: BTreeSet<(String, String)> = shared.into_iter().collect();
        let missing: Vec<String> = recipients
            .iter()
            .filter(|d| !shared.contains(&(d.user_id.clone(), d.device_id.clone())))
            .map(DeviceRecord::label)
            .collect();
        if !missing.is_empty() {
            return Err(CryptoError::NoSessionEstablished { missing });
        }

        let mut session = load_group_session(&row)?;
        let payload = serde_json::to_string(&MegolmPayload {
            event_type: event_type.to_string(),
            content,
            room_id: room_id.to_string(),
        })?;
        let ciphertext = session.encrypt(payload.as_bytes()).to_base64();

        row.pickle = serde_json::to_string(&session.pickle())?;
        row.message_count += 1;
        store.save_outbound_session(&row)?;

        Ok(MegolmEncryptedContent {
            algorithm: MEGOLM_ALGORITHM.to_string(),
            ciphertext,
            session_id: row.session_id.clone(),
            sender_key: account.curve25519_key().to_base64(),
            device_id: Some(account_row.device_id.as_str().into()),
        })
    })
}

/// Decrypt a room event. A missing key is not an error: the event is
/// recorded against a gap for (room, session) and `Gap` is returned.
pub fn decrypt_room_event(
    conn: &Connection,
    room_id: &str,
    event_id: &str,
    content: &MegolmEncryptedContent,
) -> Result<RoomDecryption, CryptoError> {
    if content.algorithm != MEGOLM_ALGORITHM {
        return Err(CryptoError::DecryptionFailed(format!(
            "unsupported algorithm {}",
            content.algorithm
        )));
    }
    let message = MegolmMessage::from_base64(&content.ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

    with_transaction(conn, |store| {
        let gap = |sender_key: &str| -> Result<RoomDecryption, CryptoError> {
            if store.record_gap(
                room_id,
                &content.session_id,
                sender_key,
                event_id,
                Some(message.message_index()),
            )? {
                tracing::info!(room_id, session_id = %content.session_id, "new decryption gap");
            }
            Ok(RoomDecryption::Gap {
                session_id: content.session_id.clone(),
                sender_key: sender_key.to_string(),
            })
        };

        let Some(row) = store.load_inbound_session(room_id, &content.session_id)? else {
            return gap(&content.sender_key);
        };
        let mut session = load_inbound(&row)?;
        let decrypted = match session.decrypt(&message) {
            Ok(decrypted) => decrypted,
            Err(DecryptionError::UnknownMessageIndex(..)) => return gap(&row.sender_key),
            Err(e) => return Err(CryptoError::DecryptionFailed(e.to_string())),
        };

        let payload: MegolmPayload = serde_json::from_slice(&decrypted.plaintext)?;
        if payload.room_id != room_id {
            return Err(CryptoError::DecryptionFailed(format!(
                "event encrypted for {} replayed into {room_id}",
                payload.room_id
            )));
        }
        Ok(RoomDecryption::Plaintext(DecryptedRoomEvent {
            event_type: payload.event_type,
            content: payload.content,
            session_id: content.session_id.clone(),
            sender_key: row.sender_key,
            message_index: decrypted.message_index,
        }))
    })
}

/// Install an inbound session for `room_id`.
///
/// Re-delivery of the same or a worse session (higher first known index) is
/// a no-op. Gap events the session can decrypt are cleared in the same
/// transaction; events below its first known index stay pending.
pub fn ingest_room_key(
    conn: &Connection,
    room_id: &str,
    session_id: &str,
    sender_key: &str,
    key: RoomKeyMaterial<'_>,
    origin: KeyOrigin,
) -> Result<IngestOutcome, CryptoError> {
    let session = match key {
        RoomKeyMaterial::Session(b64) => {
            let key = SessionKey::from_base64(b64)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            InboundGroupSession::new(&key, SessionConfig::version_1())
        }
        RoomKeyMaterial::Exported(b64) => {
            let key = ExportedSessionKey::from_base64(b64)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            InboundGroupSession::import(&key, SessionConfig::version_1())
        }
    };
    if session.session_id() != session_id {
        return Err(CryptoError::InvalidKey(format!(
            "key material is for session {}, not {session_id}",
            session.session_id()
        )));
    }
    let first_known_index = session.first_known_index();

    with_transaction(conn, |store| {
        let outcome = match store.load_inbound_session(room_id, session_id)? {
            Some(existing) if existing.first_known_index <= first_known_index => {
                return Ok(IngestOutcome::Unchanged);
            }
            Some(_) => IngestOutcome::Improved,
            None => IngestOutcome::Inserted,
        };

        store.save_inbound_session(&InboundSessionRow {
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
            sender_key: sender_key.to_string(),
            pickle: serde_json::to_string(&session.pickle())?,
            first_known_index,
            origin: origin.as_str().to_string(),
        })?;
        if store.clear_gap_from(room_id, session_id, first_known_index)? {
            tracing::info!(room_id, session_id, origin = origin.as_str(), "decryption gap closed");
        } else if store.has_gap(room_id, session_id)? {
            tracing::info!(room_id, session_id, first_known_index, "key installed, earlier events still missing");
        }
        tracing::debug!(room_id, session_id, first_known_index, ?outcome, "room key installed");
        Ok(outcome)
    })
}

/// `m.forwarded_room_key` content for a session we hold, exported at its
/// first known index.
pub fn forwarded_key_content(
    conn: &Connection,
    room_id: &str,
    session_id: &str,
) -> Result<Option<ForwardedRoomKeyContent>, CryptoError> {
    let store = CryptoStore::new(conn);
    let Some(row) = store.load_inbound_session(room_id, session_id)? else {
        return Ok(None);
    };
    let mut session = load_inbound(&row)?;
    let Some(exported) = session.export_at(session.first_known_index()) else {
        return Ok(None);
    };

    let (_, account) = load_account(&store)?;
    let own_curve = account.curve25519_key().to_base64();
    let sender_claimed_ed25519_key = if row.sender_key == own_curve {
        account.ed25519_key().to_base64()
    } else {
        store
            .device_by_curve_key(&row.sender_key)?
            .map(|d| d.ed25519_key)
            .unwrap_or_default()
    };

    Ok(Some(ForwardedRoomKeyContent {
        algorithm: MEGOLM_ALGORITHM.to_string(),
        room_id: room_id.into(),
        sender_key: row.sender_key,
        session_id: session_id.to_string(),
        session_key: exported.to_base64(),
        sender_claimed_ed25519_key,
        forwarding_curve25519_key_chain: Vec::new(),
    }))
}

/// Drop the room's outbound session so the next send creates a new one.
pub fn discard_outbound(conn: &Connection, room_id: &str) -> Result<(), CryptoError> {
    CryptoStore::new(conn).discard_outbound_session(room_id)
}

pub fn outbound_session_id(conn: &Connection, room_id: &str) -> Result<Option<String>, CryptoError> {
    Ok(CryptoStore::new(conn)
        .load_outbound_session(room_id)?
        .map(|row| row.session_id))
}

/// Rooms with an outbound session that was shared with `user_id`.
pub fn rooms_shared_with(conn: &Connection, user_id: &str) -> Result<Vec<String>, CryptoError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT s.room_id FROM crypto_outbound_group_shares s
         JOIN crypto_outbound_group_sessions o ON o.session_id = s.session_id
         WHERE s.user_id = ?1 ORDER BY s.room_id",
    )?;
    let rooms = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rooms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{generate_identity, own_identity};
    use crate::message::decrypt_to_device;
    use crate::prekeys::keys_to_upload;
    use crate::session::establish_from_claim;
    use crate::storage::init_test_db;
    use crate::trust::TrustState;
    use serde_json::json;

    const ROOM: &str = "!room:hs";

    fn device_of(conn: &Connection) -> DeviceRecord {
        let identity = own_identity(conn).unwrap();
        DeviceRecord {
            user_id: identity.user_id,
            device_id: identity.device_id,
            curve25519_key: identity.curve25519,
            ed25519_key: identity.ed25519,
            display_name: None,
            trust: TrustState::Unverified,
            first_seen_at: 0,
            last_seen_at: 0,
            verified_at: None,
            deleted: false,
        }
    }

    struct Pair {
        alice: Connection,
        bob: Connection,
        bob_device: DeviceRecord,
    }

    fn pair() -> Pair {
        let alice = init_test_db();
        let bob = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        let bob_device = device_of(&bob);
        let claimed = keys_to_upload(&bob, 0).unwrap().into_values().next().unwrap();
        establish_from_claim(&alice, &bob_device, &claimed).unwrap();
        Pair { alice, bob, bob_device }
    }

    /// Prepare, share with anyone unshared, deliver to bob, and encrypt.
    fn send(p: &Pair, body: &str, now: i64, policy: &RotationPolicy) -> MegolmEncryptedContent {
        let recipients = vec![p.bob_device.clone()];
        let plan = prepare_outbound(&p.alice, ROOM, &recipients, policy, now).unwrap();
        if !plan.unshared.is_empty() {
            for (_, encrypted) in share_room_key(&p.alice, ROOM, &plan.unshared).unwrap() {
                deliver_room_key(&p.bob, "@alice:hs", &encrypted);
            }
            mark_shared(&p.alice, ROOM, &plan.session_id, &plan.unshared).unwrap();
        }
        encrypt_room_event(
            &p.alice,
            ROOM,
            &recipients,
            "m.room.message",
            json!({"msgtype": "m.text", "body": body}),
            now,
        )
        .unwrap()
    }

    fn deliver_room_key(conn: &Connection, sender: &str, encrypted: &OlmEncryptedContent) {
        let decrypted = decrypt_to_device(conn, sender, encrypted).unwrap();
        let key: RoomKeyContent = serde_json::from_value(decrypted.content).unwrap();
        ingest_room_key(
            conn,
            key.room_id.as_str(),
            &key.session_id,
            &decrypted.sender_key,
            RoomKeyMaterial::Session(&key.session_key),
            KeyOrigin::RoomKey,
        )
        .unwrap();
    }

    fn body_of(result: RoomDecryption) -> String {
        match result {
            RoomDecryption::Plaintext(event) => event.content["body"].as_str().unwrap().to_string(),
            RoomDecryption::Gap { .. } => panic!("expected plaintext"),
        }
    }

    #[test]
    fn shared_session_decrypts_on_the_other_side() {
        let p = pair();
        let policy = RotationPolicy::default();
        let encrypted = send(&p, "hello", 1_000, &policy);
        let result = decrypt_room_event(&p.bob, ROOM, "$e1", &encrypted).unwrap();
        assert_eq!(body_of(result), "hello");
    }

    #[test]
    fn own_events_stay_readable() {
        let p = pair();
        let encrypted = send(&p, "mine", 1_000, &RotationPolicy::default());
        let result = decrypt_room_event(&p.alice, ROOM, "$e1", &encrypted).unwrap();
        assert_eq!(body_of(result), "mine");
    }

    #[test]
    fn second_send_reuses_the_session_without_resharing() {
        let p = pair();
        let policy = RotationPolicy::default();
        let first = send(&p, "one", 1_000, &policy);
        let plan = prepare_outbound(&p.alice, ROOM, &[p.bob_device.clone()], &policy, 1_001).unwrap();
        assert!(plan.unshared.is_empty());
        assert!(!plan.rotated);
        let second = send(&p, "two", 1_001, &policy);
        assert_eq!(first.session_id, second.session_id);
    }

    #[test]
    fn message_limit_rotates_before_the_next_message() {
        let p = pair();
        let policy = RotationPolicy::default();
        let first = send(&p, "0", 1_000, &policy);
        for i in 1..100 {
            let encrypted = send(&p, &i.to_string(), 1_000, &policy);
            assert_eq!(encrypted.session_id, first.session_id);
        }
        let hundred_and_first = send(&p, "100", 1_000, &policy);
        assert_ne!(hundred_and_first.session_id, first.session_id);
        let result = decrypt_room_event(&p.bob, ROOM, "$e101", &hundred_and_first).unwrap();
        assert_eq!(body_of(result), "100");
    }

    #[test]
    fn age_limit_rotates() {
        let p = pair();
        let policy = RotationPolicy {
            max_messages: 100,
            max_age: Duration::from_secs(60),
        };
        let first = send(&p, "a", 1_000, &policy);
        let second = send(&p, "b", 1_059, &policy);
        let third = send(&p, "c", 1_060, &policy);
        assert_eq!(first.session_id, second.session_id);
        assert_ne!(second.session_id, third.session_id);
    }

    #[test]
    fn removed_recipient_forces_rotation() {
        let p = pair();
        let policy = RotationPolicy::default();
        let first = send(&p, "a", 1_000, &policy);

        let plan = prepare_outbound(&p.alice, ROOM, &[], &policy, 1_001).unwrap();
        assert!(plan.rotated);
        assert_ne!(plan.session_id, first.session_id);
    }

    #[test]
    fn encrypt_without_rotation_reports_rotation_due() {
        let p = pair();
        let policy = RotationPolicy {
            max_messages: 1,
            max_age: Duration::from_secs(3600),
        };
        send(&p, "a", 1_000, &policy);
        let result = encrypt_room_event(
            &p.alice,
            ROOM,
            &[p.bob_device.clone()],
            "m.room.message",
            json!({}),
            1_000,
        );
        assert!(matches!(result, Err(CryptoError::RotationDue { .. })));
    }

    #[test]
    fn encrypt_for_unshared_recipient_fails() {
        let p = pair();
        let recipients = vec![p.bob_device.clone()];
        prepare_outbound(&p.alice, ROOM, &recipients, &RotationPolicy::default(), 1_000).unwrap();
        let result = encrypt_room_event(&p.alice, ROOM, &recipients, "m.room.message", json!({}), 1_000);
        match result {
            Err(CryptoError::NoSessionEstablished { missing }) => {
                assert_eq!(missing, vec!["@bob:hs B".to_string()]);
            }
            other => panic!("expected NoSessionEstablished, got {other:?}"),
        }
    }

    #[test]
    fn share_without_olm_session_lists_missing_devices() {
        let p = pair();
        let carol = init_test_db();
        generate_identity(&carol, "@carol:hs", "C").unwrap();
        let recipients = vec![p.bob_device.clone(), device_of(&carol)];
        prepare_outbound(&p.alice, ROOM, &recipients, &RotationPolicy::default(), 1_000).unwrap();
        match share_room_key(&p.alice, ROOM, &recipients) {
            Err(CryptoError::NoSessionEstablished { missing }) => {
                assert_eq!(missing, vec!["@carol:hs C".to_string()]);
            }
            other => panic!("expected NoSessionEstablished, got {other:?}"),
        }
    }

    #[test]
    fn missing_key_records_gap_then_ingest_clears_it() {
        let p = pair();
        let recipients = vec![p.bob_device.clone()];
        let policy = RotationPolicy::default();
        prepare_outbound(&p.alice, ROOM, &recipients, &policy, 1_000).unwrap();
        let shares = share_room_key(&p.alice, ROOM, &recipients).unwrap();
        mark_shared(
            &p.alice,
            ROOM,
            &outbound_session_id(&p.alice, ROOM).unwrap().unwrap(),
            &recipients,
        )
        .unwrap();
        let encrypted =
            encrypt_room_event(&p.alice, ROOM, &recipients, "m.room.message", json!({"body": "late"}), 1_000)
                .unwrap();

        let result = decrypt_room_event(&p.bob, ROOM, "$late", &encrypted).unwrap();
        assert!(matches!(result, RoomDecryption::Gap { .. }));
        let store = CryptoStore::new(&p.bob);
        assert!(store.has_gap(ROOM, &encrypted.session_id).unwrap());

        deliver_room_key(&p.bob, "@alice:hs", &shares[0].1);
        assert!(!store.has_gap(ROOM, &encrypted.session_id).unwrap());
        let result = decrypt_room_event(&p.bob, ROOM, "$late", &encrypted).unwrap();
        assert_eq!(body_of(result), "late");
    }

    #[test]
    fn reingesting_a_key_is_a_no_op() {
        let p = pair();
        send(&p, "a", 1_000, &RotationPolicy::default());
        let content = forwarded_key_content(&p.alice, ROOM, &outbound_session_id(&p.alice, ROOM).unwrap().unwrap())
            .unwrap()
            .unwrap();

        let ingest = |conn: &Connection| {
            ingest_room_key(
                conn,
                ROOM,
                &content.session_id,
                &content.sender_key,
                RoomKeyMaterial::Exported(&content.session_key),
                KeyOrigin::Forwarded,
            )
            .unwrap()
        };
        let carol = init_test_db();
        generate_identity(&carol, "@carol:hs", "C").unwrap();
        assert_eq!(ingest(&carol), IngestOutcome::Inserted);
        assert_eq!(ingest(&carol), IngestOutcome::Unchanged);
        assert_eq!(CryptoStore::new(&carol).inbound_session_ids(ROOM).unwrap().len(), 1);
    }

    #[test]
    fn earlier_index_improves_a_stored_session() {
        let p = pair();
        let policy = RotationPolicy::default();
        let first = send(&p, "zero", 1_000, &policy);
        send(&p, "one", 1_000, &policy);

        // Alice's own copy starts at index 0; export it later at index 1.
        let store = CryptoStore::new(&p.alice);
        let row = store.load_inbound_session(ROOM, &first.session_id).unwrap().unwrap();
        let mut session = load_inbound(&row).unwrap();
        let late = session.export_at(1).unwrap().to_base64();
        let early = session.export_at(0).unwrap().to_base64();

        let carol = init_test_db();
        generate_identity(&carol, "@carol:hs", "C").unwrap();
        let ingest = |key: &str| {
            ingest_room_key(
                &carol,
                ROOM,
                &first.session_id,
                &row.sender_key,
                RoomKeyMaterial::Exported(key),
                KeyOrigin::Backup,
            )
            .unwrap()
        };
        assert_eq!(ingest(&late), IngestOutcome::Inserted);

        // Index 0 is unknown to the late session, so it is a gap.
        let result = decrypt_room_event(&carol, ROOM, "$zero", &first).unwrap();
        assert!(matches!(result, RoomDecryption::Gap { .. }));

        assert_eq!(ingest(&early), IngestOutcome::Improved);
        assert_eq!(ingest(&late), IngestOutcome::Unchanged);
        let result = decrypt_room_event(&carol, ROOM, "$zero", &first).unwrap();
        assert_eq!(body_of(result), "zero");
    }

    #[test]
    fn improved_key_that_still_misses_the_event_keeps_the_gap() {
        let p = pair();
        let policy = RotationPolicy::default();
        let first = send(&p, "zero", 1_000, &policy);
        send(&p, "one", 1_000, &policy);
        send(&p, "two", 1_000, &policy);

        let store = CryptoStore::new(&p.alice);
        let row = store.load_inbound_session(ROOM, &first.session_id).unwrap().unwrap();
        let mut session = load_inbound(&row).unwrap();
        let at_two = session.export_at(2).unwrap().to_base64();
        let at_one = session.export_at(1).unwrap().to_base64();
        let at_zero = session.export_at(0).unwrap().to_base64();

        let carol = init_test_db();
        generate_identity(&carol, "@carol:hs", "C").unwrap();
        let ingest = |key: &str| {
            ingest_room_key(
                &carol,
                ROOM,
                &first.session_id,
                &row.sender_key,
                RoomKeyMaterial::Exported(key),
                KeyOrigin::Forwarded,
            )
            .unwrap()
        };
        assert_eq!(ingest(&at_two), IngestOutcome::Inserted);
        let result = decrypt_room_event(&carol, ROOM, "$zero", &first).unwrap();
        assert!(matches!(result, RoomDecryption::Gap { .. }));

        assert_eq!(ingest(&at_one), IngestOutcome::Improved);
        let carol_store = CryptoStore::new(&carol);
        let gaps = carol_store.pending_gaps().unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].session_id, first.session_id);
        assert_eq!(gaps[0].event_ids, vec!["$zero".to_string()]);
        let result = decrypt_room_event(&carol, ROOM, "$zero", &first).unwrap();
        assert!(matches!(result, RoomDecryption::Gap { .. }));

        assert_eq!(ingest(&at_zero), IngestOutcome::Improved);
        assert!(carol_store.pending_gaps().unwrap().is_empty());
        let result = decrypt_room_event(&carol, ROOM, "$zero", &first).unwrap();
        assert_eq!(body_of(result), "zero");
    }

    #[test]
    fn key_for_wrong_session_id_is_rejected() {
        let p = pair();
        send(&p, "a", 1_000, &RotationPolicy::default());
        let session_id = outbound_session_id(&p.alice, ROOM).unwrap().unwrap();
        let content = forwarded_key_content(&p.alice, ROOM, &session_id).unwrap().unwrap();
        let result = ingest_room_key(
            &p.bob,
            ROOM,
            "some-other-session",
            &content.sender_key,
            RoomKeyMaterial::Exported(&content.session_key),
            KeyOrigin::Forwarded,
        );
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn event_replayed_into_another_room_is_rejected() {
        let p = pair();
        let encrypted = send(&p, "a", 1_000, &RotationPolicy::default());
        let content = forwarded_key_content(&p.alice, ROOM, &encrypted.session_id)
            .unwrap()
            .unwrap();
        ingest_room_key(
            &p.bob,
            "!other:hs",
            &content.session_id,
            &content.sender_key,
            RoomKeyMaterial::Exported(&content.session_key),
            KeyOrigin::Forwarded,
        )
        .unwrap();
        assert!(matches!(
            decrypt_room_event(&p.bob, "!other:hs", "$e", &encrypted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn rooms_shared_with_lists_rooms() {
        let p = pair();
        send(&p, "a", 1_000, &RotationPolicy::default());
        assert_eq!(rooms_shared_with(&p.alice, "@bob:hs").unwrap(), vec![ROOM.to_string()]);
        discard_outbound(&p.alice, ROOM).unwrap();
        assert!(rooms_shared_with(&p.alice, "@bob:hs").unwrap().is_empty());
    }
}
