//! Olm-encrypted to-device messages.
//!
//! Outgoing events are wrapped in the Olm payload envelope (sender, recipient
//! and both ed25519 keys) and encrypted with the most recently used session
//! for the recipient's curve25519 key. Incoming events are tried against every
//! stored session with the sender; a pre-key message that none of them accepts
//! creates a new inbound session and consumes one of our one-time keys.

use std::collections::BTreeMap;

use mxagent_shared::api::to_device::{Ed25519Keys, OlmCiphertext, OlmEncryptedContent, OlmPayload};
use mxagent_shared::constants::OLM_ALGORITHM;
use rusqlite::Connection;
use serde_json::Value;
use vodozemac::olm::{OlmMessage, Session};
use vodozemac::Curve25519PublicKey;

use crate::error::CryptoError;
use crate::identity::{load_account, save_account};
use crate::session::{load_sessions, save_session};
use crate::storage::device_store::DeviceRecord;
use crate::storage::{with_transaction, CryptoStore};
use crate::util::{decode_b64, encode_b64};

/// A to-device event after Olm decryption and envelope checks.
#[derive(Debug, Clone)]
pub struct DecryptedToDevice {
    pub sender: String,
    /// Curve25519 key the message was encrypted from.
    pub sender_key: String,
    /// Ed25519 key the sender claims inside the envelope.
    pub sender_ed25519: String,
    pub sender_device: Option<String>,
    pub event_type: String,
    pub content: Value,
    /// A new inbound session was created for this message.
    pub new_session: bool,
}

/// Encrypt `content` of type `event_type` for one device.
///
/// Returns `CryptoError::SessionNotFound` if no Olm session exists with the
/// device's curve25519 key.
pub fn encrypt_to_device(
    conn: &Connection,
    recipient: &DeviceRecord,
    event_type: &str,
    content: Value,
) -> Result<OlmEncryptedContent, CryptoError> {
    with_transaction(conn, |store| {
        let (row, account) = load_account(store)?;
        let mut session = load_sessions(store, &recipient.curve25519_key)?
            .into_iter()
            .next()
            .ok_or_else(|| CryptoError::SessionNotFound {
                peer_key: recipient.curve25519_key.clone(),
            })?;

        let payload = OlmPayload {
            event_type: event_type.to_string(),
            content,
            sender: row.user_id.as_str().into(),
            sender_device: Some(row.device_id.as_str().into()),
            recipient: recipient.user_id.as_str().into(),
            recipient_keys: Ed25519Keys {
                ed25519: recipient.ed25519_key.clone(),
            },
            keys: Ed25519Keys {
                ed25519: account.ed25519_key().to_base64(),
            },
        };
        let plaintext = serde_json::to_string(&payload)?;
        let (message_type, body) = session.encrypt(plaintext.as_bytes()).to_parts();
        save_session(store, &recipient.curve25519_key, &session)?;

        let mut ciphertext = BTreeMap::new();
        ciphertext.insert(
            recipient.curve25519_key.clone(),
            OlmCiphertext {
                message_type,
                body: encode_b64(&body),
            },
        );
        Ok(OlmEncryptedContent {
            algorithm: OLM_ALGORITHM.to_string(),
            sender_key: account.curve25519_key().to_base64(),
            ciphertext,
        })
    })
}

/// Decrypt an `m.room.encrypted` to-device event from `sender`.
///
/// Session and account changes are stored only when decryption and the
/// envelope checks both succeed.
pub fn decrypt_to_device(
    conn: &Connection,
    sender: &str,
    content: &OlmEncryptedContent,
) -> Result<DecryptedToDevice, CryptoError> {
    if content.algorithm != OLM_ALGORITHM {
        return Err(CryptoError::DecryptionFailed(format!(
            "unsupported algorithm {}",
            content.algorithm
        )));
    }

    with_transaction(conn, |store| {
        let (row, mut account) = load_account(store)?;
        let own_curve = account.curve25519_key().to_base64();
        let own_ed25519 = account.ed25519_key().to_base64();

        let entry = content.ciphertext.get(&own_curve).ok_or_else(|| {
            CryptoError::DecryptionFailed("message not addressed to this device".into())
        })?;
        let bytes = decode_b64(&entry.body)?;
        let message = OlmMessage::from_parts(entry.message_type, &bytes)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        let sender_key = &content.sender_key;
        let (session, plaintext, new_session) =
            match try_existing_sessions(store, sender_key, &message)? {
                Some((session, plaintext)) => (session, plaintext, false),
                None => match &message {
                    OlmMessage::PreKey(pre_key) => {
                        let identity_key = Curve25519PublicKey::from_base64(sender_key)?;
                        let result = account
                            .create_inbound_session(identity_key, pre_key)
                            .map_err(|e| CryptoError::OlmError(e.to_string()))?;
                        (result.session, result.plaintext, true)
                    }
                    OlmMessage::Normal(_) => {
                        return Err(CryptoError::SessionCorrupted {
                            peer_key: sender_key.clone(),
                            detail: "no session could decrypt the message".into(),
                        })
                    }
                },
            };

        let payload: OlmPayload = serde_json::from_slice(&plaintext)?;
        check_envelope(store, &payload, sender, sender_key, &row.user_id, &own_ed25519)?;

        save_session(store, sender_key, &session)?;
        if new_session {
            save_account(store, &account)?;
            tracing::debug!(sender, sender_key = %sender_key, "created inbound olm session");
        }

        Ok(DecryptedToDevice {
            sender: sender.to_string(),
            sender_key: sender_key.clone(),
            sender_ed25519: payload.keys.ed25519,
            sender_device: payload.sender_device.map(|d| d.to_string()),
            event_type: payload.event_type,
            content: payload.content,
            new_session,
        })
    })
}

fn try_existing_sessions(
    store: &CryptoStore<'_>,
    sender_key: &str,
    message: &OlmMessage,
) -> Result<Option<(Session, Vec<u8>)>, CryptoError> {
    for mut session in load_sessions(store, sender_key)? {
        if let OlmMessage::PreKey(pre_key) = message {
            if pre_key.session_id() != session.session_id() {
                continue;
            }
        }
        match session.decrypt(message) {
            Ok(plaintext) => return Ok(Some((session, plaintext))),
            Err(e) => {
                tracing::debug!(session_id = %session.session_id(), error = %e, "olm session did not decrypt");
            }
        }
    }
    Ok(None)
}

fn check_envelope(
    store: &CryptoStore<'_>,
    payload: &OlmPayload,
    sender: &str,
    sender_key: &str,
    own_user: &str,
    own_ed25519: &str,
) -> Result<(), CryptoError> {
    if payload.sender.as_str() != sender {
        return Err(CryptoError::DecryptionFailed(format!(
            "envelope sender {} does not match {sender}",
            payload.sender
        )));
    }
    if payload.recipient.as_str() != own_user || payload.recipient_keys.ed25519 != own_ed25519 {
        return Err(CryptoError::DecryptionFailed(
            "envelope is addressed to another device".into(),
        ));
    }
    if let Some(device) = store.device_by_curve_key(sender_key)? {
        if device.user_id != sender || device.ed25519_key != payload.keys.ed25519 {
            return Err(CryptoError::DecryptionFailed(format!(
                "sender keys do not match known device {}",
                device.label()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{generate_identity, own_identity};
    use crate::prekeys::keys_to_upload;
    use crate::session::establish_from_claim;
    use crate::storage::init_test_db;
    use crate::trust::TrustState;
    use serde_json::json;

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

    fn pair() -> (Connection, Connection) {
        let alice = init_test_db();
        let bob = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        let claimed = keys_to_upload(&bob, 0).unwrap().into_values().next().unwrap();
        establish_from_claim(&alice, &device_of(&bob), &claimed).unwrap();
        (alice, bob)
    }

    #[test]
    fn encrypt_without_session_fails() {
        let alice = init_test_db();
        let bob = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        let result = encrypt_to_device(&alice, &device_of(&bob), "m.dummy", json!({}));
        assert!(matches!(result, Err(CryptoError::SessionNotFound { .. })));
    }

    #[test]
    fn first_message_creates_inbound_session() {
        let (alice, bob) = pair();
        let encrypted =
            encrypt_to_device(&alice, &device_of(&bob), "m.dummy", json!({"n": 1})).unwrap();
        let entry = encrypted.ciphertext.values().next().unwrap();
        assert_eq!(entry.message_type, 0);

        let decrypted = decrypt_to_device(&bob, "@alice:hs", &encrypted).unwrap();
        assert!(decrypted.new_session);
        assert_eq!(decrypted.event_type, "m.dummy");
        assert_eq!(decrypted.content["n"], 1);
        assert_eq!(decrypted.sender_device.as_deref(), Some("A"));
        assert_eq!(decrypted.sender_key, device_of(&alice).curve25519_key);
    }

    #[test]
    fn conversation_continues_with_normal_messages() {
        let (alice, bob) = pair();
        let to_bob = device_of(&bob);
        let to_alice = device_of(&alice);

        let first = encrypt_to_device(&alice, &to_bob, "m.dummy", json!({})).unwrap();
        decrypt_to_device(&bob, "@alice:hs", &first).unwrap();

        let reply = encrypt_to_device(&bob, &to_alice, "m.dummy", json!({"r": true})).unwrap();
        let decrypted = decrypt_to_device(&alice, "@bob:hs", &reply).unwrap();
        assert!(!decrypted.new_session);

        let next = encrypt_to_device(&alice, &to_bob, "m.dummy", json!({"n": 2})).unwrap();
        assert_eq!(next.ciphertext.values().next().unwrap().message_type, 1);
        let decrypted = decrypt_to_device(&bob, "@alice:hs", &next).unwrap();
        assert_eq!(decrypted.content["n"], 2);
    }

    #[test]
    fn wrong_sender_is_rejected_and_nothing_is_stored() {
        let (alice, bob) = pair();
        let encrypted = encrypt_to_device(&alice, &device_of(&bob), "m.dummy", json!({})).unwrap();
        let result = decrypt_to_device(&bob, "@mallory:hs", &encrypted);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed(_))));
        assert!(!CryptoStore::new(&bob)
            .has_olm_session(&encrypted.sender_key)
            .unwrap());

        // The one-time key was not consumed, so the genuine sender still gets through.
        decrypt_to_device(&bob, "@alice:hs", &encrypted).unwrap();
    }

    #[test]
    fn message_for_other_device_is_rejected() {
        let (alice, bob) = pair();
        let mut encrypted =
            encrypt_to_device(&alice, &device_of(&bob), "m.dummy", json!({})).unwrap();
        let entry = encrypted.ciphertext.pop_first().unwrap().1;
        encrypted.ciphertext.insert("someone-else".into(), entry);
        assert!(matches!(
            decrypt_to_device(&bob, "@alice:hs", &encrypted),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn normal_message_without_session_reports_corruption() {
        let (alice, bob) = pair();
        let to_bob = device_of(&bob);
        let first = encrypt_to_device(&alice, &to_bob, "m.dummy", json!({})).unwrap();
        decrypt_to_device(&bob, "@alice:hs", &first).unwrap();
        let reply = encrypt_to_device(&bob, &device_of(&alice), "m.dummy", json!({})).unwrap();
        decrypt_to_device(&alice, "@bob:hs", &reply).unwrap();
        let normal = encrypt_to_device(&alice, &to_bob, "m.dummy", json!({})).unwrap();

        CryptoStore::new(&bob)
            .delete_olm_sessions(&normal.sender_key)
            .unwrap();
        assert!(matches!(
            decrypt_to_device(&bob, "@alice:hs", &normal),
            Err(CryptoError::SessionCorrupted { .. })
        ));
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let bob = init_test_db();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        let content = OlmEncryptedContent {
            algorithm: "m.unknown".into(),
            sender_key: "k".into(),
            ciphertext: BTreeMap::new(),
        };
        assert!(decrypt_to_device(&bob, "@alice:hs", &content).is_err());
    }
}
