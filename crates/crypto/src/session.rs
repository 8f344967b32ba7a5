//! Pairwise Olm session management.
//!
//! Outbound sessions are created from a claimed one-time key after checking
//! the key's signature against the device's ed25519 key. Inbound sessions are
//! created in [`crate::message`] when a pre-key message arrives.

use mxagent_shared::api::keys::SignedKey;
use rusqlite::Connection;
use serde_json::Value;
use vodozemac::olm::{Session, SessionConfig, SessionPickle};
use vodozemac::Curve25519PublicKey;

use crate::error::CryptoError;
use crate::identity::{load_account, verify_json};
use crate::storage::device_store::DeviceRecord;
use crate::storage::{with_transaction, CryptoStore};

/// Result of resetting a broken session.
#[derive(Debug, PartialEq)]
pub enum RecoveryAction {
    /// Sessions were deleted. The caller should claim a fresh one-time key
    /// and establish a new session.
    SessionReset,
    /// Nothing to reset.
    NoSession,
}

pub(crate) fn load_sessions(
    store: &CryptoStore<'_>,
    peer_key: &str,
) -> Result<Vec<Session>, CryptoError> {
    store
        .load_olm_sessions(peer_key)?
        .into_iter()
        .map(|row| {
            let pickle: SessionPickle = serde_json::from_str(&row.pickle)?;
            Ok(Session::from(pickle))
        })
        .collect()
}

pub(crate) fn save_session(
    store: &CryptoStore<'_>,
    peer_key: &str,
    session: &Session,
) -> Result<(), CryptoError> {
    let pickle = serde_json::to_string(&session.pickle())?;
    store.save_olm_session(peer_key, &session.session_id(), &pickle)
}

/// Create and store an outbound session to `peer_identity_key` using a
/// one-time key claimed from the server. Returns the new session id.
pub fn create_outbound_session(
    conn: &Connection,
    peer_identity_key: &str,
    one_time_key: &str,
) -> Result<String, CryptoError> {
    let identity_key = Curve25519PublicKey::from_base64(peer_identity_key)?;
    let otk = Curve25519PublicKey::from_base64(one_time_key)?;

    with_transaction(conn, |store| {
        let (_, account) = load_account(store)?;
        let session = account.create_outbound_session(SessionConfig::version_1(), identity_key, otk);
        save_session(store, peer_identity_key, &session)?;
        tracing::debug!(peer_key = peer_identity_key, session_id = %session.session_id(), "created outbound olm session");
        Ok(session.session_id())
    })
}

/// Establish a session with `device` from a key returned by `/keys/claim`.
///
/// The one-time key must carry a valid signature from the device's ed25519
/// key, otherwise the claim is rejected.
pub fn establish_from_claim(
    conn: &Connection,
    device: &DeviceRecord,
    claimed: &SignedKey,
) -> Result<String, CryptoError> {
    let value: Value = serde_json::to_value(claimed)?;
    let key_id = format!("ed25519:{}", device.device_id);
    verify_json(&value, &device.user_id, &key_id, &device.ed25519_key).map_err(|_| {
        CryptoError::SignatureInvalid {
            user_id: device.user_id.clone(),
            device_id: device.device_id.clone(),
        }
    })?;
    create_outbound_session(conn, &device.curve25519_key, &claimed.key)
}

pub fn has_session(conn: &Connection, peer_key: &str) -> Result<bool, CryptoError> {
    CryptoStore::new(conn).has_olm_session(peer_key)
}

/// Drop every session with `peer_key` after it stopped decrypting.
pub fn recover_session(conn: &Connection, peer_key: &str) -> Result<RecoveryAction, CryptoError> {
    let deleted = CryptoStore::new(conn).delete_olm_sessions(peer_key)?;
    if deleted == 0 {
        return Ok(RecoveryAction::NoSession);
    }
    tracing::warn!(peer_key, deleted, "reset olm sessions");
    Ok(RecoveryAction::SessionReset)
}

/// Keep at most `keep` sessions per peer. Returns how many were removed.
pub fn prune_sessions(conn: &Connection, keep: u32) -> Result<usize, CryptoError> {
    CryptoStore::new(conn).prune_olm_sessions(keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{generate_identity, own_identity};
    use crate::prekeys::keys_to_upload;
    use crate::storage::init_test_db;
    use crate::trust::TrustState;

    fn bob_device(conn: &Connection) -> DeviceRecord {
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

    fn claimed_key(conn: &Connection) -> SignedKey {
        keys_to_upload(conn, 0).unwrap().into_values().next().unwrap()
    }

    #[test]
    fn establish_from_claim_creates_session() {
        let alice = init_test_db();
        let bob = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();

        let device = bob_device(&bob);
        let session_id = establish_from_claim(&alice, &device, &claimed_key(&bob)).unwrap();
        assert!(!session_id.is_empty());
        assert!(has_session(&alice, &device.curve25519_key).unwrap());
    }

    #[test]
    fn claim_signed_by_someone_else_is_rejected() {
        let alice = init_test_db();
        let bob = init_test_db();
        let mallory = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        generate_identity(&mallory, "@bob:hs", "B").unwrap();

        let device = bob_device(&bob);
        let result = establish_from_claim(&alice, &device, &claimed_key(&mallory));
        assert!(matches!(result, Err(CryptoError::SignatureInvalid { .. })));
        assert!(!has_session(&alice, &device.curve25519_key).unwrap());
    }

    #[test]
    fn invalid_key_material_is_rejected() {
        let alice = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        assert!(create_outbound_session(&alice, "not-a-key", "also-not").is_err());
    }

    #[test]
    fn recover_session_deletes_all_sessions_for_peer() {
        let alice = init_test_db();
        let bob = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        let device = bob_device(&bob);
        establish_from_claim(&alice, &device, &claimed_key(&bob)).unwrap();

        assert_eq!(
            recover_session(&alice, &device.curve25519_key).unwrap(),
            RecoveryAction::SessionReset
        );
        assert!(!has_session(&alice, &device.curve25519_key).unwrap());
        assert_eq!(
            recover_session(&alice, &device.curve25519_key).unwrap(),
            RecoveryAction::NoSession
        );
    }

    #[test]
    fn prune_keeps_newest_sessions() {
        let alice = init_test_db();
        let bob = init_test_db();
        generate_identity(&alice, "@alice:hs", "A").unwrap();
        generate_identity(&bob, "@bob:hs", "B").unwrap();
        let device = bob_device(&bob);

        let keys: Vec<SignedKey> = keys_to_upload(&bob, 0).unwrap().into_values().take(3).collect();
        for key in &keys {
            establish_from_claim(&alice, &device, key).unwrap();
        }
        assert_eq!(CryptoStore::new(&alice).count_olm_sessions().unwrap(), 3);
        assert_eq!(prune_sessions(&alice, 1).unwrap(), 2);
        assert_eq!(CryptoStore::new(&alice).count_olm_sessions().unwrap(), 1);
    }
}
