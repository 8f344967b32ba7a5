//! Device identity: the Olm account, its identity keys, and signed device keys.
//!
//! The account is created once per device at setup and persisted as a
//! vodozemac pickle in the encrypted store. Device keys are signed over
//! canonical JSON with the account's ed25519 key.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, VerifyingKey};
use mxagent_shared::api::keys::DeviceKeys;
use mxagent_shared::constants::{MEGOLM_ALGORITHM, OLM_ALGORITHM};
use rusqlite::Connection;
use serde_json::Value;
use vodozemac::olm::{Account, AccountPickle};

use crate::error::CryptoError;
use crate::storage::account_store::AccountRow;
use crate::storage::{with_transaction, CryptoStore};
use crate::util::decode_b64;

/// Public identity of this device.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnIdentity {
    pub user_id: String,
    pub device_id: String,
    pub curve25519: String,
    pub ed25519: String,
}

/// Create a fresh Olm account for `user_id`/`device_id` and store it.
///
/// Returns an error if an account already exists, since replacing it would
/// orphan every session established with the old keys.
pub fn generate_identity(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
) -> Result<OwnIdentity, CryptoError> {
    let account = Account::new();
    let pickle = serde_json::to_string(&account.pickle())?;

    with_transaction(conn, |store| {
        if store.has_account()? {
            return Err(CryptoError::IdentityAlreadyExists);
        }
        store.store_account(user_id, device_id, &pickle)
    })?;

    tracing::info!(user_id, device_id, "created device account");
    Ok(identity_of(&account, user_id, device_id))
}

pub(crate) fn load_account(store: &CryptoStore<'_>) -> Result<(AccountRow, Account), CryptoError> {
    let row = store.load_account()?;
    let pickle: AccountPickle = serde_json::from_str(&row.pickle)?;
    let account = Account::from(pickle);
    Ok((row, account))
}

pub(crate) fn save_account(store: &CryptoStore<'_>, account: &Account) -> Result<(), CryptoError> {
    let pickle = serde_json::to_string(&account.pickle())?;
    store.update_account_pickle(&pickle)
}

fn identity_of(account: &Account, user_id: &str, device_id: &str) -> OwnIdentity {
    OwnIdentity {
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        curve25519: account.curve25519_key().to_base64(),
        ed25519: account.ed25519_key().to_base64(),
    }
}

/// Identity keys of the stored account.
///
/// Returns `CryptoError::IdentityNotInitialized` if setup has not run.
pub fn own_identity(conn: &Connection) -> Result<OwnIdentity, CryptoError> {
    let store = CryptoStore::new(conn);
    let (row, account) = load_account(&store)?;
    Ok(identity_of(&account, &row.user_id, &row.device_id))
}

pub fn has_identity(conn: &Connection) -> Result<bool, CryptoError> {
    CryptoStore::new(conn).has_account()
}

/// Signed `device_keys` object for `/keys/upload`.
pub fn device_keys(conn: &Connection) -> Result<DeviceKeys, CryptoError> {
    let store = CryptoStore::new(conn);
    let (row, account) = load_account(&store)?;

    let mut keys = BTreeMap::new();
    keys.insert(
        format!("curve25519:{}", row.device_id),
        account.curve25519_key().to_base64(),
    );
    keys.insert(
        format!("ed25519:{}", row.device_id),
        account.ed25519_key().to_base64(),
    );

    let mut device_keys = DeviceKeys {
        user_id: row.user_id.as_str().into(),
        device_id: row.device_id.as_str().into(),
        algorithms: vec![OLM_ALGORITHM.into(), MEGOLM_ALGORITHM.into()],
        keys,
        signatures: BTreeMap::new(),
        unsigned: None,
    };
    let value = serde_json::to_value(&device_keys)?;
    let signature = sign_json(&account, &value)?;
    device_keys
        .signatures
        .entry(row.user_id.clone())
        .or_default()
        .insert(format!("ed25519:{}", row.device_id), signature);
    Ok(device_keys)
}

pub fn device_keys_uploaded(conn: &Connection) -> Result<bool, CryptoError> {
    Ok(CryptoStore::new(conn).load_account()?.keys_uploaded)
}

pub fn mark_device_keys_uploaded(conn: &Connection) -> Result<(), CryptoError> {
    CryptoStore::new(conn).set_keys_uploaded(true)
}

/// Matrix canonical JSON: sorted keys, no insignificant whitespace,
/// `signatures` and `unsigned` removed.
pub fn canonical_json(value: &Value) -> Result<String, CryptoError> {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        map.remove("signatures");
        map.remove("unsigned");
    }
    // serde_json's Map is a BTreeMap here, so keys serialize in sorted order.
    Ok(serde_json::to_string(&value)?)
}

/// Base64 ed25519 signature of the canonical form of `value`.
pub(crate) fn sign_json(account: &Account, value: &Value) -> Result<String, CryptoError> {
    let canonical = canonical_json(value)?;
    Ok(account.sign(canonical.as_str()).to_base64())
}

/// Check `value.signatures[user_id][key_id]` against `ed25519_key`.
pub fn verify_json(
    value: &Value,
    user_id: &str,
    key_id: &str,
    ed25519_key: &str,
) -> Result<(), CryptoError> {
    let signature_b64 = value
        .get("signatures")
        .and_then(|s| s.get(user_id))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
        .ok_or_else(|| CryptoError::InvalidKey(format!("no signature {key_id} by {user_id}")))?;

    let key_bytes: [u8; 32] = decode_b64(ed25519_key)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ed25519 key must be 32 bytes".into()))?;
    let sig_bytes: [u8; 64] = decode_b64(signature_b64)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ed25519 signature must be 64 bytes".into()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    let canonical = canonical_json(value)?;
    verifying_key
        .verify_strict(canonical.as_bytes(), &signature)
        .map_err(|e| CryptoError::InvalidKey(format!("bad signature: {e}")))
}
