//! One-time key management.
//!
//! The server reports how many of our signed curve25519 one-time keys it
//! still holds. When that count drops below half of what the account can
//! hold, new keys are generated, signed, and offered for upload. Keys stay
//! unpublished inside the pickled account until [`mark_keys_published`] runs
//! after a successful upload, so a failed upload re-offers the same keys.

use std::collections::BTreeMap;

use mxagent_shared::api::keys::SignedKey;
use rusqlite::Connection;
use serde_json::json;

use crate::error::CryptoError;
use crate::identity::{load_account, save_account, sign_json};
use crate::storage::{with_transaction, CryptoStore};

pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Number of keys the server should hold: half the account maximum.
pub fn target_key_count(conn: &Connection) -> Result<u64, CryptoError> {
    let store = CryptoStore::new(conn);
    let (_, account) = load_account(&store)?;
    Ok((account.max_number_of_one_time_keys() / 2) as u64)
}

/// Signed one-time keys to upload given the server's current count.
///
/// Returns an empty map if the server already holds enough keys.
pub fn keys_to_upload(
    conn: &Connection,
    server_count: u64,
) -> Result<BTreeMap<String, SignedKey>, CryptoError> {
    with_transaction(conn, |store| {
        let (row, mut account) = load_account(store)?;
        let target = (account.max_number_of_one_time_keys() / 2) as u64;
        if server_count >= target {
            return Ok(BTreeMap::new());
        }

        let pending = account.one_time_keys().len() as u64;
        let wanted = target - server_count;
        if wanted > pending {
            account.generate_one_time_keys((wanted - pending) as usize);
            save_account(store, &account)?;
        }

        let key_id = format!("ed25519:{}", row.device_id);
        let mut out = BTreeMap::new();
        for (id, public_key) in account.one_time_keys() {
            let key = public_key.to_base64();
            let signature = sign_json(&account, &json!({ "key": key }))?;
            let mut signatures = BTreeMap::new();
            signatures.insert(
                row.user_id.clone(),
                BTreeMap::from([(key_id.clone(), signature)]),
            );
            out.insert(
                format!("{SIGNED_CURVE25519}:{}", id.to_base64()),
                SignedKey { key, signatures },
            );
        }

        tracing::debug!(server_count, target, offered = out.len(), "one-time keys prepared");
        Ok(out)
    })
}

/// Record that every pending one-time key reached the server.
pub fn mark_keys_published(conn: &Connection) -> Result<(), CryptoError> {
    with_transaction(conn, |store| {
        let (_, mut account) = load_account(store)?;
        account.mark_keys_as_published();
        save_account(store, &account)
    })
}

/// Count reported for our key algorithm in a sync or upload response.
pub fn signed_key_count(counts: &BTreeMap<String, u64>) -> u64 {
    counts.get(SIGNED_CURVE25519).copied().unwrap_or(0)
}
