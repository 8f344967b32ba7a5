//! Device list tracking and ingestion of `/keys/query` results.
//!
//! Device keys are accepted only when their ed25519 self-signature verifies.
//! A known device that shows up with a different ed25519 key is rejected:
//! the stored record, its trust, and its Olm sessions stay as they were.

use std::collections::BTreeMap;

use mxagent_shared::api::keys::DeviceKeys;
use mxagent_shared::ids::DeviceId;
use rusqlite::Connection;

use crate::error::CryptoError;
use crate::identity::{own_identity, verify_json};
use crate::storage::device_store::DeviceRecord;
use crate::storage::{with_transaction, CryptoStore};
use crate::trust::{TrustPolicy, TrustState};

/// What changed for one user after ingesting a query response.
#[derive(Debug, Default)]
pub struct DeviceListUpdate {
    pub new_devices: Vec<DeviceRecord>,
    pub removed_devices: Vec<String>,
    /// `(device_id, reason)` for device keys that were refused.
    pub rejected: Vec<(String, CryptoError)>,
}

fn check_device(
    store: &CryptoStore<'_>,
    user_id: &str,
    device_id: &str,
    keys: &DeviceKeys,
) -> Result<(String, String), CryptoError> {
    let invalid = || CryptoError::SignatureInvalid {
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
    };
    if keys.user_id.as_str() != user_id || keys.device_id.as_str() != device_id {
        return Err(invalid());
    }
    let (Some(curve), Some(ed)) = (keys.curve25519(), keys.ed25519()) else {
        return Err(invalid());
    };
    let value = serde_json::to_value(keys)?;
    verify_json(&value, user_id, &format!("ed25519:{device_id}"), ed).map_err(|_| invalid())?;

    if let Some(existing) = store.get_device(user_id, device_id)? {
        if existing.ed25519_key != ed {
            return Err(CryptoError::DeviceKeyChanged {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
            });
        }
    }
    Ok((curve.to_string(), ed.to_string()))
}

/// Store the device keys returned for `user_id`.
///
/// Devices of the user that are missing from `devices` are flagged deleted.
/// The user is marked clean afterwards.
pub fn ingest_device_keys(
    conn: &Connection,
    user_id: &str,
    devices: &BTreeMap<DeviceId, DeviceKeys>,
    now: i64,
) -> Result<DeviceListUpdate, CryptoError> {
    with_transaction(conn, |store| {
        let mut update = DeviceListUpdate::default();
        let mut present = Vec::new();

        for (device_id, keys) in devices {
            let device_id = device_id.as_str();
            let (curve, ed) = match check_device(store, user_id, device_id, keys) {
                Ok(checked) => checked,
                Err(e) => {
                    tracing::warn!(user_id, device_id, error = %e, "rejected device keys");
                    // A device whose key changed keeps its old record alive.
                    if matches!(e, CryptoError::DeviceKeyChanged { .. }) {
                        present.push(device_id.to_string());
                    }
                    update.rejected.push((device_id.to_string(), e));
                    continue;
                }
            };
            present.push(device_id.to_string());

            let existing = store.get_device(user_id, device_id)?;
            let record = DeviceRecord {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                curve25519_key: curve,
                ed25519_key: ed,
                display_name: keys.display_name().map(str::to_string),
                trust: existing.as_ref().map_or(TrustState::Unverified, |d| d.trust),
                first_seen_at: existing.as_ref().map_or(now, |d| d.first_seen_at),
                last_seen_at: now,
                verified_at: existing.as_ref().and_then(|d| d.verified_at),
                deleted: false,
            };
            store.upsert_device(&record)?;
            if existing.is_none() {
                tracing::info!(user_id, device_id, "new device");
                update.new_devices.push(record);
            }
        }

        update.removed_devices = store.mark_missing_devices_deleted(user_id, &present)?;
        for device_id in &update.removed_devices {
            tracing::info!(user_id, device_id = %device_id, "device removed");
        }
        store.mark_user_clean(user_id)?;
        Ok(update)
    })
}

/// Record our own device as verified so it is never offered for verification
/// and never treated as a stranger.
pub fn record_own_device(conn: &Connection, now: i64) -> Result<(), CryptoError> {
    let identity = own_identity(conn)?;
    with_transaction(conn, |store| {
        store.upsert_device(&DeviceRecord {
            user_id: identity.user_id.clone(),
            device_id: identity.device_id.clone(),
            curve25519_key: identity.curve25519.clone(),
            ed25519_key: identity.ed25519.clone(),
            display_name: None,
            trust: TrustState::Verified,
            first_seen_at: now,
            last_seen_at: now,
            verified_at: Some(now),
            deleted: false,
        })?;
        store.set_device_trust(&identity.user_id, &identity.device_id, TrustState::Verified)?;
        store.track_user(&identity.user_id)
    })
}

/// Start following the device lists of `users`. New users start dirty.
pub fn track_users(conn: &Connection, users: &[String]) -> Result<(), CryptoError> {
    with_transaction(conn, |store| {
        for user in users {
            store.track_user(user)?;
        }
        Ok(())
    })
}

/// Apply `device_lists` from a sync response.
///
/// Changed users are re-queried later. Users we no longer share a room with
/// are dropped and their devices flagged deleted.
pub fn apply_device_list_changes(
    conn: &Connection,
    changed: &[String],
    left: &[String],
) -> Result<(), CryptoError> {
    with_transaction(conn, |store| {
        for user in changed {
            store.mark_user_dirty(user)?;
        }
        for user in left {
            store.untrack_user(user)?;
            store.mark_missing_devices_deleted(user, &[])?;
        }
        Ok(())
    })
}

pub fn users_needing_query(conn: &Connection) -> Result<Vec<String>, CryptoError> {
    CryptoStore::new(conn).dirty_users()
}

/// Live devices of `users` that may receive room keys under `policy`,
/// excluding our own device.
pub fn recipient_devices(
    conn: &Connection,
    users: &[String],
    policy: TrustPolicy,
) -> Result<Vec<DeviceRecord>, CryptoError> {
    let identity = own_identity(conn)?;
    let store = CryptoStore::new(conn);
    let mut out = Vec::new();
    for user in users {
        for device in store.devices_for_user(user)? {
            if device.user_id == identity.user_id && device.device_id == identity.device_id {
                continue;
            }
            if policy.allows(&device) {
                out.push(device);
            } else {
                tracing::debug!(device = %device.label(), trust = %device.trust, "device excluded by trust policy");
            }
        }
    }
    Ok(out)
}

pub fn list_devices(conn: &Connection, user_id: &str) -> Result<Vec<DeviceRecord>, CryptoError> {
    CryptoStore::new(conn).devices_for_user(user_id)
}
