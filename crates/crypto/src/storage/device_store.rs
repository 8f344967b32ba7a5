//! Known devices with their identity keys and trust, plus the set of users
//! whose device lists we follow.

use rusqlite::OptionalExtension;

use crate::error::CryptoError;
use crate::storage::CryptoStore;
use crate::trust::TrustState;
use crate::util::now_secs;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub user_id: String,
    pub device_id: String,
    pub curve25519_key: String,
    pub ed25519_key: String,
    pub display_name: Option<String>,
    pub trust: TrustState,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub verified_at: Option<i64>,
    pub deleted: bool,
}

impl DeviceRecord {
    /// `user device`, as used in logs and error lists.
    pub fn label(&self) -> String {
        format!("{} {}", self.user_id, self.device_id)
    }
}

const DEVICE_COLUMNS: &str = "user_id, device_id, curve25519_key, ed25519_key, display_name, trust,
     first_seen_at, last_seen_at, verified_at, deleted";

fn map_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let trust: String = row.get(5)?;
    Ok(DeviceRecord {
        user_id: row.get(0)?,
        device_id: row.get(1)?,
        curve25519_key: row.get(2)?,
        ed25519_key: row.get(3)?,
        display_name: row.get(4)?,
        trust: TrustState::parse(&trust),
        first_seen_at: row.get(6)?,
        last_seen_at: row.get(7)?,
        verified_at: row.get(8)?,
        deleted: row.get(9)?,
    })
}

impl CryptoStore<'_> {
    /// Insert a device or refresh its keys and name. Trust is left untouched.
    pub fn upsert_device(&self, device: &DeviceRecord) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_devices
                 (user_id, device_id, curve25519_key, ed25519_key, display_name, trust,
                  first_seen_at, last_seen_at, verified_at, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT(user_id, device_id) DO UPDATE SET
                 curve25519_key = excluded.curve25519_key,
                 ed25519_key = excluded.ed25519_key,
                 display_name = excluded.display_name,
                 last_seen_at = excluded.last_seen_at,
                 deleted = 0",
            rusqlite::params![
                device.user_id,
                device.device_id,
                device.curve25519_key,
                device.ed25519_key,
                device.display_name,
                device.trust.as_str(),
                device.first_seen_at,
                device.last_seen_at,
                device.verified_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> Result<Option<DeviceRecord>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM crypto_devices WHERE user_id = ?1 AND device_id = ?2"
                ),
                [user_id, device_id],
                map_device,
            )
            .optional()?)
    }

    /// Live (non-deleted) devices of `user_id`.
    pub fn devices_for_user(&self, user_id: &str) -> Result<Vec<DeviceRecord>, CryptoError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM crypto_devices
             WHERE user_id = ?1 AND deleted = 0 ORDER BY device_id"
        ))?;
        let rows = stmt
            .query_map([user_id], map_device)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn device_by_curve_key(&self, curve_key: &str) -> Result<Option<DeviceRecord>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM crypto_devices WHERE curve25519_key = ?1
                     ORDER BY deleted ASC, last_seen_at DESC LIMIT 1"
                ),
                [curve_key],
                map_device,
            )
            .optional()?)
    }

    /// Returns false if the device is unknown.
    pub fn set_device_trust(
        &self,
        user_id: &str,
        device_id: &str,
        trust: TrustState,
    ) -> Result<bool, CryptoError> {
        let verified_at = (trust == TrustState::Verified).then(now_secs);
        let updated = self.conn.execute(
            "UPDATE crypto_devices SET trust = ?1, verified_at = ?2
             WHERE user_id = ?3 AND device_id = ?4",
            rusqlite::params![trust.as_str(), verified_at, user_id, device_id],
        )?;
        Ok(updated > 0)
    }

    /// Flag every device of `user_id` not in `present` as deleted; returns the newly deleted ids.
    pub fn mark_missing_devices_deleted(
        &self,
        user_id: &str,
        present: &[String],
    ) -> Result<Vec<String>, CryptoError> {
        let mut removed = Vec::new();
        for device in self.devices_for_user(user_id)? {
            if !present.contains(&device.device_id) {
                self.conn.execute(
                    "UPDATE crypto_devices SET deleted = 1 WHERE user_id = ?1 AND device_id = ?2",
                    [user_id, device.device_id.as_str()],
                )?;
                removed.push(device.device_id);
            }
        }
        Ok(removed)
    }

    pub fn track_user(&self, user_id: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO crypto_tracked_users (user_id, dirty) VALUES (?1, 1)",
            [user_id],
        )?;
        Ok(())
    }

    /// Only affects users already tracked.
    pub fn mark_user_dirty(&self, user_id: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_tracked_users SET dirty = 1 WHERE user_id = ?1",
            [user_id],
        )?;
        Ok(())
    }

    pub fn mark_user_clean(&self, user_id: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_tracked_users SET dirty = 0 WHERE user_id = ?1",
            [user_id],
        )?;
        Ok(())
    }

    pub fn untrack_user(&self, user_id: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "DELETE FROM crypto_tracked_users WHERE user_id = ?1",
            [user_id],
        )?;
        Ok(())
    }

    pub fn is_tracked(&self, user_id: &str) -> Result<bool, CryptoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_tracked_users WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?)
    }

    pub fn dirty_users(&self) -> Result<Vec<String>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM crypto_tracked_users WHERE dirty = 1 ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn tracked_users(&self) -> Result<Vec<String>, CryptoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM crypto_tracked_users ORDER BY user_id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
