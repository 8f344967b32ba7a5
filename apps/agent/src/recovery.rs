//! Getting missing room keys back.
//!
//! Two routes close decryption gaps: asking our own verified devices to
//! forward the keys, and restoring them from the server-side key backup
//! with a recovery key or passphrase. `fetch_keys` tries them in that order.
//! Both can be repeated safely; a key that is already known is left alone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use mxagent_crypto::backup::{
    decrypt_secret, derive_secret_storage_key, BackupDecryptionKey, RecoveryCredential,
};
use mxagent_crypto::group::{self, IngestOutcome, KeyOrigin, RoomKeyMaterial};
use mxagent_crypto::storage::gap_store::PendingGap;
use mxagent_shared::api::room_keys::{
    BackupVersionResponse, EncryptedSecret, RoomKeysResponse, SecretStorageDefaultKey,
    SecretStorageKeyDescription,
};
use mxagent_shared::constants::{
    ACCOUNT_DATA_DEFAULT_KEY, ACCOUNT_DATA_KEY_PREFIX, BACKUP_ALGORITHM, MEGOLM_ALGORITHM,
    SECRET_MEGOLM_BACKUP,
};
use mxagent_shared::error::MxError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::manager::CryptoManager;
use crate::sync::SyncEngine;

const DEFAULT_POLL: Duration = Duration::from_secs(5);

type Progress = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ForwardingReport {
    pub requested: usize,
    pub target_devices: usize,
    pub keys_received: usize,
    pub requests_cancelled: usize,
    pub gaps_remaining: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub backup_version: String,
    pub rooms: usize,
    pub keys_imported: usize,
    pub keys_known: usize,
    pub keys_failed: usize,
    pub gaps_remaining: usize,
}

/// Outcome of `fetch_keys`: forwarding first, then the backup if asked.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FetchReport {
    /// Timeline events read to find undecryptable messages.
    pub scanned: usize,
    pub forwarding: ForwardingReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<RestoreReport>,
    pub gaps_remaining: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    /// How many recent events of the room to scan before asking.
    pub scan_limit: u32,
    /// How long to sync while devices answer.
    pub window: Duration,
    pub min_interval: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            scan_limit: 100,
            window: Duration::from_secs(60),
            min_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupStatus {
    pub backup: Option<BackupVersionResponse>,
    /// Inbound session count per room held locally.
    pub local_sessions: BTreeMap<String, u64>,
    pub pending_gaps: usize,
}

/// Rooms with gaps, in the order their first gap was seen.
fn gap_rooms(gaps: &[PendingGap]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered: Vec<&PendingGap> = gaps.iter().collect();
    ordered.sort_by_key(|g| g.first_seen_at);
    ordered
        .into_iter()
        .filter(|g| seen.insert(g.room_id.clone()))
        .map(|g| g.room_id.clone())
        .collect()
}

fn gaps_in_scope(gaps: Vec<PendingGap>, room_id: Option<&str>) -> Vec<PendingGap> {
    gaps.into_iter()
        .filter(|g| room_id.is_none_or(|r| g.room_id == r))
        .collect()
}

pub struct KeyRecovery {
    manager: Arc<CryptoManager>,
    sync: Arc<SyncEngine>,
    poll: Duration,
    progress: Progress,
}

impl KeyRecovery {
    pub fn new(manager: Arc<CryptoManager>, sync: Arc<SyncEngine>) -> Self {
        Self {
            manager,
            sync,
            poll: DEFAULT_POLL,
            progress: Arc::new(|_| {}),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Receive one line per step of a restore or forwarding round.
    pub fn on_progress(mut self, progress: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    fn report(&self, line: &str) {
        tracing::info!("{line}");
        (self.progress)(line);
    }

    /// Ask our verified devices for the keys of outstanding gaps and sync for
    /// up to `window` while they answer. Requests still open afterwards are
    /// withdrawn. Gaps requested within `min_interval` are not asked again.
    pub async fn recover_by_forwarding(
        &self,
        room: Option<&str>,
        window: Duration,
        min_interval: Duration,
    ) -> Result<ForwardingReport, MxError> {
        let room_id = match room {
            Some(r) => Some(self.manager.resolve_room(r).await?),
            None => None,
        };
        let room_id = room_id.as_deref();
        let wanted: BTreeSet<(String, String)> = gaps_in_scope(self.manager.pending_gaps()?, room_id)
            .into_iter()
            .map(|g| (g.room_id, g.session_id))
            .collect();

        let round = self
            .manager
            .request_keys_for_gaps(room_id, min_interval)
            .await?;
        let mut report = ForwardingReport {
            requested: round.request_ids.len(),
            target_devices: round.target_devices,
            ..ForwardingReport::default()
        };
        if round.request_ids.is_empty() {
            report.gaps_remaining = wanted.len();
            if round.target_devices == 0 && !wanted.is_empty() {
                self.report("no verified device of ours to ask for keys; verify one first");
            }
            return Ok(report);
        }
        self.report(&format!(
            "requested {} room keys from {} devices",
            report.requested, report.target_devices
        ));

        let mut received = 0;
        let manager = &self.manager;
        self.sync
            .sync_until(manager, Instant::now() + window, self.poll, |outcome| {
                received += outcome
                    .keys_ingested
                    .iter()
                    .filter(|k| wanted.contains(*k))
                    .count();
                Ok(gaps_in_scope(manager.pending_gaps()?, room_id).is_empty())
            })
            .await?;
        report.keys_received = received;

        report.requests_cancelled = self.manager.cancel_key_requests(&round.request_ids).await?;
        report.gaps_remaining = gaps_in_scope(self.manager.pending_gaps()?, room_id).len();
        self.report(&format!(
            "received {} keys, {} gaps remain",
            report.keys_received, report.gaps_remaining
        ));
        Ok(report)
    }

    /// Scan `room` for undecryptable events, ask our verified devices for
    /// their keys, and fall back to the key backup with `backup` when
    /// gaps are left. A server without a backup ends the fallback quietly.
    pub async fn fetch_keys(
        &self,
        room: Option<&str>,
        options: &FetchOptions,
        backup: Option<&RecoveryCredential>,
    ) -> Result<FetchReport, MxError> {
        let room_id = match room {
            Some(r) => Some(self.manager.resolve_room(r).await?),
            None => None,
        };
        let room_id = room_id.as_deref();
        let mut report = FetchReport::default();
        if let Some(room_id) = room_id {
            report.scanned = self.manager.read(room_id, options.scan_limit).await?.len();
            self.report(&format!("scanned {} events in {room_id}", report.scanned));
        }

        report.forwarding = self
            .recover_by_forwarding(room_id, options.window, options.min_interval)
            .await?;
        report.gaps_remaining = report.forwarding.gaps_remaining;
        let Some(credential) = backup else {
            return Ok(report);
        };
        if report.gaps_remaining == 0 {
            return Ok(report);
        }

        self.report("keys still missing; trying the key backup");
        match self.restore_from_backup(credential, false).await {
            Ok(restored) => report.backup = Some(restored),
            Err(MxError::NoBackupConfigured) => {
                self.report("no key backup on the server");
                return Ok(report);
            }
            Err(e) => return Err(e),
        }
        report.gaps_remaining = gaps_in_scope(self.manager.pending_gaps()?, room_id).len();
        Ok(report)
    }

    async fn account_data<T: DeserializeOwned>(&self, event_type: &str) -> Result<Option<T>, MxError> {
        let user_id = self.manager.user_id();
        let api = self.manager.api();
        let value = self
            .manager
            .retry()
            .run("account data", || api.account_data(user_id, event_type))
            .await?;
        value.map(serde_json::from_value).transpose().map_err(MxError::from)
    }

    /// The current backup and the private key that opens it.
    async fn unlock_backup(
        &self,
        credential: &RecoveryCredential,
    ) -> Result<(BackupVersionResponse, BackupDecryptionKey), MxError> {
        let api = self.manager.api();
        let version = self
            .manager
            .retry()
            .run("backup version", || api.backup_version())
            .await?
            .ok_or(MxError::NoBackupConfigured)?;
        if version.algorithm != BACKUP_ALGORITHM {
            return Err(MxError::Protocol(format!(
                "unsupported backup algorithm {}",
                version.algorithm
            )));
        }

        let default_key: SecretStorageDefaultKey = self
            .account_data(ACCOUNT_DATA_DEFAULT_KEY)
            .await?
            .ok_or(MxError::NoBackupConfigured)?;
        let description: SecretStorageKeyDescription = self
            .account_data(&format!("{ACCOUNT_DATA_KEY_PREFIX}{}", default_key.key))
            .await?
            .ok_or(MxError::NoBackupConfigured)?;
        let secret: EncryptedSecret = self
            .account_data(SECRET_MEGOLM_BACKUP)
            .await?
            .ok_or(MxError::NoBackupConfigured)?;
        let encrypted = secret
            .encrypted
            .get(&default_key.key)
            .ok_or(MxError::NoBackupConfigured)?;

        let storage_key = derive_secret_storage_key(credential, &description)?;
        let plaintext = decrypt_secret(&storage_key, SECRET_MEGOLM_BACKUP, encrypted)?;
        let key = BackupDecryptionKey::from_secret(&plaintext)?;
        key.check_public_key(&version.auth_data.public_key)?;
        tracing::debug!(version = %version.version, "backup key unlocked");
        Ok((version, key))
    }

    /// Restore room keys from the server backup. Only rooms with gaps are
    /// fetched unless `all_rooms` is set.
    pub async fn restore_from_backup(
        &self,
        credential: &RecoveryCredential,
        all_rooms: bool,
    ) -> Result<RestoreReport, MxError> {
        let (version, key) = self.unlock_backup(credential).await?;
        let mut report = RestoreReport {
            backup_version: version.version.clone(),
            ..RestoreReport::default()
        };

        let scopes: Vec<Option<String>> = if all_rooms {
            vec![None]
        } else {
            gap_rooms(&self.manager.pending_gaps()?)
                .into_iter()
                .map(Some)
                .collect()
        };
        if scopes.is_empty() {
            self.report("no decryption gaps; nothing to restore");
            return Ok(report);
        }

        let api = self.manager.api();
        for scope in scopes {
            let backup: RoomKeysResponse = self
                .manager
                .retry()
                .run("room keys", || api.room_keys(&version.version, scope.as_deref()))
                .await?;
            for (room_id, room) in &backup.rooms {
                report.rooms += 1;
                let (imported, known, failed) = self.import_room(&key, room_id.as_str(), room)?;
                report.keys_imported += imported;
                report.keys_known += known;
                report.keys_failed += failed;
                self.report(&format!(
                    "{room_id}: {imported} imported, {known} already known, {failed} failed"
                ));
            }
        }

        report.gaps_remaining = self.manager.pending_gaps()?.len();
        self.report(&format!(
            "restored {} keys from backup version {}, {} gaps remain",
            report.keys_imported, report.backup_version, report.gaps_remaining
        ));
        Ok(report)
    }

    fn import_room(
        &self,
        key: &BackupDecryptionKey,
        room_id: &str,
        room: &mxagent_shared::api::room_keys::RoomKeyBackup,
    ) -> Result<(usize, usize, usize), MxError> {
        let (mut imported, mut known, mut failed) = (0, 0, 0);
        for (session_id, data) in &room.sessions {
            let entry = match key.decrypt_entry(&data.session_data) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(room_id, session_id = %session_id, error = %e, "backup entry did not decrypt");
                    failed += 1;
                    continue;
                }
            };
            if entry.algorithm != MEGOLM_ALGORITHM {
                tracing::debug!(room_id, algorithm = %entry.algorithm, "skipping backup entry");
                continue;
            }
            let outcome = self.manager.with_store(|conn| {
                group::ingest_room_key(
                    conn,
                    room_id,
                    session_id,
                    &entry.sender_key,
                    RoomKeyMaterial::Exported(&entry.session_key),
                    KeyOrigin::Backup,
                )
            });
            match outcome {
                Ok(IngestOutcome::Unchanged) => known += 1,
                Ok(_) => imported += 1,
                Err(e) => {
                    tracing::warn!(room_id, session_id = %session_id, error = %e, "backup key rejected");
                    failed += 1;
                }
            }
        }
        Ok((imported, known, failed))
    }

    pub async fn backup_status(&self) -> Result<BackupStatus, MxError> {
        let api = self.manager.api();
        let backup = self
            .manager
            .retry()
            .run("backup version", || api.backup_version())
            .await?;
        Ok(BackupStatus {
            backup,
            local_sessions: self.manager.inbound_session_counts()?,
            pending_gaps: self.manager.pending_gaps()?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(room: &str, session: &str, first_seen_at: i64) -> PendingGap {
        PendingGap {
            room_id: room.into(),
            session_id: session.into(),
            sender_key: "sk".into(),
            first_seen_at,
            last_requested_at: None,
            request_count: 0,
            event_ids: vec![],
            index_range: None,
        }
    }

    #[test]
    fn gap_rooms_are_unique_and_oldest_first() {
        let gaps = vec![
            gap("!b:hs", "s1", 30),
            gap("!a:hs", "s2", 10),
            gap("!b:hs", "s3", 5),
            gap("!a:hs", "s4", 40),
        ];
        assert_eq!(gap_rooms(&gaps), vec!["!b:hs".to_string(), "!a:hs".to_string()]);
    }

    #[test]
    fn scope_filters_by_room() {
        let gaps = vec![gap("!a:hs", "s1", 0), gap("!b:hs", "s2", 0)];
        assert_eq!(gaps_in_scope(gaps.clone(), None).len(), 2);
        let only_a = gaps_in_scope(gaps, Some("!a:hs"));
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].session_id, "s1");
    }
}
