//! Opening the agent for one operation.
//!
//! Every command goes through [`AgentSession::open`] (or [`setup`] and
//! [`logout`]): take the store lock, load credentials, open the crypto
//! database and make sure this device's keys are on the server. The lock
//! is held until the session is dropped.

use std::sync::Arc;
use std::time::Duration;

use mxagent_crypto::devices;
use mxagent_crypto::fingerprint::format_fingerprint;
use mxagent_crypto::identity;
use mxagent_crypto::storage::device_store::DeviceRecord;
use mxagent_crypto::trust::TrustState;
use mxagent_shared::api::auth::LoginRequest;
use mxagent_shared::error::MxError;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::bridge::FileBridge;
use crate::config::AgentConfig;
use crate::credentials::{self, Credentials, StorePaths};
use crate::http::{MatrixApi, MatrixClient};
use crate::lock::StoreLock;
use crate::manager::{BatchOutcome, CryptoManager, ManagerSettings};
use crate::recovery::KeyRecovery;
use crate::sync::SyncEngine;
use crate::verification::{VerificationObserver, Verifier};

fn settings(config: &AgentConfig) -> ManagerSettings {
    ManagerSettings {
        trust_policy: config.trust_policy(),
        rotation: config.rotation_policy(),
        retry: config.retry_policy(),
    }
}

fn require_homeserver(config: &AgentConfig) -> Result<&str, MxError> {
    if config.homeserver.is_empty() {
        return Err(MxError::NotConfigured(
            "no homeserver; set `homeserver` or MATRIX_HOMESERVER".into(),
        ));
    }
    Ok(&config.homeserver)
}

async fn lock_store(config: &AgentConfig) -> Result<(StorePaths, StoreLock), MxError> {
    let paths = StorePaths::from_config(config)?;
    paths.ensure_dir()?;
    let lock = StoreLock::acquire(&paths.lock(), config.lock_timeout()).await?;
    Ok((paths, lock))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupReport {
    pub user_id: String,
    pub device_id: String,
    pub display_name: String,
    pub fingerprint: String,
}

/// Log in with a password, creating a new device, and give it fresh keys.
///
/// Refuses to run over an existing setup; `logout` first.
pub async fn setup(config: &AgentConfig, password: Zeroizing<String>) -> Result<SetupReport, MxError> {
    let homeserver = require_homeserver(config)?;
    if config.user_id.is_empty() {
        return Err(MxError::NotConfigured(
            "no user id; set `user_id` or MATRIX_USER_ID".into(),
        ));
    }
    let (paths, _lock) = lock_store(config).await?;
    if let Some(existing) = Credentials::load(&paths.credentials())? {
        return Err(MxError::Config(format!(
            "already set up as {} {}; run `logout` first",
            existing.user_id, existing.device_id
        )));
    }

    let display_name = config.device_name();
    let mut client = MatrixClient::new(homeserver, None)?;
    let request = LoginRequest::password(&config.user_id, &password, Some(display_name.clone()));
    let login = client.login(&request).await?;
    drop(request);
    tracing::info!(user_id = %login.user_id, device_id = %login.device_id, "logged in");

    let creds = Credentials {
        homeserver: homeserver.to_string(),
        user_id: login.user_id.to_string(),
        device_id: login.device_id.to_string(),
        access_token: login.access_token.clone(),
    };
    let source = credentials::master_key_source(config, &paths, &creds.user_id)?;
    let mut conn = credentials::open_database(&source, &paths)?;
    if identity::has_identity(&conn)? {
        tracing::warn!("discarding crypto store left over from a previous device");
        drop(conn);
        credentials::destroy_database(&source, &paths)?;
        conn = credentials::open_database(&source, &paths)?;
    }
    let own = identity::generate_identity(&conn, &creds.user_id, &creds.device_id)?;
    devices::record_own_device(&conn, crate::now_secs())?;
    creds.save(&paths.credentials())?;

    client.set_access_token(creds.access_token.clone());
    let manager = CryptoManager::new(conn, Arc::new(client), settings(config))?;
    manager.ensure_device_keys_uploaded().await?;

    Ok(SetupReport {
        user_id: own.user_id,
        device_id: own.device_id,
        display_name,
        fingerprint: format_fingerprint(&own.ed25519)?,
    })
}

/// Log the device out and delete the local store. Succeeds when nothing is
/// set up. A failed server-side logout is logged and does not stop the
/// local cleanup.
pub async fn logout(config: &AgentConfig) -> Result<Option<Credentials>, MxError> {
    let (paths, _lock) = lock_store(config).await?;
    let Some(creds) = Credentials::load(&paths.credentials())? else {
        return Ok(None);
    };

    match MatrixClient::new(&creds.homeserver, Some(creds.access_token.clone())) {
        Ok(client) => {
            if let Err(e) = client.logout().await {
                tracing::warn!(error = %e, "server-side logout failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "cannot reach homeserver for logout"),
    }

    let source = credentials::master_key_source(config, &paths, &creds.user_id)?;
    credentials::destroy_database(&source, &paths)?;
    FileBridge::for_store(&paths).clear_code()?;
    Credentials::remove(&paths.credentials())?;
    tracing::info!(user_id = %creds.user_id, device_id = %creds.device_id, "logged out");
    Ok(Some(creds))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub homeserver: String,
    pub user_id: String,
    pub device_id: String,
    pub curve25519: String,
    pub fingerprint: String,
    pub trust_policy: String,
    pub synced: bool,
    pub pending_gaps: usize,
    pub verified_own_devices: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub display_name: Option<String>,
    pub trust: String,
    pub fingerprint: String,
    pub current: bool,
}

impl DeviceSummary {
    fn from_record(record: &DeviceRecord, own_device: &str) -> Result<Self, MxError> {
        Ok(Self {
            device_id: record.device_id.clone(),
            display_name: record.display_name.clone(),
            trust: record.trust.as_str().to_string(),
            fingerprint: format_fingerprint(&record.ed25519_key)?,
            current: record.device_id == own_device,
        })
    }
}

/// An opened agent: store locked, crypto manager and sync engine ready.
pub struct AgentSession {
    config: AgentConfig,
    paths: StorePaths,
    credentials: Credentials,
    manager: Arc<CryptoManager>,
    sync: Arc<SyncEngine>,
    _lock: StoreLock,
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("paths", &self.paths)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl AgentSession {
    /// Open the store for one operation.
    ///
    /// Without a credentials file, a configured access token is accepted:
    /// its device is looked up with `whoami` and given fresh keys.
    pub async fn open(config: AgentConfig) -> Result<Self, MxError> {
        let (paths, lock) = lock_store(&config).await?;

        let (creds, adopted) = match Credentials::load(&paths.credentials())? {
            Some(creds) => (creds, false),
            None => (adopt_access_token(&config).await?, true),
        };
        if !config.user_id.is_empty() && config.user_id != creds.user_id {
            return Err(MxError::Config(format!(
                "store belongs to {}, configured user is {}",
                creds.user_id, config.user_id
            )));
        }

        let source = credentials::master_key_source(&config, &paths, &creds.user_id)?;
        let conn = credentials::open_database(&source, &paths)?;
        if !identity::has_identity(&conn)? {
            if !adopted {
                return Err(MxError::NotConfigured(
                    "credentials exist but the crypto store is empty; run `logout` then `setup`".into(),
                ));
            }
            identity::generate_identity(&conn, &creds.user_id, &creds.device_id)?;
            devices::record_own_device(&conn, crate::now_secs())?;
            tracing::info!(device_id = %creds.device_id, "created keys for access-token device");
        }

        let api: Arc<dyn MatrixApi> = Arc::new(MatrixClient::new(
            &creds.homeserver,
            Some(creds.access_token.clone()),
        )?);
        let manager = Arc::new(CryptoManager::new(conn, Arc::clone(&api), settings(&config))?);
        if manager.device_id() != creds.device_id {
            return Err(MxError::Storage(format!(
                "crypto store is for device {}, credentials for {}",
                manager.device_id(),
                creds.device_id
            )));
        }
        manager.ensure_device_keys_uploaded().await?;
        if adopted {
            creds.save(&paths.credentials())?;
        }

        let sync = Arc::new(SyncEngine::new(
            api,
            config.retry_policy(),
            config.operation_timeout(),
        ));
        Ok(Self {
            config,
            paths,
            credentials: creds,
            manager,
            sync,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn manager(&self) -> &Arc<CryptoManager> {
        &self.manager
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    /// Apply whatever the server has queued without long-polling.
    pub async fn catch_up(&self) -> Result<BatchOutcome, MxError> {
        self.sync.sync_once(&self.manager, Duration::ZERO).await
    }

    pub fn status(&self) -> Result<StatusReport, MxError> {
        let own = self.manager.identity();
        let verified_own_devices = self
            .manager
            .devices_of(&own.user_id)?
            .iter()
            .filter(|d| d.device_id != own.device_id && d.trust == TrustState::Verified && !d.deleted)
            .count();
        Ok(StatusReport {
            homeserver: self.credentials.homeserver.clone(),
            user_id: own.user_id.clone(),
            device_id: own.device_id.clone(),
            curve25519: own.curve25519.clone(),
            fingerprint: format_fingerprint(&own.ed25519)?,
            trust_policy: self.config.trust_policy.clone(),
            synced: self.manager.sync_token()?.is_some(),
            pending_gaps: self.manager.pending_gaps()?.len(),
            verified_own_devices,
        })
    }

    /// Our own devices as the server currently lists them.
    pub async fn devices(&self) -> Result<Vec<DeviceSummary>, MxError> {
        let own = self.manager.identity();
        self.manager.invalidate_devices(&own.user_id)?;
        self.manager.refresh_device_lists().await?;
        self.manager
            .devices_of(&own.user_id)?
            .iter()
            .filter(|d| !d.deleted)
            .map(|d| DeviceSummary::from_record(d, &own.device_id))
            .collect()
    }

    pub fn verifier(&self, observer: Arc<dyn VerificationObserver>, timeout: Duration) -> Verifier {
        Verifier::new(Arc::clone(&self.manager), Arc::clone(&self.sync), observer, timeout)
    }

    /// Verifier that publishes codes through the store's bridge files.
    pub fn bridged_verifier(&self, timeout: Duration) -> Verifier {
        self.verifier(Arc::new(FileBridge::for_store(&self.paths)), timeout)
    }

    pub fn recovery(&self) -> KeyRecovery {
        KeyRecovery::new(Arc::clone(&self.manager), Arc::clone(&self.sync))
    }
}

/// Credentials for the device behind a configured access token.
async fn adopt_access_token(config: &AgentConfig) -> Result<Credentials, MxError> {
    let Some(token) = config.access_token.clone() else {
        return Err(MxError::NotConfigured(
            "no credentials; run `setup` or set MATRIX_ACCESS_TOKEN".into(),
        ));
    };
    let homeserver = require_homeserver(config)?;
    let client = MatrixClient::new(homeserver, Some(token.clone()))?;
    let whoami = config.retry_policy().run("whoami", || client.whoami()).await?;
    let device_id = whoami.device_id.ok_or_else(|| {
        MxError::Config("access token is not bound to a device".into())
    })?;
    Ok(Credentials {
        homeserver: homeserver.to_string(),
        user_id: whoami.user_id.to_string(),
        device_id: device_id.to_string(),
        access_token: token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            homeserver: "http://127.0.0.1:9".into(),
            user_id: "@bot:hs".into(),
            store_dir: Some(dir.to_path_buf()),
            db_key_source: "file".into(),
            lock_timeout_secs: 1,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn open_without_credentials_or_token_is_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentSession::open(config_in(dir.path())).await.unwrap_err();
        assert!(matches!(err, MxError::NotConfigured(_)), "{err:?}");
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn setup_requires_homeserver() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            homeserver: String::new(),
            ..config_in(dir.path())
        };
        let err = setup(&config, Zeroizing::new("pw".into())).await.unwrap_err();
        assert!(matches!(err, MxError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn setup_refuses_existing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        Credentials {
            homeserver: config.homeserver.clone(),
            user_id: "@bot:hs".into(),
            device_id: "OLD".into(),
            access_token: "t".into(),
        }
        .save(&StorePaths::new(dir.path()).credentials())
        .unwrap();

        let err = setup(&config, Zeroizing::new("pw".into())).await.unwrap_err();
        assert!(matches!(err, MxError::Config(ref m) if m.contains("OLD")));
    }

    #[tokio::test]
    async fn logout_without_setup_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(logout(&config_in(dir.path())).await.unwrap(), None);
    }

    #[test]
    fn device_summary_marks_current_device() {
        let record = DeviceRecord {
            user_id: "@bot:hs".into(),
            device_id: "AGENT".into(),
            curve25519_key: "c".into(),
            ed25519_key: "A".repeat(43),
            display_name: None,
            trust: TrustState::Verified,
            first_seen_at: 0,
            last_seen_at: 0,
            verified_at: Some(0),
            deleted: false,
        };
        let summary = DeviceSummary::from_record(&record, "AGENT").unwrap();
        assert!(summary.current);
        assert_eq!(summary.trust, "verified");
        assert!(summary.fingerprint.contains(' '));
    }
}
