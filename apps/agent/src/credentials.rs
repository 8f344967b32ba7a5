//! On-disk layout of the agent store and the login credentials kept in it.

use std::path::{Path, PathBuf};

use mxagent_crypto::master_key::{self, MasterKeySource};
use mxagent_crypto::storage::open_store;
use mxagent_shared::error::MxError;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::AgentConfig;

const CREDENTIALS_FILE: &str = "credentials.json";
const DATABASE_FILE: &str = "crypto.db";
const LOCK_FILE: &str = ".lock";
const CODE_FILE: &str = "verification-code.txt";
const LOG_FILE: &str = "verification.log";
const KEY_FILE: &str = "db.key";
const SALT_FILE: &str = "db.salt";
const KEYCHAIN_PREFIX: &str = "mxagent";

/// Paths of everything the agent keeps under its store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, MxError> {
        Ok(Self::new(config.store_path()?))
    }

    pub fn credentials(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE)
    }

    pub fn database(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn verification_code(&self) -> PathBuf {
        self.root.join(CODE_FILE)
    }

    pub fn verification_log(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn key_file(&self) -> PathBuf {
        self.root.join(KEY_FILE)
    }

    pub fn salt_file(&self) -> PathBuf {
        self.root.join(SALT_FILE)
    }

    /// Create the store directory with owner-only permissions.
    pub fn ensure_dir(&self) -> Result<(), MxError> {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
            .map_err(|e| MxError::Storage(format!("cannot create {}: {e}", self.root.display())))
    }
}

/// Homeserver login for this device.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    pub homeserver: String,
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("homeserver", &self.homeserver)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Read `credentials.json`. Returns `None` when the agent was never set up.
    pub fn load(path: &Path) -> Result<Option<Self>, MxError> {
        let contents = match std::fs::read(path) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MxError::Storage(format!("cannot read {}: {e}", path.display())))
            }
        };
        let creds = serde_json::from_slice(&contents)
            .map_err(|e| MxError::Config(format!("malformed {}: {e}", path.display())))?;
        Ok(Some(creds))
    }

    /// Write `credentials.json` readable only by the owner.
    pub fn save(&self, path: &Path) -> Result<(), MxError> {
        let json = Zeroizing::new(serde_json::to_vec_pretty(self)?);
        master_key::write_private_file(path, &json)?;
        tracing::debug!(path = %path.display(), "credentials saved");
        Ok(())
    }

    pub fn remove(path: &Path) -> Result<(), MxError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MxError::Storage(format!("cannot remove {}: {e}", path.display()))),
        }
    }
}

/// Where the database master key comes from, per `db_key_source`.
pub fn master_key_source(
    config: &AgentConfig,
    paths: &StorePaths,
    user_id: &str,
) -> Result<MasterKeySource, MxError> {
    let account = format!("{KEYCHAIN_PREFIX}:{user_id}");
    let source = match config.db_key_source.as_str() {
        "keychain" => MasterKeySource::Keychain { account },
        "file" => MasterKeySource::File(paths.key_file()),
        "passphrase" => {
            let passphrase = std::env::var("MXAGENT_DB_PASSPHRASE").map_err(|_| {
                MxError::Config("db_key_source is \"passphrase\" but MXAGENT_DB_PASSPHRASE is unset".into())
            })?;
            MasterKeySource::Passphrase {
                passphrase: Zeroizing::new(passphrase),
                salt_path: paths.salt_file(),
            }
        }
        _ => MasterKeySource::KeychainOrFile {
            account,
            path: paths.key_file(),
        },
    };
    Ok(source)
}

/// Open the encrypted crypto database, creating it if needed.
pub fn open_database(source: &MasterKeySource, paths: &StorePaths) -> Result<Connection, MxError> {
    let master = source.load()?;
    let db_key = master_key::derive_db_encryption_key(&master)?;
    let conn = open_store(&paths.database(), &db_key)?;
    tracing::debug!(path = %paths.database().display(), "crypto store opened");
    Ok(conn)
}

/// Delete the database and its key material.
pub fn destroy_database(source: &MasterKeySource, paths: &StorePaths) -> Result<(), MxError> {
    for path in [paths.database(), paths.database().with_extension("db-journal")] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(MxError::Storage(format!("cannot remove {}: {e}", path.display())))
            }
        }
    }
    source.destroy()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn creds() -> Credentials {
        Credentials {
            homeserver: "https://hs.example".into(),
            user_id: "@bot:hs.example".into(),
            device_id: "AGENTDEV".into(),
            access_token: "syt_secret".into(),
        }
    }

    #[test]
    fn credentials_round_trip_with_private_mode() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        creds().save(&paths.credentials()).unwrap();

        let mode = std::fs::metadata(paths.credentials()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Credentials::load(&paths.credentials()).unwrap(), Some(creds()));
    }

    #[test]
    fn missing_credentials_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        assert_eq!(Credentials::load(&paths.credentials()).unwrap(), None);
        Credentials::remove(&paths.credentials()).unwrap();
    }

    #[test]
    fn malformed_credentials_are_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        std::fs::write(paths.credentials(), b"{ not json").unwrap();
        assert!(matches!(
            Credentials::load(&paths.credentials()),
            Err(MxError::Config(_))
        ));
    }

    #[test]
    fn debug_redacts_token() {
        let out = format!("{:?}", creds());
        assert!(!out.contains("syt_secret"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn store_layout() {
        let paths = StorePaths::new("/var/lib/mxagent");
        assert_eq!(paths.database(), PathBuf::from("/var/lib/mxagent/crypto.db"));
        assert_eq!(paths.lock(), PathBuf::from("/var/lib/mxagent/.lock"));
        assert_eq!(
            paths.verification_code(),
            PathBuf::from("/var/lib/mxagent/verification-code.txt")
        );
    }

    #[test]
    fn file_keyed_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path().join("store"));
        paths.ensure_dir().unwrap();
        let source = MasterKeySource::File(paths.key_file());

        {
            let conn = open_database(&source, &paths).unwrap();
            mxagent_crypto::storage::CryptoStore::new(&conn)
                .set_sync_token("s1")
                .unwrap();
        }
        let conn = open_database(&source, &paths).unwrap();
        assert_eq!(
            mxagent_crypto::storage::CryptoStore::new(&conn).sync_token().unwrap(),
            Some("s1".to_string())
        );

        destroy_database(&source, &paths).unwrap();
        assert!(!paths.database().exists());
        assert!(!paths.key_file().exists());
    }
}
