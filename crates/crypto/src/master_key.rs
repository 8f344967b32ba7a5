//! Database key management for the agent's crypto store.
//!
//! A 32-byte master key comes from the OS keychain, from a 0600 key file on
//! headless hosts, or from an operator passphrase via Argon2id. It is derived
//! into the SQLCipher key with HKDF-SHA256.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::CryptoError;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const KEYCHAIN_SERVICE: &str = "org.mxagent.crypto";
const DB_KEY_INFO: &[u8] = b"mxagent-db-encryption-v1";

/// A 32-byte master key, securely wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    fn random() -> Self {
        let mut key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut key);
        MasterKey { key }
    }

    fn from_hex(hex_string: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex_decode(hex_string.trim())
            .ok_or_else(|| CryptoError::InvalidKey("malformed master key".into()))?;
        if bytes.len() != 32 {
            bytes.zeroize();
            return Err(CryptoError::InvalidKey("malformed master key".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(MasterKey { key })
    }
}

/// Hex-encoded database encryption key formatted for SQLCipher's `PRAGMA key`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DbEncryptionKey {
    hex: String,
}

impl std::fmt::Debug for DbEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbEncryptionKey")
            .field("hex", &"[REDACTED]")
            .finish()
    }
}

impl DbEncryptionKey {
    /// Returns the full `x'...'` string for use in PRAGMA statements.
    pub fn as_pragma_value(&self) -> &str {
        &self.hex
    }
}

/// Whether a database file is encrypted.
#[derive(Debug, PartialEq)]
pub enum EncryptionStatus {
    Unencrypted,
    Encrypted,
}

/// Where the master key for a store comes from.
#[derive(Clone)]
pub enum MasterKeySource {
    /// OS keychain entry named after the Matrix user id.
    Keychain { account: String },
    /// Hex key in a file readable only by the owner. Created on first use.
    File(PathBuf),
    /// Try the keychain, fall back to the key file when no keychain is reachable.
    KeychainOrFile { account: String, path: PathBuf },
    /// Operator passphrase stretched with Argon2id. The salt is kept beside the store.
    Passphrase {
        passphrase: Zeroizing<String>,
        salt_path: PathBuf,
    },
}

impl std::fmt::Debug for MasterKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterKeySource::Keychain { account } => {
                f.debug_struct("Keychain").field("account", account).finish()
            }
            MasterKeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            MasterKeySource::KeychainOrFile { account, path } => f
                .debug_struct("KeychainOrFile")
                .field("account", account)
                .field("path", path)
                .finish(),
            MasterKeySource::Passphrase { salt_path, .. } => f
                .debug_struct("Passphrase")
                .field("passphrase", &"[REDACTED]")
                .field("salt_path", salt_path)
                .finish(),
        }
    }
}

impl MasterKeySource {
    pub fn load(&self) -> Result<MasterKey, CryptoError> {
        match self {
            MasterKeySource::Keychain { account } => init_master_key_from_keychain(account),
            MasterKeySource::File(path) => init_master_key_from_file(path),
            MasterKeySource::KeychainOrFile { account, path } => {
                match init_master_key_from_keychain(account) {
                    Ok(key) => Ok(key),
                    Err(CryptoError::KeychainUnavailable) => {
                        tracing::info!(path = %path.display(), "keychain unavailable, using key file");
                        init_master_key_from_file(path)
                    }
                    Err(e) => Err(e),
                }
            }
            MasterKeySource::Passphrase {
                passphrase,
                salt_path,
            } => {
                let salt = load_or_create_salt(salt_path)?;
                init_master_key_from_passphrase(passphrase, &salt)
            }
        }
    }

    /// Remove the stored master key. Missing entries are not an error.
    pub fn destroy(&self) -> Result<(), CryptoError> {
        match self {
            MasterKeySource::Keychain { account } => delete_keychain_entry(account),
            MasterKeySource::File(path) => remove_key_file(path),
            MasterKeySource::KeychainOrFile { account, path } => {
                match delete_keychain_entry(account) {
                    Ok(()) | Err(CryptoError::KeychainUnavailable) => {}
                    Err(e) => return Err(e),
                }
                remove_key_file(path)
            }
            MasterKeySource::Passphrase { salt_path, .. } => remove_key_file(salt_path),
        }
    }
}

fn load_or_create_salt(path: &Path) -> Result<Vec<u8>, CryptoError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => hex_decode(contents.trim())
            .filter(|salt| salt.len() >= 16)
            .ok_or_else(|| CryptoError::InvalidKey("malformed salt file".into())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let salt = generate_salt();
            write_private_file(path, hex_encode(&salt).as_bytes())?;
            Ok(salt.to_vec())
        }
        Err(e) => Err(CryptoError::StorageError(e.to_string())),
    }
}

/// Retrieve or generate a master key via the OS keychain.
///
/// On first run, generates 32 random bytes and stores them in the keychain.
/// On subsequent runs, retrieves the stored key.
pub fn init_master_key_from_keychain(account: &str) -> Result<MasterKey, CryptoError> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account)
        .map_err(|_| CryptoError::KeychainUnavailable)?;

    match entry.get_password() {
        Ok(hex_string) => {
            let hex_string = Zeroizing::new(hex_string);
            MasterKey::from_hex(&hex_string)
                .map_err(|_| CryptoError::KeychainError("malformed master key in keychain".into()))
        }
        Err(keyring::Error::NoEntry) => {
            let key = MasterKey::random();
            let hex_string = Zeroizing::new(hex_encode(key.as_bytes()));
            entry.set_password(&hex_string).map_err(CryptoError::from)?;
            Ok(key)
        }
        Err(e) => Err(CryptoError::from(e)),
    }
}

fn delete_keychain_entry(account: &str) -> Result<(), CryptoError> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account)
        .map_err(|_| CryptoError::KeychainUnavailable)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(CryptoError::from(e)),
    }
}

/// Read the master key from `path`, creating it with mode 0600 if missing.
pub fn init_master_key_from_file(path: &Path) -> Result<MasterKey, CryptoError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let contents = Zeroizing::new(contents);
            MasterKey::from_hex(&contents)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = MasterKey::random();
            let hex_string = Zeroizing::new(hex_encode(key.as_bytes()));
            write_private_file(path, hex_string.as_bytes())?;
            Ok(key)
        }
        Err(e) => Err(CryptoError::StorageError(format!(
            "cannot read key file {}: {e}",
            path.display()
        ))),
    }
}

fn remove_key_file(path: &Path) -> Result<(), CryptoError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CryptoError::StorageError(e.to_string())),
    }
}

/// Create `path` with owner-only permissions and write `contents`.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CryptoError::StorageError(e.to_string()))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| CryptoError::StorageError(format!("cannot write {}: {e}", path.display())))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| CryptoError::StorageError(e.to_string()))
}

/// Derive a master key from an operator passphrase and salt via Argon2id.
pub fn init_master_key_from_passphrase(
    passphrase: &str,
    salt: &[u8],
) -> Result<MasterKey, CryptoError> {
    if salt.len() < 16 {
        return Err(CryptoError::InvalidKey("salt too short".into()));
    }

    let params = argon2::Params::new(65536, 3, 4, Some(32))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    Ok(MasterKey { key: output })
}

/// Generate a random 16-byte salt for passphrase derivation.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);
    salt
}

/// Derive a database encryption key from a master key via HKDF-SHA256.
pub fn derive_db_encryption_key(master_key: &MasterKey) -> Result<DbEncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, master_key.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(DB_KEY_INFO, okm.as_mut())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let hex_str = Zeroizing::new(hex_encode(okm.as_ref()));
    Ok(DbEncryptionKey {
        hex: format!("x'{}'", hex_str.as_str()),
    })
}

/// Apply a SQLCipher encryption key to a database connection.
pub fn apply_encryption_key(
    conn: &rusqlite::Connection,
    db_key: &DbEncryptionKey,
) -> Result<(), CryptoError> {
    // x'...' is a SQL literal; as a bound parameter SQLCipher would treat it
    // as a passphrase and run PBKDF2 over it.
    conn.execute_batch(&format!("PRAGMA key = \"{}\";", db_key.as_pragma_value()))?;

    let cipher_version: String = conn
        .pragma_query_value(None, "cipher_version", |row| row.get(0))
        .map_err(|_| CryptoError::StorageError("SQLCipher not available".into()))?;

    if cipher_version.is_empty() {
        return Err(CryptoError::StorageError("SQLCipher not available".into()));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(())
}

/// Detect whether a database is encrypted or unencrypted.
pub fn detect_encryption_status(
    conn: &rusqlite::Connection,
) -> Result<EncryptionStatus, CryptoError> {
    match conn.execute_batch("SELECT count(*) FROM sqlite_master") {
        Ok(()) => Ok(EncryptionStatus::Unencrypted),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.extended_code == 26 => {
            Ok(EncryptionStatus::Encrypted)
        }
        Err(e) => Err(CryptoError::StorageError(e.to_string())),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
