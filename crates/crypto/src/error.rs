//! Error types for the mxagent-crypto crate.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided key material is invalid (wrong length, malformed, etc.).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Decryption failed (wrong key, tampered ciphertext, etc.).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// No Olm session exists for the given curve25519 key.
    #[error("olm session not found for key: {peer_key}")]
    SessionNotFound { peer_key: String },

    /// Every stored session failed to decrypt a normal message.
    #[error("olm session corrupted for key {peer_key}: {detail}")]
    SessionCorrupted { peer_key: String, detail: String },

    /// No device account has been created yet.
    #[error("identity not initialized")]
    IdentityNotInitialized,

    #[error("identity already exists")]
    IdentityAlreadyExists,

    /// Recipients without an Olm session, formatted as `user device`.
    #[error("no olm session established with: {}", .missing.join(", "))]
    NoSessionEstablished { missing: Vec<String> },

    #[error("no outbound session for {room_id}")]
    NoOutboundSession { room_id: String },

    /// The outbound room session hit its rotation limit and must be replaced first.
    #[error("outbound session for {room_id} must be rotated")]
    RotationDue { room_id: String },

    #[error("invalid device signature for {user_id} {device_id}")]
    SignatureInvalid { user_id: String, device_id: String },

    /// A known device announced a different ed25519 key.
    #[error("ed25519 key changed for {user_id} {device_id}")]
    DeviceKeyChanged { user_id: String, device_id: String },

    #[error("unknown device {user_id} {device_id}")]
    UnknownDevice { user_id: String, device_id: String },

    #[error("verification already in progress with {user_id} {device_id}")]
    TransactionInProgress { user_id: String, device_id: String },

    #[error("unknown verification transaction: {0}")]
    UnknownTransaction(String),

    /// Peer sent a verification message that does not fit the current state.
    #[error("verification protocol error: {0}")]
    VerificationProtocol(String),

    #[error("invalid recovery credential: {0}")]
    InvalidRecoveryCredential(String),

    #[error("backup error: {0}")]
    BackupError(String),

    /// Error from the Olm/Megolm layer.
    #[error("olm error: {0}")]
    OlmError(String),

    /// Database storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// OS keychain operation failed.
    #[error("keychain error: {0}")]
    KeychainError(String),

    /// No credential found in OS keychain for the requested entry.
    #[error("keychain entry not found")]
    KeychainEntryNotFound,

    /// OS keychain is not available on this host; triggers the key-file fallback.
    #[error("keychain unavailable")]
    KeychainUnavailable,

    /// A passphrase is required but was not provided.
    #[error("passphrase required")]
    PassphraseRequired,

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        CryptoError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl From<vodozemac::KeyError> for CryptoError {
    fn from(err: vodozemac::KeyError) -> Self {
        CryptoError::InvalidKey(err.to_string())
    }
}

impl From<keyring::Error> for CryptoError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => CryptoError::KeychainEntryNotFound,
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                CryptoError::KeychainUnavailable
            }
            other => CryptoError::KeychainError(other.to_string()),
        }
    }
}

impl From<CryptoError> for mxagent_shared::error::MxError {
    fn from(err: CryptoError) -> Self {
        use mxagent_shared::error::MxError;
        match err {
            CryptoError::NoSessionEstablished { missing } => {
                MxError::NoSessionEstablished { missing }
            }
            CryptoError::TransactionInProgress { user_id, device_id } => {
                MxError::TransactionInProgress { user_id, device_id }
            }
            CryptoError::InvalidRecoveryCredential(msg) => MxError::InvalidRecoveryCredential(msg),
            CryptoError::IdentityNotInitialized => {
                MxError::NotConfigured("no device identity in the local store".into())
            }
            CryptoError::StorageError(msg) => MxError::Storage(msg),
            CryptoError::KeychainError(_)
            | CryptoError::KeychainEntryNotFound
            | CryptoError::KeychainUnavailable
            | CryptoError::PassphraseRequired => MxError::Storage(err.to_string()),
            other => MxError::Crypto(other.to_string()),
        }
    }
}
