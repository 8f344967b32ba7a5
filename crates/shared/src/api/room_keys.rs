use std::collections::BTreeMap;

use crate::api::keys::Signatures;
use crate::ids::RoomId;
use serde::{Deserialize, Serialize};

/// `GET /room_keys/version` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupVersionResponse {
    pub version: String,
    pub algorithm: String,
    pub auth_data: BackupAuthData,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupAuthData {
    pub public_key: String,
    #[serde(default)]
    pub signatures: Signatures,
}

/// Encrypted payload of one backed-up session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    pub ephemeral: String,
    pub ciphertext: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupData {
    pub first_message_index: u32,
    #[serde(default)]
    pub forwarded_count: u32,
    #[serde(default)]
    pub is_verified: bool,
    pub session_data: EncryptedSessionData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    #[serde(default)]
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// `GET /room_keys/keys?version=` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomKeysResponse {
    #[serde(default)]
    pub rooms: BTreeMap<RoomId, RoomKeyBackup>,
}

/// Decrypted session data inside a backup entry.
#[derive(Clone, Serialize, Deserialize)]
pub struct BackedUpRoomKey {
    pub algorithm: String,
    #[serde(default)]
    pub sender_key: String,
    pub session_key: String,
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl std::fmt::Debug for BackedUpRoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackedUpRoomKey")
            .field("algorithm", &self.algorithm)
            .field("sender_key", &self.sender_key)
            .field("session_key", &"[REDACTED]")
            .finish()
    }
}

/// `m.secret_storage.default_key` account data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretStorageDefaultKey {
    pub key: String,
}

/// `m.secret_storage.key.<id>` account data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretStorageKeyDescription {
    pub algorithm: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub passphrase: Option<PassphraseInfo>,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassphraseInfo {
    pub algorithm: String,
    pub salt: String,
    pub iterations: u32,
    #[serde(default)]
    pub bits: Option<u32>,
}

/// AES-HMAC-SHA2 encrypted secret blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AesHmacSha2Encrypted {
    pub iv: String,
    pub ciphertext: String,
    pub mac: String,
}

/// Account data of a stored secret: `key_id -> encrypted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    #[serde(default)]
    pub encrypted: BTreeMap<String, AesHmacSha2Encrypted>,
}
