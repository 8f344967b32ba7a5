//! Matrix event types, algorithm names, and protocol constants.

pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";
pub const BACKUP_ALGORITHM: &str = "m.megolm_backup.v1.curve25519-aes-sha2";
pub const SECRET_STORAGE_ALGORITHM: &str = "m.secret_storage.v1.aes-hmac-sha2";
pub const PBKDF2_ALGORITHM: &str = "m.pbkdf2";

pub const EVENT_ROOM_ENCRYPTED: &str = "m.room.encrypted";
pub const EVENT_ROOM_MESSAGE: &str = "m.room.message";
pub const EVENT_ROOM_MEMBER: &str = "m.room.member";
pub const EVENT_ROOM_ENCRYPTION: &str = "m.room.encryption";
pub const EVENT_ROOM_KEY: &str = "m.room_key";
pub const EVENT_FORWARDED_ROOM_KEY: &str = "m.forwarded_room_key";
pub const EVENT_ROOM_KEY_REQUEST: &str = "m.room_key_request";
pub const EVENT_DUMMY: &str = "m.dummy";

pub const VERIFICATION_REQUEST: &str = "m.key.verification.request";
pub const VERIFICATION_READY: &str = "m.key.verification.ready";
pub const VERIFICATION_START: &str = "m.key.verification.start";
pub const VERIFICATION_ACCEPT: &str = "m.key.verification.accept";
pub const VERIFICATION_KEY: &str = "m.key.verification.key";
pub const VERIFICATION_MAC: &str = "m.key.verification.mac";
pub const VERIFICATION_DONE: &str = "m.key.verification.done";
pub const VERIFICATION_CANCEL: &str = "m.key.verification.cancel";

pub const SAS_METHOD: &str = "m.sas.v1";
pub const SAS_KEY_AGREEMENT: &str = "curve25519-hkdf-sha256";
pub const SAS_HASH: &str = "sha256";
pub const SAS_MAC_METHOD: &str = "hkdf-hmac-sha256.v2";

pub const ACCOUNT_DATA_DEFAULT_KEY: &str = "m.secret_storage.default_key";
pub const ACCOUNT_DATA_KEY_PREFIX: &str = "m.secret_storage.key.";
pub const SECRET_MEGOLM_BACKUP: &str = "m.megolm_backup.v1";

/// Body shown in place of an event whose room key is missing.
pub const UNABLE_TO_DECRYPT: &str = "[Unable to decrypt]";

/// Default display name for a device created by `setup`.
pub const DEFAULT_DEVICE_NAME_PREFIX: &str = "mxagent E2EE";
