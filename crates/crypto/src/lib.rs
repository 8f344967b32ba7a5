//! mxagent-crypto: Olm/Megolm session management for a Matrix agent device.
//!
//! Keeps the device account, pairwise Olm sessions, Megolm room sessions,
//! per-device trust, pending decryption gaps, SAS verification state, and
//! key-backup decryption. State lives in encrypted SQLite (SQLCipher).

pub mod error;
pub mod master_key;
pub mod storage;
pub mod identity;
pub mod prekeys;
pub mod session;
pub mod message;
pub mod group;
pub mod devices;
pub mod trust;
pub mod sas;
pub mod backup;
pub mod fingerprint;

pub(crate) mod util;
