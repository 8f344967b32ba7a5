//! mxagent: a Matrix agent device with end-to-end encryption.
//!
//! The library holds everything behind the CLI so integration tests can
//! drive it against a mock homeserver: configuration, the on-disk store,
//! the homeserver client, sync, the crypto session manager, interactive
//! verification and key recovery.

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod http;
pub mod lock;
pub mod manager;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod sync;
pub mod verification;

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
