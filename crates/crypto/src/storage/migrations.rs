//! Crypto store migrations, tracked in `_crypto_migrations`.

use crate::error::CryptoError;
use rusqlite::Connection;

const MIGRATIONS: &[(i32, &str)] = &[(1, MIGRATION_001), (2, MIGRATION_002)];

const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS crypto_account (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    user_id       TEXT NOT NULL,
    device_id     TEXT NOT NULL,
    pickle        TEXT NOT NULL,
    keys_uploaded INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_olm_sessions (
    session_id   TEXT PRIMARY KEY,
    peer_key     TEXT NOT NULL,
    pickle       TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_olm_sessions_peer ON crypto_olm_sessions (peer_key);

CREATE TABLE IF NOT EXISTS crypto_outbound_group_sessions (
    room_id       TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL,
    pickle        TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    max_messages  INTEGER NOT NULL,
    max_age_secs  INTEGER NOT NULL,
    created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_outbound_group_shares (
    room_id    TEXT NOT NULL,
    session_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    device_id  TEXT NOT NULL,
    shared_at  INTEGER NOT NULL,
    PRIMARY KEY (session_id, user_id, device_id)
);

CREATE TABLE IF NOT EXISTS crypto_inbound_group_sessions (
    room_id           TEXT NOT NULL,
    session_id        TEXT NOT NULL,
    sender_key        TEXT NOT NULL,
    pickle            TEXT NOT NULL,
    first_known_index INTEGER NOT NULL,
    origin            TEXT NOT NULL,
    imported_at       INTEGER NOT NULL,
    PRIMARY KEY (room_id, session_id)
);

CREATE TABLE IF NOT EXISTS crypto_devices (
    user_id        TEXT NOT NULL,
    device_id      TEXT NOT NULL,
    curve25519_key TEXT NOT NULL,
    ed25519_key    TEXT NOT NULL,
    display_name   TEXT,
    trust          TEXT NOT NULL DEFAULT 'unverified',
    first_seen_at  INTEGER NOT NULL,
    last_seen_at   INTEGER NOT NULL,
    verified_at    INTEGER,
    deleted        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, device_id)
);

CREATE INDEX IF NOT EXISTS idx_devices_curve ON crypto_devices (curve25519_key);

CREATE TABLE IF NOT EXISTS crypto_tracked_users (
    user_id TEXT PRIMARY KEY,
    dirty   INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS crypto_decryption_gaps (
    room_id           TEXT NOT NULL,
    session_id        TEXT NOT NULL,
    sender_key        TEXT NOT NULL,
    first_seen_at     INTEGER NOT NULL,
    last_requested_at INTEGER,
    request_count     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (room_id, session_id)
);

CREATE TABLE IF NOT EXISTS crypto_gap_events (
    room_id       TEXT NOT NULL,
    session_id    TEXT NOT NULL,
    event_id      TEXT NOT NULL,
    message_index INTEGER,
    PRIMARY KEY (room_id, event_id),
    FOREIGN KEY (room_id, session_id)
        REFERENCES crypto_decryption_gaps (room_id, session_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS crypto_sync_state (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    next_batch TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_config (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

const MIGRATION_002: &str = "
CREATE TABLE IF NOT EXISTS crypto_key_requests (
    request_id TEXT PRIMARY KEY,
    room_id    TEXT NOT NULL,
    session_id TEXT NOT NULL,
    sender_key TEXT NOT NULL,
    sent_at    INTEGER NOT NULL,
    state      TEXT NOT NULL DEFAULT 'sent'
);

CREATE INDEX IF NOT EXISTS idx_key_requests_session
    ON crypto_key_requests (room_id, session_id);
";

pub fn run_crypto_migrations(conn: &Connection) -> Result<(), CryptoError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _crypto_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _crypto_migrations",
        [],
        |row| row.get(0),
    )?;

    for &(version, sql) in MIGRATIONS {
        if version > current_version {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO _crypto_migrations (version) VALUES (?1)",
                [version],
            )?;
            tx.commit()?;
            tracing::debug!(version, "applied crypto migration");
        }
    }

    Ok(())
}
