//! Crypto storage layer over an SQLCipher connection.
//!
//! `CryptoStore` borrows a connection and exposes typed accessors per table
//! family (account, Olm sessions, group sessions, devices, gaps). Multi-row
//! updates go through [`with_transaction`].

pub mod migrations;
pub mod account_store;
pub mod session_store;
pub mod group_session_store;
pub mod device_store;
pub mod gap_store;

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use crate::error::CryptoError;
use crate::master_key::{
    apply_encryption_key, detect_encryption_status, DbEncryptionKey, EncryptionStatus,
};
use crate::util::now_secs;

/// Thin handle over a borrowed connection.
pub struct CryptoStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl<'a> CryptoStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn store_config(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM crypto_config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Last `next_batch` token whose effects are committed.
    pub fn sync_token(&self) -> Result<Option<String>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT next_batch FROM crypto_sync_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_sync_token(&self, next_batch: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_sync_state (id, next_batch, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET next_batch = excluded.next_batch,
                                           updated_at = excluded.updated_at",
            rusqlite::params![next_batch, now_secs()],
        )?;
        Ok(())
    }
}

/// Run `f` inside one SQLite savepoint. Any error rolls back every write `f` made.
///
/// Calls nest: an inner failure rolls back only the inner writes, and nothing
/// is committed until the outermost call returns `Ok`.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&CryptoStore<'_>) -> Result<T, CryptoError>,
) -> Result<T, CryptoError> {
    conn.execute_batch("SAVEPOINT crypto_tx")?;
    let store = CryptoStore::new(conn);
    match f(&store) {
        Ok(value) => {
            conn.execute_batch("RELEASE crypto_tx")?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK TO crypto_tx; RELEASE crypto_tx") {
                tracing::error!(error = %rollback, "savepoint rollback failed");
            }
            Err(err)
        }
    }
}

/// Open (or create) the encrypted store at `path` and bring its schema up to date.
///
/// Refuses to open an existing plaintext database.
pub fn open_store(path: &Path, db_key: &DbEncryptionKey) -> Result<Connection, CryptoError> {
    let existed = path.exists();
    let conn = Connection::open(path)?;

    if existed && detect_encryption_status(&conn)? == EncryptionStatus::Unencrypted {
        let has_tables: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master",
            [],
            |row| row.get(0),
        )?;
        if has_tables {
            return Err(CryptoError::StorageError(format!(
                "{} is not encrypted",
                path.display()
            )));
        }
    }

    apply_encryption_key(&conn, db_key)?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.execute_batch("SELECT count(*) FROM sqlite_master")
        .map_err(|_| CryptoError::StorageError("wrong database key".into()))?;
    migrations::run_crypto_migrations(&conn)?;
    Ok(conn)
}

/// Create an in-memory SQLCipher database with migrations applied.
#[cfg(test)]
pub(crate) fn init_test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "PRAGMA key = \"x'0000000000000000000000000000000000000000000000000000000000000000'\";",
    )
    .unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    migrations::run_crypto_migrations(&conn).unwrap();
    conn
}
