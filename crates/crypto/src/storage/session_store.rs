//! Pairwise Olm sessions, keyed by session id and indexed by peer curve25519 key.

use crate::error::CryptoError;
use crate::storage::CryptoStore;
use crate::util::now_secs;

#[derive(Debug, Clone)]
pub struct OlmSessionRow {
    pub session_id: String,
    pub peer_key: String,
    pub pickle: String,
    pub last_used_at: i64,
}

impl CryptoStore<'_> {
    pub fn save_olm_session(
        &self,
        peer_key: &str,
        session_id: &str,
        pickle: &str,
    ) -> Result<(), CryptoError> {
        let now = now_secs();
        self.conn.execute(
            "INSERT INTO crypto_olm_sessions (session_id, peer_key, pickle, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                 pickle = excluded.pickle,
                 last_used_at = excluded.last_used_at",
            rusqlite::params![session_id, peer_key, pickle, now],
        )?;
        Ok(())
    }

    /// Sessions with `peer_key`, most recently used first.
    pub fn load_olm_sessions(&self, peer_key: &str) -> Result<Vec<OlmSessionRow>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, peer_key, pickle, last_used_at FROM crypto_olm_sessions
             WHERE peer_key = ?1 ORDER BY last_used_at DESC, created_at DESC",
        )?;
        let rows = stmt
            .query_map([peer_key], |row| {
                Ok(OlmSessionRow {
                    session_id: row.get(0)?,
                    peer_key: row.get(1)?,
                    pickle: row.get(2)?,
                    last_used_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn has_olm_session(&self, peer_key: &str) -> Result<bool, CryptoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_olm_sessions WHERE peer_key = ?1",
            [peer_key],
            |row| row.get(0),
        )?)
    }

    pub fn delete_olm_sessions(&self, peer_key: &str) -> Result<usize, CryptoError> {
        Ok(self.conn.execute(
            "DELETE FROM crypto_olm_sessions WHERE peer_key = ?1",
            [peer_key],
        )?)
    }

    pub fn count_olm_sessions(&self) -> Result<u64, CryptoError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM crypto_olm_sessions", [], |row| row.get(0))?)
    }

    /// Keep the `keep` most recently used sessions per peer, delete the rest.
    pub fn prune_olm_sessions(&self, keep: u32) -> Result<usize, CryptoError> {
        Ok(self.conn.execute(
            "DELETE FROM crypto_olm_sessions WHERE session_id IN (
                 SELECT session_id FROM (
                     SELECT session_id,
                            ROW_NUMBER() OVER (PARTITION BY peer_key
                                               ORDER BY last_used_at DESC, created_at DESC) AS rn
                     FROM crypto_olm_sessions
                 ) WHERE rn > ?1
             )",
            [keep],
        )?)
    }
}
