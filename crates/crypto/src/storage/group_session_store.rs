//! Megolm sessions: one outbound per room, inbound keyed by (room, session id),
//! and the record of which devices received each outbound session.

use rusqlite::OptionalExtension;

use crate::error::CryptoError;
use crate::storage::CryptoStore;
use crate::util::now_secs;

#[derive(Debug, Clone)]
pub struct OutboundSessionRow {
    pub room_id: String,
    pub session_id: String,
    pub pickle: String,
    pub message_count: u64,
    pub max_messages: u64,
    pub max_age_secs: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct InboundSessionRow {
    pub room_id: String,
    pub session_id: String,
    pub sender_key: String,
    pub pickle: String,
    pub first_known_index: u32,
    pub origin: String,
}

impl CryptoStore<'_> {
    pub fn save_outbound_session(&self, row: &OutboundSessionRow) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_outbound_group_sessions
                 (room_id, session_id, pickle, message_count, max_messages, max_age_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(room_id) DO UPDATE SET
                 session_id = excluded.session_id,
                 pickle = excluded.pickle,
                 message_count = excluded.message_count,
                 max_messages = excluded.max_messages,
                 max_age_secs = excluded.max_age_secs,
                 created_at = excluded.created_at",
            rusqlite::params![
                row.room_id,
                row.session_id,
                row.pickle,
                row.message_count as i64,
                row.max_messages as i64,
                row.max_age_secs as i64,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_outbound_session(
        &self,
        room_id: &str,
    ) -> Result<Option<OutboundSessionRow>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT room_id, session_id, pickle, message_count, max_messages, max_age_secs, created_at
                 FROM crypto_outbound_group_sessions WHERE room_id = ?1",
                [room_id],
                |row| {
                    Ok(OutboundSessionRow {
                        room_id: row.get(0)?,
                        session_id: row.get(1)?,
                        pickle: row.get(2)?,
                        message_count: row.get::<_, i64>(3)? as u64,
                        max_messages: row.get::<_, i64>(4)? as u64,
                        max_age_secs: row.get::<_, i64>(5)? as u64,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    /// Drop the room's outbound session and its share records.
    pub fn discard_outbound_session(&self, room_id: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "DELETE FROM crypto_outbound_group_shares WHERE room_id = ?1",
            [room_id],
        )?;
        self.conn.execute(
            "DELETE FROM crypto_outbound_group_sessions WHERE room_id = ?1",
            [room_id],
        )?;
        Ok(())
    }

    pub fn record_share(
        &self,
        room_id: &str,
        session_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO crypto_outbound_group_shares
                 (room_id, session_id, user_id, device_id, shared_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![room_id, session_id, user_id, device_id, now_secs()],
        )?;
        Ok(())
    }

    /// `(user_id, device_id)` pairs that received `session_id`.
    pub fn shared_devices(&self, session_id: &str) -> Result<Vec<(String, String)>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, device_id FROM crypto_outbound_group_shares
             WHERE session_id = ?1 ORDER BY user_id, device_id",
        )?;
        let rows = stmt
            .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn save_inbound_session(&self, row: &InboundSessionRow) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_inbound_group_sessions
                 (room_id, session_id, sender_key, pickle, first_known_index, origin, imported_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(room_id, session_id) DO UPDATE SET
                 sender_key = excluded.sender_key,
                 pickle = excluded.pickle,
                 first_known_index = excluded.first_known_index,
                 origin = excluded.origin,
                 imported_at = excluded.imported_at",
            rusqlite::params![
                row.room_id,
                row.session_id,
                row.sender_key,
                row.pickle,
                row.first_known_index,
                row.origin,
                now_secs(),
            ],
        )?;
        Ok(())
    }

    pub fn load_inbound_session(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<InboundSessionRow>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT room_id, session_id, sender_key, pickle, first_known_index, origin
                 FROM crypto_inbound_group_sessions WHERE room_id = ?1 AND session_id = ?2",
                [room_id, session_id],
                |row| {
                    Ok(InboundSessionRow {
                        room_id: row.get(0)?,
                        session_id: row.get(1)?,
                        sender_key: row.get(2)?,
                        pickle: row.get(3)?,
                        first_known_index: row.get(4)?,
                        origin: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    /// Inbound sessions held for a room, keyed by session id.
    pub fn inbound_session_ids(&self, room_id: &str) -> Result<Vec<String>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id FROM crypto_inbound_group_sessions WHERE room_id = ?1 ORDER BY session_id",
        )?;
        let rows = stmt
            .query_map([room_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `(room_id, session count)` over every room with inbound sessions.
    pub fn inbound_session_counts(&self) -> Result<Vec<(String, u64)>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT room_id, COUNT(*) FROM crypto_inbound_group_sessions
             GROUP BY room_id ORDER BY room_id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
