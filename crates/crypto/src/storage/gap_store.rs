//! Pending decryption gaps and the room-key requests sent to fill them.

use rusqlite::OptionalExtension;

use crate::error::CryptoError;
use crate::storage::CryptoStore;
use crate::util::now_secs;

/// A (room, session) whose key we lack, with the events that need it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingGap {
    pub room_id: String,
    pub session_id: String,
    pub sender_key: String,
    pub first_seen_at: i64,
    pub last_requested_at: Option<i64>,
    pub request_count: u32,
    pub event_ids: Vec<String>,
    /// Lowest and highest known message index among the affected events.
    pub index_range: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRequestRow {
    pub request_id: String,
    pub room_id: String,
    pub session_id: String,
    pub sender_key: String,
    pub sent_at: i64,
    pub state: String,
}

impl CryptoStore<'_> {
    /// Record that `event_id` could not be decrypted. Returns true for a new gap.
    pub fn record_gap(
        &self,
        room_id: &str,
        session_id: &str,
        sender_key: &str,
        event_id: &str,
        message_index: Option<u32>,
    ) -> Result<bool, CryptoError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO crypto_decryption_gaps
                 (room_id, session_id, sender_key, first_seen_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![room_id, session_id, sender_key, now_secs()],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO crypto_gap_events (room_id, session_id, event_id, message_index)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![room_id, session_id, event_id, message_index],
        )?;
        Ok(inserted > 0)
    }

    pub fn has_gap(&self, room_id: &str, session_id: &str) -> Result<bool, CryptoError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM crypto_decryption_gaps WHERE room_id = ?1 AND session_id = ?2",
            [room_id, session_id],
            |row| row.get(0),
        )?)
    }

    /// Remove the gap for (room, session). Outstanding requests for it become fulfilled.
    pub fn clear_gap(&self, room_id: &str, session_id: &str) -> Result<bool, CryptoError> {
        self.conn.execute(
            "DELETE FROM crypto_gap_events WHERE room_id = ?1 AND session_id = ?2",
            [room_id, session_id],
        )?;
        let removed = self.conn.execute(
            "DELETE FROM crypto_decryption_gaps WHERE room_id = ?1 AND session_id = ?2",
            [room_id, session_id],
        )?;
        self.conn.execute(
            "UPDATE crypto_key_requests SET state = 'fulfilled'
             WHERE room_id = ?1 AND session_id = ?2 AND state = 'sent'",
            [room_id, session_id],
        )?;
        Ok(removed > 0)
    }

    /// Drop the gap events a session starting at `first_known_index` can now
    /// decrypt. The gap itself is cleared only once no events remain.
    pub fn clear_gap_from(
        &self,
        room_id: &str,
        session_id: &str,
        first_known_index: u32,
    ) -> Result<bool, CryptoError> {
        self.conn.execute(
            "DELETE FROM crypto_gap_events
             WHERE room_id = ?1 AND session_id = ?2
               AND (message_index IS NULL OR message_index >= ?3)",
            rusqlite::params![room_id, session_id, first_known_index],
        )?;
        let remaining: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM crypto_gap_events WHERE room_id = ?1 AND session_id = ?2",
            [room_id, session_id],
            |row| row.get(0),
        )?;
        if remaining > 0 {
            return Ok(false);
        }
        self.clear_gap(room_id, session_id)
    }

    pub fn mark_gap_requested(&self, room_id: &str, session_id: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_decryption_gaps
             SET last_requested_at = ?1, request_count = request_count + 1
             WHERE room_id = ?2 AND session_id = ?3",
            rusqlite::params![now_secs(), room_id, session_id],
        )?;
        Ok(())
    }

    pub fn pending_gaps(&self) -> Result<Vec<PendingGap>, CryptoError> {
        self.query_gaps("SELECT room_id, session_id, sender_key, first_seen_at, last_requested_at, request_count
                         FROM crypto_decryption_gaps ORDER BY first_seen_at, room_id, session_id", [])
    }

    pub fn gaps_for_room(&self, room_id: &str) -> Result<Vec<PendingGap>, CryptoError> {
        self.query_gaps("SELECT room_id, session_id, sender_key, first_seen_at, last_requested_at, request_count
                         FROM crypto_decryption_gaps WHERE room_id = ?1 ORDER BY first_seen_at, session_id",
                        [room_id])
    }

    /// Gaps never requested, or last requested more than `min_interval_secs` ago.
    pub fn gaps_due_for_request(&self, min_interval_secs: i64) -> Result<Vec<PendingGap>, CryptoError> {
        let cutoff = now_secs() - min_interval_secs;
        Ok(self
            .pending_gaps()?
            .into_iter()
            .filter(|gap| gap.last_requested_at.map_or(true, |at| at <= cutoff))
            .collect())
    }

    fn query_gaps<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<PendingGap>, CryptoError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut gaps = stmt
            .query_map(params, |row| {
                Ok(PendingGap {
                    room_id: row.get(0)?,
                    session_id: row.get(1)?,
                    sender_key: row.get(2)?,
                    first_seen_at: row.get(3)?,
                    last_requested_at: row.get(4)?,
                    request_count: row.get(5)?,
                    event_ids: Vec::new(),
                    index_range: None,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = self.conn.prepare(
            "SELECT event_id, message_index FROM crypto_gap_events
             WHERE room_id = ?1 AND session_id = ?2 ORDER BY event_id",
        )?;
        for gap in &mut gaps {
            let rows = events
                .query_map([&gap.room_id, &gap.session_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<u32>>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (event_id, index) in rows {
                gap.event_ids.push(event_id);
                if let Some(i) = index {
                    gap.index_range = Some(match gap.index_range {
                        Some((lo, hi)) => (lo.min(i), hi.max(i)),
                        None => (i, i),
                    });
                }
            }
        }
        Ok(gaps)
    }

    pub fn insert_key_request(
        &self,
        request_id: &str,
        room_id: &str,
        session_id: &str,
        sender_key: &str,
    ) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO crypto_key_requests
                 (request_id, room_id, session_id, sender_key, sent_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 'sent')",
            rusqlite::params![request_id, room_id, session_id, sender_key, now_secs()],
        )?;
        Ok(())
    }

    /// Open request for (room, session), if one was already sent.
    pub fn open_key_request(
        &self,
        room_id: &str,
        session_id: &str,
    ) -> Result<Option<KeyRequestRow>, CryptoError> {
        Ok(self
            .conn
            .query_row(
                "SELECT request_id, room_id, session_id, sender_key, sent_at, state
                 FROM crypto_key_requests
                 WHERE room_id = ?1 AND session_id = ?2 AND state = 'sent'
                 ORDER BY sent_at DESC LIMIT 1",
                [room_id, session_id],
                map_request,
            )
            .optional()?)
    }

    pub fn key_requests_in_state(&self, state: &str) -> Result<Vec<KeyRequestRow>, CryptoError> {
        let mut stmt = self.conn.prepare(
            "SELECT request_id, room_id, session_id, sender_key, sent_at, state
             FROM crypto_key_requests WHERE state = ?1 ORDER BY sent_at, request_id",
        )?;
        let rows = stmt
            .query_map([state], map_request)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_key_request_state(&self, request_id: &str, state: &str) -> Result<(), CryptoError> {
        self.conn.execute(
            "UPDATE crypto_key_requests SET state = ?1 WHERE request_id = ?2",
            [state, request_id],
        )?;
        Ok(())
    }
}

fn map_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRequestRow> {
    Ok(KeyRequestRow {
        request_id: row.get(0)?,
        room_id: row.get(1)?,
        session_id: row.get(2)?,
        sender_key: row.get(3)?,
        sent_at: row.get(4)?,
        state: row.get(5)?,
    })
}
