//! Session bindings: one agent session handle per chat.

use rusqlite::{params, OptionalExtension};

use crate::{now_secs, Store, StoreError};

impl Store {
    pub fn session_for_chat(&self, chat_id: i64) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT session_id FROM sessions WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| StoreError::new(format!("session read failed: {err}")))
        })
    }

    /// Upsert the chat's session handle. The agent mints a new id when it
    /// refuses a stale resume handle, and this overwrite is how the old row
    /// gets replaced.
    pub fn bind_session(&self, chat_id: i64, session_id: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (chat_id, session_id, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                     session_id = excluded.session_id,
                     updated_at = excluded.updated_at",
                params![chat_id, session_id, now_secs()],
            )
            .map_err(|err| StoreError::new(format!("session upsert failed: {err}")))?;
            Ok(())
        })
    }

    pub fn clear_session(&self, chat_id: i64) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM sessions WHERE chat_id = ?1", params![chat_id])
                .map_err(|err| StoreError::new(format!("session delete failed: {err}")))?;
            Ok(changed > 0)
        })
    }
}
