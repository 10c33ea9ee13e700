//! The per-chat conversation log.

use rusqlite::{params, Row};

use crate::{now_secs, Store, StoreError};

pub const CONVERSATION_KEEP_PER_CHAT: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn from_str(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(StoreError::new(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConversationRow {
    pub id: i64,
    pub chat_id: i64,
    pub session_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    let role_raw: String = row.get(3)?;
    let role = Role::from_str(&role_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(err.to_string())),
        )
    })?;
    Ok(ConversationRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        session_id: row.get(2)?,
        role,
        content: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl Store {
    pub fn append_conversation(
        &self,
        chat_id: i64,
        session_id: Option<&str>,
        role: Role,
        content: &str,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (chat_id, session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chat_id, session_id, role.as_str(), content, now_secs()],
            )
            .map_err(|err| StoreError::new(format!("conversation append failed: {err}")))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent `limit` rows, newest first.
    pub fn recent_conversations(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_id, session_id, role, content, created_at
                     FROM conversations
                     WHERE chat_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )
                .map_err(|err| StoreError::new(format!("conversation prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![chat_id, limit as i64], row_to_conversation)
                .map_err(|err| StoreError::new(format!("conversation query failed: {err}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(
                    row.map_err(|err| StoreError::new(format!("conversation row failed: {err}")))?,
                );
            }
            Ok(out)
        })
    }

    /// Trim a chat's log to its most recent `keep` rows.
    pub fn prune_conversations(&self, chat_id: i64, keep: usize) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM conversations
                 WHERE chat_id = ?1 AND id NOT IN (
                     SELECT id FROM conversations
                     WHERE chat_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2
                 )",
                params![chat_id, keep as i64],
            )
            .map_err(|err| StoreError::new(format!("conversation prune failed: {err}")))
        })
    }

    pub fn conversation_count(&self, chat_id: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count.max(0) as usize)
            .map_err(|err| StoreError::new(format!("conversation count failed: {err}")))
        })
    }

    /// Every chat id that currently has log rows. Drives the prune sweep.
    pub fn chats_with_conversations(&self) -> Result<Vec<i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT chat_id FROM conversations")
                .map_err(|err| StoreError::new(format!("chat list prepare failed: {err}")))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .map_err(|err| StoreError::new(format!("chat list failed: {err}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| StoreError::new(format!("chat row failed: {err}")))?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Role;
    use crate::Store;

    #[test]
    fn append_and_read_back_in_reverse_order() {
        let store = Store::open_in_memory().expect("open store");
        store
            .append_conversation(1, Some("s1"), Role::User, "first")
            .expect("append");
        store
            .append_conversation(1, Some("s1"), Role::Assistant, "second")
            .expect("append");

        let rows = store.recent_conversations(1, 10).expect("recent");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "second");
        assert_eq!(rows[0].role, Role::Assistant);
        assert_eq!(rows[1].session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn prune_keeps_only_the_newest_rows() {
        let store = Store::open_in_memory().expect("open store");
        for index in 0..30 {
            store
                .append_conversation(1, None, Role::User, &format!("msg {index}"))
                .expect("append");
        }
        store
            .append_conversation(2, None, Role::User, "other chat")
            .expect("append");

        let removed = store.prune_conversations(1, 10).expect("prune");
        assert_eq!(removed, 20);
        assert_eq!(store.conversation_count(1).expect("count"), 10);
        assert_eq!(store.conversation_count(2).expect("count"), 1);

        let rows = store.recent_conversations(1, 100).expect("recent");
        assert_eq!(rows[0].content, "msg 29");
        assert_eq!(rows.last().map(|r| r.content.clone()), Some("msg 20".to_string()));
    }
}
