//! SQLite-backed persistent state for the gateway: session bindings, the
//! memory store with its FTS5 index, scheduled tasks, the conversation log,
//! the token-usage ledger and contacts.
//!
//! One `Store` handle exists per process. WAL journaling and foreign keys are
//! always on; FTS rows are kept in sync with their base tables by triggers,
//! so a delete or content update can never leave a ghost index row.

mod contacts;
mod conversations;
mod memories;
mod sessions;
mod tasks;
mod usage;

pub use contacts::{Contact, Interaction, NewContact};
pub use conversations::{ConversationRow, Role, CONVERSATION_KEEP_PER_CHAT};
pub use memories::{
    MemoryRow, Sector, DECAY_FACTOR, EPISODIC_MAX_CHARS, MAX_SALIENCE, MIN_SALIENCE,
    SEMANTIC_MAX_CHARS,
};
pub use tasks::{ScheduledTask, TaskStatus, LAST_RESULT_MAX_CHARS};
pub use usage::{UsageTotals, NewUsage};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;

const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
#[error("store error: {message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub struct Store {
    conn: Mutex<Option<Connection>>,
}

impl Store {
    /// Open (or create) the store file and bring the schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::new(format!("store dir create failed: {err}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| StoreError::new(format!("store open failed: {err}")))?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| StoreError::new(format!("store open failed: {err}")))?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| StoreError::new(format!("wal pragma failed: {err}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| StoreError::new(format!("foreign keys pragma failed: {err}")))?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(|err| StoreError::new(format!("busy timeout failed: {err}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|err| StoreError::new(format!("schema init failed: {err}")))?;

        match conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0)) {
            Ok(verdict) if verdict == "ok" => {}
            Ok(verdict) => tracing::error!("store integrity check failed: {verdict}"),
            Err(err) => tracing::error!("store integrity check failed: {err}"),
        }

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the underlying connection. Further calls return an error.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            guard.take();
        }
    }

    pub(crate) fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard: MutexGuard<'_, Option<Connection>> = self
            .conn
            .lock()
            .map_err(|_| StoreError::new("store mutex poisoned"))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::new("store is closed"))?;
        op(conn)
    }
}

/// Run `op` inside a BEGIN IMMEDIATE transaction, rolling back on error.
pub(crate) fn run_atomic<T>(
    conn: &Connection,
    op: impl FnOnce(&Connection) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|err| StoreError::new(format!("begin transaction failed: {err}")))?;
    match op(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")
                .map_err(|err| StoreError::new(format!("commit failed: {err}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                return Err(StoreError::new(format!(
                    "rollback failed after error: {err}; rollback error: {rollback_err}"
                )));
            }
            Err(err)
        }
    }
}

/// Normalize free text into an FTS5 MATCH expression: keep letters, digits
/// and whitespace, drop tokens shorter than two characters, give every token
/// a prefix wildcard. Returns `None` when nothing queryable is left.
pub fn fts_match_query(input: &str) -> Option<String> {
    let mut cleaned = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_alphanumeric() || ch.is_whitespace() {
            cleaned.push(ch);
        } else {
            cleaned.push(' ');
        }
    }

    let terms: Vec<String> = cleaned
        .split_whitespace()
        .filter(|token| token.chars().count() >= 2)
        .map(|token| format!("{token}*"))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect()
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    chat_id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    topic_key TEXT,
    content TEXT NOT NULL,
    sector TEXT NOT NULL CHECK (sector IN ('semantic', 'episodic')),
    salience REAL NOT NULL DEFAULT 1.0,
    created_at INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_chat_accessed
    ON memories(chat_id, accessed_at DESC);
CREATE INDEX IF NOT EXISTS idx_memories_chat_salience
    ON memories(chat_id, salience ASC, accessed_at ASC);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content, content='memories', content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
END;
CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE OF content ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
    INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id TEXT PRIMARY KEY,
    chat_id INTEGER NOT NULL,
    prompt TEXT NOT NULL,
    schedule TEXT NOT NULL,
    next_run INTEGER NOT NULL,
    last_run INTEGER,
    last_result TEXT,
    status TEXT NOT NULL CHECK (status IN ('active', 'paused')),
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(status, next_run);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    session_id TEXT,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_chat_created
    ON conversations(chat_id, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS token_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    session_id TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read INTEGER NOT NULL DEFAULT 0,
    cost_usd REAL NOT NULL DEFAULT 0,
    did_compact INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_chat_created
    ON token_usage(chat_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_usage_session_created
    ON token_usage(session_id, created_at DESC);

CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    company TEXT,
    role TEXT,
    notes TEXT,
    photo_path TEXT,
    source TEXT NOT NULL,
    first_seen INTEGER NOT NULL,
    last_contact INTEGER NOT NULL,
    interaction_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_chat_email
    ON contacts(chat_id, email) WHERE email IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_chat_name
    ON contacts(chat_id, lower(name)) WHERE email IS NULL;

CREATE VIRTUAL TABLE IF NOT EXISTS contacts_fts USING fts5(
    name, email, company, role, notes, content='contacts', content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS contacts_ai AFTER INSERT ON contacts BEGIN
    INSERT INTO contacts_fts(rowid, name, email, company, role, notes)
    VALUES (new.id, new.name, new.email, new.company, new.role, new.notes);
END;
CREATE TRIGGER IF NOT EXISTS contacts_ad AFTER DELETE ON contacts BEGIN
    INSERT INTO contacts_fts(contacts_fts, rowid, name, email, company, role, notes)
    VALUES ('delete', old.id, old.name, old.email, old.company, old.role, old.notes);
END;
CREATE TRIGGER IF NOT EXISTS contacts_au
AFTER UPDATE OF name, email, company, role, notes ON contacts BEGIN
    INSERT INTO contacts_fts(contacts_fts, rowid, name, email, company, role, notes)
    VALUES ('delete', old.id, old.name, old.email, old.company, old.role, old.notes);
    INSERT INTO contacts_fts(rowid, name, email, company, role, notes)
    VALUES (new.id, new.name, new.email, new.company, new.role, new.notes);
END;

CREATE TABLE IF NOT EXISTS interactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
    type TEXT NOT NULL CHECK (type IN ('email', 'meeting', 'call', 'note', 'other')),
    source TEXT NOT NULL CHECK (source IN ('manual', 'auto')),
    summary TEXT,
    date INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_interactions_contact
    ON interactions(contact_id, date DESC);
"#;
