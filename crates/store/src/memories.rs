//! The memory table and its FTS5 index: insert, search, touch, decay, prune.

use rusqlite::{params, Connection, Row};

use crate::{fts_match_query, now_secs, run_atomic, truncate_chars, Store, StoreError};

pub const MIN_SALIENCE: f64 = 0.1;
pub const MAX_SALIENCE: f64 = 5.0;
pub const DECAY_FACTOR: f64 = 0.98;
pub const EPISODIC_MAX_CHARS: usize = 500;
pub const SEMANTIC_MAX_CHARS: usize = 300;

/// Rows younger than this are exempt from decay.
const DECAY_MIN_AGE_SECS: i64 = 24 * 3600;
/// Salience drops smaller than this are not written back.
const DECAY_WRITE_EPSILON: f64 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sector {
    Semantic,
    Episodic,
}

impl Sector {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Episodic => "episodic",
        }
    }

    pub fn from_str(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "semantic" => Ok(Self::Semantic),
            "episodic" => Ok(Self::Episodic),
            other => Err(StoreError::new(format!("unknown memory sector: {other}"))),
        }
    }

    fn max_chars(self) -> usize {
        match self {
            Self::Semantic => SEMANTIC_MAX_CHARS,
            Self::Episodic => EPISODIC_MAX_CHARS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemoryRow {
    pub id: i64,
    pub chat_id: i64,
    pub topic_key: Option<String>,
    pub content: String,
    pub sector: Sector,
    pub salience: f64,
    pub created_at: i64,
    pub accessed_at: i64,
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<MemoryRow> {
    let sector_raw: String = row.get(4)?;
    let sector = Sector::from_str(&sector_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(err.to_string())),
        )
    })?;
    Ok(MemoryRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        topic_key: row.get(2)?,
        content: row.get(3)?,
        sector,
        salience: row.get(5)?,
        created_at: row.get(6)?,
        accessed_at: row.get(7)?,
    })
}

const MEMORY_COLUMNS: &str =
    "id, chat_id, topic_key, content, sector, salience, created_at, accessed_at";

impl Store {
    pub fn insert_memory(
        &self,
        chat_id: i64,
        topic_key: Option<&str>,
        content: &str,
        sector: Sector,
    ) -> Result<i64, StoreError> {
        let content = truncate_chars(content, sector.max_chars());
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories (chat_id, topic_key, content, sector, salience, created_at, accessed_at)
                 VALUES (?1, ?2, ?3, ?4, 1.0, ?5, ?5)",
                params![chat_id, topic_key, content, sector.as_str(), now],
            )
            .map_err(|err| StoreError::new(format!("memory insert failed: {err}")))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Rank-ordered full-text search. An empty or fully-filtered query
    /// returns no rows without touching the index.
    pub fn search_memories(
        &self,
        chat_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRow>, StoreError> {
        let Some(match_expr) = fts_match_query(query) else {
            return Ok(Vec::new());
        };
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT m.id, m.chat_id, m.topic_key, m.content, m.sector,
                            m.salience, m.created_at, m.accessed_at
                     FROM memories_fts
                     JOIN memories m ON m.id = memories_fts.rowid
                     WHERE memories_fts MATCH ?1 AND m.chat_id = ?2
                     ORDER BY rank
                     LIMIT ?3",
                )
                .map_err(|err| StoreError::new(format!("memory search prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![match_expr, chat_id, limit as i64], row_to_memory)
                .map_err(|err| StoreError::new(format!("memory search failed: {err}")))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| StoreError::new(format!("memory row failed: {err}")))?);
            }
            Ok(out)
        })
    }

    pub fn recent_memories(&self, chat_id: i64, limit: usize) -> Result<Vec<MemoryRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories
                     WHERE chat_id = ?1
                     ORDER BY accessed_at DESC, id DESC
                     LIMIT ?2"
                ))
                .map_err(|err| StoreError::new(format!("recent prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![chat_id, limit as i64], row_to_memory)
                .map_err(|err| StoreError::new(format!("recent query failed: {err}")))?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| StoreError::new(format!("memory row failed: {err}")))?);
            }
            Ok(out)
        })
    }

    /// Bump salience (capped at [`MAX_SALIENCE`]) and refresh `accessed_at`.
    pub fn touch_memory(&self, id: i64, delta: f64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories
                 SET salience = MIN(salience + ?1, ?2), accessed_at = ?3
                 WHERE id = ?4",
                params![delta, MAX_SALIENCE, now_secs(), id],
            )
            .map_err(|err| StoreError::new(format!("memory touch failed: {err}")))?;
            Ok(())
        })
    }

    /// One decay sweep over rows older than 24 h:
    /// `new = salience * DECAY_FACTOR ^ hours_since_last_access`.
    /// Rows falling under [`MIN_SALIENCE`] are deleted. Returns
    /// `(decayed, deleted)` counts. The whole sweep is one transaction.
    pub fn decay_memories(&self, now: i64) -> Result<(usize, usize), StoreError> {
        self.with_conn(|conn| run_atomic(conn, |db| decay_locked(db, now)))
    }

    pub fn memory_count(&self, chat_id: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count.max(0) as usize)
            .map_err(|err| StoreError::new(format!("memory count failed: {err}")))
        })
    }

    /// Delete the `excess` least-salient, oldest-accessed rows of a chat.
    pub fn prune_memories(&self, chat_id: i64, excess: usize) -> Result<usize, StoreError> {
        if excess == 0 {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM memories WHERE id IN (
                         SELECT id FROM memories
                         WHERE chat_id = ?1
                         ORDER BY salience ASC, accessed_at ASC
                         LIMIT ?2
                     )",
                    params![chat_id, excess as i64],
                )
                .map_err(|err| StoreError::new(format!("memory prune failed: {err}")))?;
            Ok(deleted)
        })
    }

    pub fn delete_memory(&self, id: i64) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM memories WHERE id = ?1", params![id])
                .map_err(|err| StoreError::new(format!("memory delete failed: {err}")))?;
            Ok(changed > 0)
        })
    }

    pub fn delete_memories_for_chat(&self, chat_id: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM memories WHERE chat_id = ?1", params![chat_id])
                .map_err(|err| StoreError::new(format!("memory wipe failed: {err}")))
        })
    }
}

fn decay_locked(db: &Connection, now: i64) -> Result<(usize, usize), StoreError> {
    let cutoff = now - DECAY_MIN_AGE_SECS;
    let mut stmt = db
        .prepare("SELECT id, salience, accessed_at FROM memories WHERE created_at < ?1")
        .map_err(|err| StoreError::new(format!("decay select prepare failed: {err}")))?;
    let rows = stmt
        .query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(|err| StoreError::new(format!("decay select failed: {err}")))?;

    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row.map_err(|err| StoreError::new(format!("decay row failed: {err}")))?);
    }
    drop(stmt);

    let mut decayed = 0usize;
    let mut deleted = 0usize;
    for (id, salience, accessed_at) in candidates {
        let idle_hours = (now.saturating_sub(accessed_at)).max(0) as f64 / 3600.0;
        let new_salience = salience * DECAY_FACTOR.powf(idle_hours);
        if new_salience < MIN_SALIENCE {
            db.execute("DELETE FROM memories WHERE id = ?1", params![id])
                .map_err(|err| StoreError::new(format!("decay delete failed: {err}")))?;
            deleted += 1;
        } else if new_salience < salience - DECAY_WRITE_EPSILON {
            db.execute(
                "UPDATE memories SET salience = ?1 WHERE id = ?2",
                params![new_salience, id],
            )
            .map_err(|err| StoreError::new(format!("decay update failed: {err}")))?;
            decayed += 1;
        }
    }
    Ok((decayed, deleted))
}

#[cfg(test)]
mod tests {
    use super::{Sector, MAX_SALIENCE};
    use crate::{now_secs, Store, StoreError};
    use rusqlite::params;

    fn backdate(store: &Store, id: i64, created_at: i64, accessed_at: i64) {
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE memories SET created_at = ?1, accessed_at = ?2 WHERE id = ?3",
                    params![created_at, accessed_at, id],
                )
                .map_err(|err| StoreError::new(err.to_string()))?;
                Ok(())
            })
            .expect("backdate");
    }

    fn salience_of(store: &Store, id: i64) -> Option<f64> {
        store
            .with_conn(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT salience FROM memories WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| StoreError::new(err.to_string()))
            })
            .expect("salience read")
    }

    #[test]
    fn insert_truncates_by_sector() {
        let store = Store::open_in_memory().expect("open store");
        let long = "x".repeat(600);
        let episodic = store
            .insert_memory(1, None, &long, Sector::Episodic)
            .expect("insert");
        let semantic = store
            .insert_memory(1, None, &long, Sector::Semantic)
            .expect("insert");

        let rows = store.recent_memories(1, 10).expect("recent");
        let episodic_row = rows.iter().find(|m| m.id == episodic).expect("episodic");
        let semantic_row = rows.iter().find(|m| m.id == semantic).expect("semantic");
        assert_eq!(episodic_row.content.chars().count(), 500);
        assert_eq!(semantic_row.content.chars().count(), 300);
    }

    #[test]
    fn search_hits_and_misses() {
        let store = Store::open_in_memory().expect("open store");
        store
            .insert_memory(1, None, "prefers espresso in the morning", Sector::Semantic)
            .expect("insert");
        store
            .insert_memory(2, None, "prefers espresso in the morning", Sector::Semantic)
            .expect("insert");

        let hits = store.search_memories(1, "espresso", 3).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chat_id, 1);

        assert!(store.search_memories(1, "", 3).expect("empty").is_empty());
        assert!(store.search_memories(1, "a b", 3).expect("short").is_empty());
        // Prefix match: "espres" should still hit via the wildcard suffix.
        assert_eq!(store.search_memories(1, "espres", 3).expect("prefix").len(), 1);
    }

    #[test]
    fn delete_removes_fts_row_too() {
        let store = Store::open_in_memory().expect("open store");
        let id = store
            .insert_memory(1, None, "the wifi password is hunter2", Sector::Semantic)
            .expect("insert");
        assert_eq!(store.search_memories(1, "wifi", 3).expect("search").len(), 1);

        assert!(store.delete_memory(id).expect("delete"));
        assert!(store.search_memories(1, "wifi", 3).expect("search").is_empty());
    }

    #[test]
    fn touch_is_capped_at_max_salience() {
        let store = Store::open_in_memory().expect("open store");
        let id = store
            .insert_memory(1, None, "birthday is in october", Sector::Semantic)
            .expect("insert");
        for _ in 0..100 {
            store.touch_memory(id, 0.1).expect("touch");
        }
        let salience = salience_of(&store, id).expect("row");
        assert!((salience - MAX_SALIENCE).abs() < 1e-9);
    }

    #[test]
    fn decay_deletes_below_floor_and_updates_the_rest() {
        let store = Store::open_in_memory().expect("open store");
        let now = now_secs();

        // Idle for ~5 days: 1.0 * 0.98^120 ≈ 0.088 < 0.1, so this row dies.
        let dead = store
            .insert_memory(1, None, "stale fact that nobody asked about", Sector::Episodic)
            .expect("insert");
        backdate(&store, dead, now - 10 * 86_400, now - 120 * 3600);

        // Idle for 24h: 1.0 * 0.98^24 ≈ 0.616, decays but survives.
        let alive = store
            .insert_memory(1, None, "recent enough fact to survive", Sector::Episodic)
            .expect("insert");
        backdate(&store, alive, now - 2 * 86_400, now - 24 * 3600);

        // Younger than 24h: exempt from the sweep entirely.
        let fresh = store
            .insert_memory(1, None, "fresh fact outside the decay window", Sector::Episodic)
            .expect("insert");

        let (decayed, deleted) = store.decay_memories(now).expect("decay");
        assert_eq!(deleted, 1);
        assert_eq!(decayed, 1);

        assert!(salience_of(&store, dead).is_none());
        let surviving = salience_of(&store, alive).expect("survivor");
        assert!(surviving < 1.0 && surviving >= 0.1);
        assert!((salience_of(&store, fresh).expect("fresh") - 1.0).abs() < 1e-9);

        // The deleted row must be gone from the index as well.
        assert!(store.search_memories(1, "stale", 3).expect("search").is_empty());

        // A second sweep is monotone non-increasing for the survivor.
        let before = surviving;
        store.decay_memories(now + 3600).expect("decay again");
        let after = salience_of(&store, alive).expect("survivor");
        assert!(after <= before);
    }

    #[test]
    fn prune_removes_least_salient_oldest_accessed_first() {
        let store = Store::open_in_memory().expect("open store");
        let now = now_secs();
        let low = store
            .insert_memory(1, None, "low salience and old", Sector::Episodic)
            .expect("insert");
        let high = store
            .insert_memory(1, None, "high salience and fresh", Sector::Episodic)
            .expect("insert");
        store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE memories SET salience = 0.2, accessed_at = ?1 WHERE id = ?2",
                    params![now - 1000, low],
                )
                .map_err(|err| StoreError::new(err.to_string()))?;
                conn.execute(
                    "UPDATE memories SET salience = 3.0 WHERE id = ?1",
                    params![high],
                )
                .map_err(|err| StoreError::new(err.to_string()))?;
                Ok(())
            })
            .expect("setup");

        assert_eq!(store.prune_memories(1, 1).expect("prune"), 1);
        let remaining = store.recent_memories(1, 10).expect("recent");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, high);
    }
}
