//! The token-usage ledger: one row per agent turn.

use rusqlite::{params, OptionalExtension};

use crate::{now_secs, Store, StoreError};

#[derive(Clone, Debug, Default)]
pub struct NewUsage<'a> {
    pub chat_id: i64,
    pub session_id: Option<&'a str>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cost_usd: f64,
    pub did_compact: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UsageTotals {
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl Store {
    pub fn record_usage(&self, usage: &NewUsage<'_>) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO token_usage
                     (chat_id, session_id, input_tokens, output_tokens,
                      cache_read, cost_usd, did_compact, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    usage.chat_id,
                    usage.session_id,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    usage.cache_read as i64,
                    usage.cost_usd,
                    usage.did_compact as i64,
                    now_secs(),
                ],
            )
            .map_err(|err| StoreError::new(format!("usage insert failed: {err}")))?;
            Ok(())
        })
    }

    /// The `cache_read` of the most recent row for a session, a proxy for
    /// how full the agent's context window currently is.
    pub fn last_cache_read(&self, session_id: &str) -> Result<Option<u64>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT cache_read FROM token_usage
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|value| value.map(|v| v.max(0) as u64))
            .map_err(|err| StoreError::new(format!("cache read query failed: {err}")))
        })
    }

    pub fn usage_since(&self, chat_id: i64, since: i64) -> Result<UsageTotals, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(input_tokens), 0),
                        COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cost_usd), 0)
                 FROM token_usage
                 WHERE chat_id = ?1 AND created_at >= ?2",
                params![chat_id, since],
                |row| {
                    Ok(UsageTotals {
                        turns: row.get::<_, i64>(0)?.max(0) as u64,
                        input_tokens: row.get::<_, i64>(1)?.max(0) as u64,
                        output_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                        cost_usd: row.get(3)?,
                    })
                },
            )
            .map_err(|err| StoreError::new(format!("usage summary failed: {err}")))
        })
    }
}
