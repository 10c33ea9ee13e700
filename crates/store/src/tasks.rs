//! Scheduled tasks: cron-driven prompts with a persisted status machine.

use rand::RngCore;
use rusqlite::{params, OptionalExtension, Row};

use crate::{now_secs, truncate_chars, Store, StoreError};

pub const LAST_RESULT_MAX_CHARS: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Active,
    Paused,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            other => Err(StoreError::new(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScheduledTask {
    pub id: String,
    pub chat_id: i64,
    pub prompt: String,
    pub schedule: String,
    pub next_run: i64,
    pub last_run: Option<i64>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: i64,
}

const TASK_COLUMNS: &str =
    "id, chat_id, prompt, schedule, next_run, last_run, last_result, status, created_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let status_raw: String = row.get(7)?;
    let status = TaskStatus::from_str(&status_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(err.to_string())),
        )
    })?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        prompt: row.get(2)?,
        schedule: row.get(3)?,
        next_run: row.get(4)?,
        last_run: row.get(5)?,
        last_result: row.get(6)?,
        status,
        created_at: row.get(8)?,
    })
}

fn new_task_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Store {
    /// Create an active task and return its opaque id.
    pub fn create_task(
        &self,
        chat_id: i64,
        prompt: &str,
        schedule: &str,
        next_run: i64,
    ) -> Result<String, StoreError> {
        let id = new_task_id();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                     (id, chat_id, prompt, schedule, next_run, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
                params![id, chat_id, prompt, schedule, next_run, now_secs()],
            )
            .map_err(|err| StoreError::new(format!("task create failed: {err}")))?;
            Ok(id.clone())
        })
    }

    /// All active tasks whose `next_run` is at or before `now`. Paused tasks
    /// never appear here.
    pub fn due_tasks(&self, now: i64) -> Result<Vec<ScheduledTask>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                     WHERE status = 'active' AND next_run <= ?1
                     ORDER BY next_run ASC"
                ))
                .map_err(|err| StoreError::new(format!("due prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![now], row_to_task)
                .map_err(|err| StoreError::new(format!("due query failed: {err}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| StoreError::new(format!("task row failed: {err}")))?);
            }
            Ok(out)
        })
    }

    /// Post-run bookkeeping: last_run, bounded last_result and the advanced
    /// next_run, in one statement.
    pub fn record_task_run(
        &self,
        id: &str,
        last_run: i64,
        last_result: &str,
        next_run: i64,
    ) -> Result<(), StoreError> {
        let last_result = truncate_chars(last_result, LAST_RESULT_MAX_CHARS);
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET last_run = ?1, last_result = ?2, next_run = ?3
                 WHERE id = ?4",
                params![last_run, last_result, next_run, id],
            )
            .map_err(|err| StoreError::new(format!("task run record failed: {err}")))?;
            Ok(())
        })
    }

    /// Flip status; `next_run` is also replaced when the caller passes one
    /// (resume recomputes it so a long pause does not fire immediately).
    pub fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        next_run: Option<i64>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = match next_run {
                Some(next_run) => conn
                    .execute(
                        "UPDATE scheduled_tasks SET status = ?1, next_run = ?2 WHERE id = ?3",
                        params![status.as_str(), next_run, id],
                    )
                    .map_err(|err| StoreError::new(format!("task status update failed: {err}")))?,
                None => conn
                    .execute(
                        "UPDATE scheduled_tasks SET status = ?1 WHERE id = ?2",
                        params![status.as_str(), id],
                    )
                    .map_err(|err| StoreError::new(format!("task status update failed: {err}")))?,
            };
            Ok(changed > 0)
        })
    }

    pub fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
                .map_err(|err| StoreError::new(format!("task delete failed: {err}")))?;
            Ok(changed > 0)
        })
    }

    pub fn tasks_for_chat(&self, chat_id: i64) -> Result<Vec<ScheduledTask>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                     WHERE chat_id = ?1 ORDER BY created_at ASC"
                ))
                .map_err(|err| StoreError::new(format!("task list prepare failed: {err}")))?;
            let rows = stmt
                .query_map(params![chat_id], row_to_task)
                .map_err(|err| StoreError::new(format!("task list failed: {err}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|err| StoreError::new(format!("task row failed: {err}")))?);
            }
            Ok(out)
        })
    }

    pub fn task_by_id(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()
            .map_err(|err| StoreError::new(format!("task read failed: {err}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::TaskStatus;
    use crate::{now_secs, Store};

    #[test]
    fn due_query_excludes_paused_and_future_tasks() {
        let store = Store::open_in_memory().expect("open store");
        let now = now_secs();

        let overdue = store
            .create_task(1, "check the mail", "0 * * * *", now - 3600)
            .expect("create");
        let future = store
            .create_task(1, "later", "0 * * * *", now + 3600)
            .expect("create");
        let paused = store
            .create_task(1, "paused", "0 * * * *", now - 3600)
            .expect("create");
        store
            .set_task_status(&paused, TaskStatus::Paused, None)
            .expect("pause");

        let due = store.due_tasks(now).expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, overdue);
        assert_ne!(due[0].id, future);
    }

    #[test]
    fn record_run_advances_and_bounds_result() {
        let store = Store::open_in_memory().expect("open store");
        let now = now_secs();
        let id = store
            .create_task(1, "summarize inbox", "*/5 * * * *", now - 60)
            .expect("create");

        let huge = "r".repeat(20_000);
        store
            .record_task_run(&id, now, &huge, now + 300)
            .expect("record");

        let task = store.task_by_id(&id).expect("read").expect("exists");
        assert_eq!(task.last_run, Some(now));
        assert_eq!(task.next_run, now + 300);
        assert!(task.next_run > now);
        assert_eq!(
            task.last_result.map(|r| r.chars().count()),
            Some(super::LAST_RESULT_MAX_CHARS)
        );
    }

    #[test]
    fn pause_resume_round_trip() {
        let store = Store::open_in_memory().expect("open store");
        let now = now_secs();
        let id = store
            .create_task(1, "ping", "0 9 * * *", now - 10)
            .expect("create");

        assert!(store
            .set_task_status(&id, TaskStatus::Paused, None)
            .expect("pause"));
        assert!(store.due_tasks(now).expect("due").is_empty());

        assert!(store
            .set_task_status(&id, TaskStatus::Active, Some(now + 500))
            .expect("resume"));
        let task = store.task_by_id(&id).expect("read").expect("exists");
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.next_run, now + 500);
    }

    #[test]
    fn delete_unknown_task_reports_false() {
        let store = Store::open_in_memory().expect("open store");
        assert!(!store.delete_task("missing").expect("delete"));
    }
}
