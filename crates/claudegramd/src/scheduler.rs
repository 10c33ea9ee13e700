//! Cron-scheduled prompts: a five-field cron parser, next-fire computation
//! in the host's local timezone, and the polling loop over the persisted
//! task table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Timelike};
use store::{now_secs, ScheduledTask, Store};
use tokio::sync::watch;

pub const SCHEDULER_POLL_MS: u64 = 60_000;
/// A task further behind than this was missed (laptop asleep, process down).
const OVERDUE_LOG_SECS: i64 = 300;
/// Five years of minutes; past this the schedule never fires.
const MAX_CRON_ITERATIONS: usize = 525_600 * 5;

#[derive(Debug, thiserror::Error)]
#[error("scheduler error: {message}")]
pub struct SchedulerError {
    message: String,
}

impl SchedulerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executes one scheduled prompt. The gateway's implementation routes the
/// prompt through the shared queue under the task key namespace, so
/// scheduled work obeys the global concurrency cap without ever blocking a
/// chat's interactive lane.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: &ScheduledTask) -> Result<String, SchedulerError>;
}

pub struct Scheduler {
    store: Arc<Store>,
    runner: Arc<dyn TaskRunner>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, runner: Arc<dyn TaskRunner>) -> Self {
        Self { store, runner }
    }

    /// Sweep immediately, then once a minute until `stop` flips.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(SCHEDULER_POLL_MS));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!("scheduler sweep failed: {err}");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<usize, SchedulerError> {
        let now = now_secs();
        let due = self
            .store
            .due_tasks(now)
            .map_err(|err| SchedulerError::new(format!("due query failed: {err}")))?;

        let count = due.len();
        for task in due {
            let overdue_by = now - task.next_run;
            if overdue_by > OVERDUE_LOG_SECS {
                tracing::info!(
                    "task {} is {overdue_by}s overdue, likely missed while the host slept",
                    task.id
                );
            }
            self.execute_one(&task).await;
        }
        Ok(count)
    }

    async fn execute_one(&self, task: &ScheduledTask) {
        let last_result = match self.runner.run_task(task).await {
            Ok(result) => result,
            Err(err) => format!("ERROR: {err}"),
        };

        // next_run advances from the completion instant, never from
        // last_run, so a run slower than its period drifts forward.
        let finished = now_secs();
        let next_run = CronSchedule::parse(&task.schedule)
            .and_then(|schedule| next_run_after(&schedule, finished));
        match next_run {
            Ok(next_run) => {
                if let Err(err) = self
                    .store
                    .record_task_run(&task.id, finished, &last_result, next_run)
                {
                    tracing::error!("task {} post-run update failed: {err}", task.id);
                }
            }
            Err(err) => {
                tracing::error!(
                    "task {} schedule {:?} no longer computes a next run: {err}",
                    task.id,
                    task.schedule
                );
            }
        }
    }
}

/// Total validity check; never panics and never throws.
pub fn validate_cron(expr: &str) -> bool {
    CronSchedule::parse(expr).is_ok()
}

/// The strictly-future instant (unix seconds, local timezone) at which the
/// expression next fires after `after`.
pub fn next_run_after(schedule: &CronSchedule, after: i64) -> Result<i64, SchedulerError> {
    let anchor = Local
        .timestamp_opt(after, 0)
        .single()
        .ok_or_else(|| SchedulerError::new("invalid timestamp"))?;
    let mut cursor = anchor
        .with_second(0)
        .and_then(|value| value.with_nanosecond(0))
        .ok_or_else(|| SchedulerError::new("invalid datetime normalization"))?
        + ChronoDuration::minutes(1);

    let mut iterations = 0usize;
    while iterations < MAX_CRON_ITERATIONS {
        if schedule.matches(&cursor) {
            return Ok(cursor.timestamp());
        }
        cursor += ChronoDuration::minutes(1);
        iterations = iterations.saturating_add(1);
    }
    Err(SchedulerError::new("cron schedule has no next occurrence"))
}

#[derive(Clone, Debug)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    /// Five whitespace-separated fields: minute, hour, day-of-month, month,
    /// day-of-week. Fields accept `*`, `*/step`, `N`, `N-M` and comma lists.
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let fields = expression
            .split_whitespace()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        if fields.len() != 5 {
            return Err(SchedulerError::new(format!(
                "invalid cron schedule {expression:?}: expected 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week: CronField::parse(fields[4], 0, 6)?,
        })
    }

    fn matches(&self, time: &DateTime<Local>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.day_of_month.matches(time.day())
            && self.month.matches(time.month())
            && self
                .day_of_week
                .matches(time.weekday().num_days_from_sunday())
    }
}

#[derive(Clone, Debug)]
enum CronField {
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn parse(field: &str, min: u32, max: u32) -> Result<Self, SchedulerError> {
        if field == "*" {
            return Ok(Self::Any);
        }

        let mut values = Vec::new();
        for part in field.split(',') {
            if let Some(step) = part.strip_prefix("*/") {
                let step = step
                    .parse::<u32>()
                    .map_err(|err| SchedulerError::new(format!("invalid cron step {part:?}: {err}")))?;
                if step == 0 {
                    return Err(SchedulerError::new(format!("invalid cron step {part:?}: zero")));
                }
                let mut value = min;
                while value <= max {
                    values.push(value);
                    value = value.saturating_add(step);
                }
            } else if let Some((low, high)) = part.split_once('-') {
                let low = parse_bounded(low, min, max)?;
                let high = parse_bounded(high, min, max)?;
                if low > high {
                    return Err(SchedulerError::new(format!(
                        "invalid cron range {part:?}: {low} > {high}"
                    )));
                }
                values.extend(low..=high);
            } else {
                values.push(parse_bounded(part, min, max)?);
            }
        }

        values.sort_unstable();
        values.dedup();
        if values.is_empty() {
            return Err(SchedulerError::new(format!("empty cron field {field:?}")));
        }
        Ok(Self::Values(values))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => values.binary_search(&value).is_ok(),
        }
    }
}

fn parse_bounded(raw: &str, min: u32, max: u32) -> Result<u32, SchedulerError> {
    let value = raw
        .parse::<u32>()
        .map_err(|err| SchedulerError::new(format!("invalid cron field {raw:?}: {err}")))?;
    if value < min || value > max {
        return Err(SchedulerError::new(format!(
            "cron field value {value} outside {min}-{max}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
