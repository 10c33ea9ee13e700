use super::{next_run_after, validate_cron, CronSchedule, Scheduler, SchedulerError, TaskRunner};
use async_trait::async_trait;
use chrono::{Local, TimeZone, Timelike};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use store::{now_secs, ScheduledTask, Store, TaskStatus};

#[test]
fn parser_rejects_bad_expressions() {
    assert!(!validate_cron("* * * *"));
    assert!(!validate_cron("70 * * * *"));
    assert!(!validate_cron("* 24 * * *"));
    assert!(!validate_cron("*/0 * * * *"));
    assert!(!validate_cron("5-2 * * * *"));
    assert!(!validate_cron("abc * * * *"));
    assert!(validate_cron("*/5 0-6 1,15 * 1-5"));
}

#[test]
fn validate_implies_next_run_computes() {
    for expr in ["* * * * *", "30 6 * * *", "*/15 * * * *", "0 0 1 1 *"] {
        assert!(validate_cron(expr), "{expr} should validate");
        let schedule = CronSchedule::parse(expr).expect("parse");
        assert!(next_run_after(&schedule, now_secs()).is_ok(), "{expr}");
    }
}

#[test]
fn daily_schedule_fires_at_local_half_past_six() {
    // 2025-06-15 00:00 local; `30 6 * * *` must yield 06:30 the same day.
    let midnight = Local
        .with_ymd_and_hms(2025, 6, 15, 0, 0, 0)
        .single()
        .expect("construct local midnight");
    let schedule = CronSchedule::parse("30 6 * * *").expect("parse");
    let next = next_run_after(&schedule, midnight.timestamp()).expect("next run");

    let fire = Local.timestamp_opt(next, 0).single().expect("local time");
    assert_eq!(fire.hour(), 6);
    assert_eq!(fire.minute(), 30);
    assert_eq!(fire.date_naive(), midnight.date_naive());
}

#[test]
fn next_run_is_strictly_future() {
    let schedule = CronSchedule::parse("* * * * *").expect("parse");
    let now = now_secs();
    let next = next_run_after(&schedule, now).expect("next run");
    assert!(next > now);
    assert!(next <= now + 60);
}

#[test]
fn step_and_list_fields_match() {
    let schedule = CronSchedule::parse("*/20 * * * *").expect("parse");
    let base = Local
        .with_ymd_and_hms(2025, 6, 15, 9, 5, 0)
        .single()
        .expect("local time");
    let next = next_run_after(&schedule, base.timestamp()).expect("next run");
    let fire = Local.timestamp_opt(next, 0).single().expect("local time");
    assert_eq!(fire.minute(), 20);
}

struct RecordingRunner {
    runs: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run_task(&self, task: &ScheduledTask) -> Result<String, SchedulerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(task.prompt.clone());
        }
        if self.fail {
            Err(SchedulerError::new("executor blew up"))
        } else {
            Ok(format!("ran: {}", task.prompt))
        }
    }
}

fn fixture(fail: bool) -> (Arc<Store>, Arc<RecordingRunner>, Scheduler) {
    let store = Arc::new(Store::open_in_memory().expect("open store"));
    let runner = Arc::new(RecordingRunner {
        runs: AtomicUsize::new(0),
        prompts: Mutex::new(Vec::new()),
        fail,
    });
    let scheduler = Scheduler::new(store.clone(), runner.clone());
    (store, runner, scheduler)
}

#[tokio::test]
async fn missed_task_fires_once_and_advances_past_completion() {
    let (store, runner, scheduler) = fixture(false);
    let now = now_secs();
    let id = store
        .create_task(42, "morning digest", "*/5 * * * *", now - 3600)
        .expect("create");

    let swept = scheduler.sweep().await.expect("sweep");
    assert_eq!(swept, 1);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        runner.prompts.lock().expect("prompts").as_slice(),
        ["morning digest".to_string()]
    );

    let task = store.task_by_id(&id).expect("read").expect("exists");
    assert!(task.next_run > now, "next_run must pass the completion instant");
    assert_eq!(task.last_result.as_deref(), Some("ran: morning digest"));
    assert!(task.last_run.is_some());

    // Nothing due anymore: a second sweep is a no-op.
    let swept = scheduler.sweep().await.expect("sweep");
    assert_eq!(swept, 0);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_run_records_error_and_still_advances() {
    let (store, runner, scheduler) = fixture(true);
    let now = now_secs();
    let id = store
        .create_task(42, "doomed", "* * * * *", now - 60)
        .expect("create");

    scheduler.sweep().await.expect("sweep");
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    let task = store.task_by_id(&id).expect("read").expect("exists");
    let last_result = task.last_result.expect("last result");
    assert!(last_result.starts_with("ERROR: "), "{last_result}");
    assert!(task.next_run > now);
}

#[tokio::test]
async fn paused_tasks_are_skipped_entirely() {
    let (store, runner, scheduler) = fixture(false);
    let now = now_secs();
    let id = store
        .create_task(42, "paused away", "* * * * *", now - 60)
        .expect("create");
    store
        .set_task_status(&id, TaskStatus::Paused, None)
        .expect("pause");

    let swept = scheduler.sweep().await.expect("sweep");
    assert_eq!(swept, 0);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

    // Resume with a recomputed next_run in the future: still not due.
    let schedule = CronSchedule::parse("* * * * *").expect("parse");
    let next = next_run_after(&schedule, now_secs()).expect("next");
    store
        .set_task_status(&id, TaskStatus::Active, Some(next))
        .expect("resume");
    let task = store.task_by_id(&id).expect("read").expect("exists");
    assert_eq!(task.status, TaskStatus::Active);
    assert!(task.next_run > now_secs() - 60);
}

#[tokio::test]
async fn dead_schedule_after_run_is_logged_not_fatal() {
    let (store, runner, scheduler) = fixture(false);
    let now = now_secs();
    // February 30th never arrives, so the post-run next_run computation
    // fails even though the executor itself ran fine.
    let id = store
        .create_task(42, "works once", "0 0 30 2 *", now - 60)
        .expect("create");

    scheduler.sweep().await.expect("sweep");
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    // The sweep survived and the post-run update was skipped.
    let task = store.task_by_id(&id).expect("read").expect("exists");
    assert!(task.last_run.is_none());
    assert!(task.last_result.is_none());
}
