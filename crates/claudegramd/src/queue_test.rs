use super::{ChatQueue, MAX_MESSAGES_PER_MINUTE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn rate_window_rejects_the_eleventh_and_recovers() {
    let queue = ChatQueue::default();
    let t0 = 1_700_000_000_000u64;

    for offset in 0..MAX_MESSAGES_PER_MINUTE as u64 {
        assert!(queue.admit_at(5, t0 + offset * 3_000));
    }
    // The 11th admission inside the same 60s window must be rejected, and the
    // rejection itself must not consume budget.
    assert!(!queue.admit_at(5, t0 + 30_000));
    assert!(!queue.probe_at(5, t0 + 30_000));

    // Just past the first stamp's window the oldest entry expires.
    assert!(queue.probe_at(5, t0 + 60_001));
    assert!(queue.admit_at(5, t0 + 60_001));
}

#[test]
fn probe_does_not_consume_budget() {
    let queue = ChatQueue::default();
    let t0 = 1_700_000_000_000u64;
    for _ in 0..100 {
        assert!(queue.probe_at(9, t0));
    }
    for offset in 0..MAX_MESSAGES_PER_MINUTE as u64 {
        assert!(queue.admit_at(9, t0 + offset));
    }
}

#[test]
fn windows_are_per_chat() {
    let queue = ChatQueue::default();
    let t0 = 1_700_000_000_000u64;
    for offset in 0..MAX_MESSAGES_PER_MINUTE as u64 {
        assert!(queue.admit_at(1, t0 + offset));
    }
    assert!(!queue.admit_at(1, t0 + 100));
    assert!(queue.admit_at(2, t0 + 100));
}

#[tokio::test]
async fn same_chat_tasks_never_overlap() {
    let queue = Arc::new(ChatQueue::default());
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let queue = queue.clone();
        let running = running.clone();
        let overlapped = overlapped.clone();
        handles.push(tokio::spawn(async move {
            queue
                .run("chat-1", async move {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlapped.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    assert_eq!(queue.pending("chat-1"), 0);
}

#[tokio::test]
async fn global_cap_limits_cross_chat_concurrency() {
    let queue = Arc::new(ChatQueue::new(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for chat in 0..5 {
        let queue = queue.clone();
        let running = running.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            queue
                .run(&format!("chat-{chat}"), async move {
                    let live = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(live, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn failed_task_releases_slot_and_successor_runs() {
    let queue = Arc::new(ChatQueue::new(1));

    let failed: Result<(), &str> = queue.run("chat-1", async { Err("boom") }).await;
    assert!(failed.is_err());

    // The slot and the lane must both be free for the successor.
    let ok: Result<u32, &str> = queue.run("chat-1", async { Ok(7) }).await;
    assert_eq!(ok, Ok(7));
    assert_eq!(queue.pending("chat-1"), 0);
}

#[tokio::test]
async fn cancelled_task_does_not_leak_slots() {
    let queue = Arc::new(ChatQueue::new(1));

    let queue_clone = queue.clone();
    let handle = tokio::spawn(async move {
        queue_clone
            .run("chat-1", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();
    let _ = handle.await;

    // With the aborted task gone, a fresh task must acquire the single slot.
    let done = tokio::time::timeout(Duration::from_secs(1), queue.run("chat-2", async { 3 }))
        .await
        .expect("slot was leaked by the aborted task");
    assert_eq!(done, 3);
    assert_eq!(queue.pending("chat-1"), 0);
}
