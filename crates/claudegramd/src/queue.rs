//! Admission control for agent turns: a sliding-window rate limit per chat,
//! strict FIFO ordering within a chat, and a global concurrency cap across
//! all chats.
//!
//! Per-chat ordering rides on a fair `tokio::sync::Mutex`; the global cap is
//! a semaphore acquired only after the chat predecessor has settled, so a
//! busy chat cannot hold a slot while it waits its own turn. Both guards are
//! RAII, which keeps slots from leaking when a task fails or is cancelled
//! mid-flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

pub const MAX_CONCURRENT: usize = 2;
pub const MAX_MESSAGES_PER_MINUTE: usize = 10;
const RATE_WINDOW_MS: u64 = 60_000;

/// Queue key for scheduled work, disjoint from the interactive key space so
/// a slow cron prompt never blocks the same chat's live messages.
pub fn task_queue_key(chat_id: i64) -> String {
    format!("__task__{chat_id}")
}

pub fn chat_queue_key(chat_id: i64) -> String {
    chat_id.to_string()
}

struct Lane {
    serial: Arc<AsyncMutex<()>>,
    pending: usize,
}

pub struct ChatQueue {
    permits: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, Lane>>,
    windows: Mutex<HashMap<i64, Vec<u64>>>,
}

impl Default for ChatQueue {
    fn default() -> Self {
        Self::new(MAX_CONCURRENT)
    }
}

impl ChatQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            lanes: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an admission for the chat. Returns false when the chat has
    /// already used its window budget; a rejected admission leaves no trace.
    pub fn admit(&self, chat_id: i64) -> bool {
        self.admit_at(chat_id, now_ms())
    }

    /// Window check without recording. Used by command handlers.
    pub fn probe(&self, chat_id: i64) -> bool {
        self.probe_at(chat_id, now_ms())
    }

    fn admit_at(&self, chat_id: i64, now: u64) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        let window = windows.entry(chat_id).or_default();
        prune_window(window, now);
        if window.len() >= MAX_MESSAGES_PER_MINUTE {
            return false;
        }
        window.push(now);
        true
    }

    fn probe_at(&self, chat_id: i64, now: u64) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        let window = windows.entry(chat_id).or_default();
        prune_window(window, now);
        window.len() < MAX_MESSAGES_PER_MINUTE
    }

    /// Run `task` after every earlier task queued under `key` has settled,
    /// holding one of the global execution slots for the duration of the
    /// body only.
    pub async fn run<F, T>(&self, key: &str, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let serial = self.checkout_lane(key);
        let _lane_guard = LaneGuard { queue: self, key };

        let _serial = serial.lock().await;
        // The semaphore is created once and never closed, so acquisition can
        // only fail if the runtime is tearing down; run unguarded then.
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                tracing::error!("concurrency semaphore closed; running without a slot");
                None
            }
        };
        task.await
    }

    /// How many tasks are queued or running under `key`.
    pub fn pending(&self, key: &str) -> usize {
        self.lanes
            .lock()
            .ok()
            .and_then(|lanes| lanes.get(key).map(|lane| lane.pending))
            .unwrap_or(0)
    }

    fn checkout_lane(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let Ok(mut lanes) = self.lanes.lock() else {
            return Arc::new(AsyncMutex::new(()));
        };
        let lane = lanes.entry(key.to_string()).or_insert_with(|| Lane {
            serial: Arc::new(AsyncMutex::new(())),
            pending: 0,
        });
        lane.pending += 1;
        lane.serial.clone()
    }

    fn release_lane(&self, key: &str) {
        let Ok(mut lanes) = self.lanes.lock() else {
            return;
        };
        if let Some(lane) = lanes.get_mut(key) {
            lane.pending = lane.pending.saturating_sub(1);
            if lane.pending == 0 {
                lanes.remove(key);
            }
        }
    }
}

/// Decrements the lane counter even when the task future is dropped before
/// completion.
struct LaneGuard<'a> {
    queue: &'a ChatQueue,
    key: &'a str,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        self.queue.release_lane(self.key);
    }
}

fn prune_window(window: &mut Vec<u64>, now: u64) {
    window.retain(|stamp| now.saturating_sub(*stamp) < RATE_WINDOW_MS);
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
