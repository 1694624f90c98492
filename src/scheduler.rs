// src/scheduler.rs
//
// =============================================================================
// SANDCELL: DEFERRED-EXECUTION SCHEDULER (v 0.4)
// =============================================================================
//
// A min-heap of (fire time, job id) plus one cooperative timer task.
//
// The loop sleeps until the earliest fire time and wakes early on either a
// new-job signal (an insertion with an earlier deadline must shorten the
// sleep) or shutdown. The signal is a Notify permit: non-blocking to send,
// single-slot, recomputed sleep on every wake.
//
// Cancellation removes from the heap up to the instant an entry is popped;
// after that the job is in the executor's hands and cancellation follows
// the normal Running path.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub fire_at: DateTime<Utc>,
    pub job_id: Uuid,
}

// ============================================================================
// 1. THE HEAP
// ============================================================================

/// Binary min-heap by fire time with an id->slot map so cancellation can
/// find its entry without scanning.
#[derive(Default)]
pub struct TimerHeap {
    entries: Vec<ScheduledEntry>,
    pos: HashMap<Uuid, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn peek(&self) -> Option<ScheduledEntry> {
        self.entries.first().copied()
    }

    pub fn push(&mut self, entry: ScheduledEntry) {
        let idx = self.entries.len();
        self.pos.insert(entry.job_id, idx);
        self.entries.push(entry);
        self.sift_up(idx);
    }

    pub fn pop(&mut self) -> Option<ScheduledEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        self.sync_pos(0);
        let entry = self.entries.pop().expect("non-empty");
        self.pos.remove(&entry.job_id);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    /// Removes the entry for `job_id`; false when it is not queued (already
    /// popped or never scheduled).
    pub fn remove(&mut self, job_id: &Uuid) -> bool {
        let idx = match self.pos.remove(job_id) {
            Some(i) => i,
            None => return false,
        };
        let last = self.entries.len() - 1;
        if idx != last {
            self.entries.swap(idx, last);
            self.sync_pos(idx);
        }
        self.entries.pop();
        if idx < self.entries.len() {
            // The swapped-in element may violate either direction.
            self.sift_down(idx);
            self.sift_up(idx);
        }
        true
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[idx].fire_at >= self.entries[parent].fire_at {
                break;
            }
            self.entries.swap(idx, parent);
            self.sync_pos(idx);
            self.sync_pos(parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < self.entries.len()
                && self.entries[left].fire_at < self.entries[smallest].fire_at
            {
                smallest = left;
            }
            if right < self.entries.len()
                && self.entries[right].fire_at < self.entries[smallest].fire_at
            {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.entries.swap(idx, smallest);
            self.sync_pos(idx);
            self.sync_pos(smallest);
            idx = smallest;
        }
    }

    fn sync_pos(&mut self, idx: usize) {
        if let Some(e) = self.entries.get(idx) {
            self.pos.insert(e.job_id, idx);
        }
    }
}

// ============================================================================
// 2. THE LOOP
// ============================================================================

pub struct Scheduler {
    heap: Mutex<TimerHeap>,
    wake: Notify,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(TimerHeap::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn schedule(&self, job_id: Uuid, fire_at: DateTime<Utc>) {
        self.heap.lock().unwrap().push(ScheduledEntry { fire_at, job_id });
        self.wake.notify_one();
        log::info!("job {} parked until {}", job_id, fire_at);
    }

    /// True when the entry was still queued and is now gone.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        let removed = self.heap.lock().unwrap().remove(job_id);
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    pub fn queued(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// The single timer task. `fire` re-enters the executor with a job
    /// whose time has come.
    pub async fn run<F, Fut>(&self, mut fire: F)
    where
        F: FnMut(Uuid) -> Fut,
        Fut: Future<Output = ()>,
    {
        log::info!("scheduler loop active");
        loop {
            // Arm before inspecting state so a schedule() racing this gap
            // still wakes us.
            let woken = self.wake.notified();

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            let next = self.heap.lock().unwrap().peek();
            match next {
                None => woken.await,
                Some(entry) => {
                    let now = Utc::now();
                    if entry.fire_at <= now {
                        // Pop under the lock; the entry may have been
                        // cancelled between peek and now.
                        let popped = {
                            let mut heap = self.heap.lock().unwrap();
                            match heap.peek() {
                                Some(e) if e.fire_at <= now => heap.pop(),
                                _ => None,
                            }
                        };
                        if let Some(e) = popped {
                            fire(e.job_id).await;
                        }
                        continue;
                    }
                    let wait = (entry.fire_at - now)
                        .to_std()
                        .unwrap_or(Duration::from_millis(1));
                    tokio::select! {
                        _ = woken => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
        log::info!("scheduler loop stopped ({} entries abandoned)", self.queued());
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
