// src/logs.rs
//
// =============================================================================
// SANDCELL: LOG BROADCAST (v 0.4)
// =============================================================================
//
// Per-job publish/subscribe for stdout/stderr byte chunks.
//
// It decouples log production (the two pipe-pump tasks per job) from log
// consumption (any number of streaming subscribers, attaching at any time).
//
// Semantics:
// 1. Chunks carry monotonic sequence numbers in publish order.
// 2. A bounded ring retains the last N chunks; late subscribers get the
//    retained tail plus the live feed.
// 3. Closing the broadcast (terminal job transition) drains subscribers:
//    they receive the remaining tail, then end-of-stream.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub struct LogChunk {
    pub seq: u64,
    pub stream: LogStream,
    pub data: Vec<u8>,
}

// ============================================================================
// 1. THE BROADCAST
// ============================================================================

struct Ring {
    chunks: VecDeque<Arc<LogChunk>>,
    next_seq: u64,
    capacity: usize,
    closed: bool,
}

pub struct LogBroadcast {
    ring: Mutex<Ring>,
    notify: Notify,
}

impl LogBroadcast {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(Ring {
                chunks: VecDeque::with_capacity(capacity.min(64)),
                next_seq: 0,
                capacity: capacity.max(1),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Publishes one chunk; drops the oldest when the ring is full. A
    /// publish after close is discarded (pump tasks may race the closer).
    pub fn publish(&self, stream: LogStream, data: Vec<u8>) {
        {
            let mut ring = self.ring.lock().unwrap();
            if ring.closed {
                return;
            }
            let seq = ring.next_seq;
            ring.next_seq += 1;
            if ring.chunks.len() >= ring.capacity {
                ring.chunks.pop_front();
            }
            ring.chunks.push_back(Arc::new(LogChunk { seq, stream, data }));
        }
        self.notify.notify_waiters();
    }

    /// Terminal: no further chunks; subscribers drain then see None.
    pub fn close(&self) {
        {
            let mut ring = self.ring.lock().unwrap();
            ring.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().unwrap().closed
    }

    /// Current head sequence (next to be assigned).
    pub fn head(&self) -> u64 {
        self.ring.lock().unwrap().next_seq
    }

    /// `from_start` replays the retained tail; otherwise only chunks
    /// published after this call are delivered. `follow` keeps the
    /// subscriber attached for live chunks; without it the stream ends at
    /// the head observed here.
    pub fn subscribe(self: &Arc<Self>, from_start: bool, follow: bool) -> LogSubscriber {
        let ring = self.ring.lock().unwrap();
        let cursor = if from_start {
            ring.chunks.front().map(|c| c.seq).unwrap_or(ring.next_seq)
        } else {
            ring.next_seq
        };
        LogSubscriber {
            broadcast: Arc::clone(self),
            cursor,
            end: if follow { None } else { Some(ring.next_seq) },
        }
    }
}

// ============================================================================
// 2. THE SUBSCRIBER
// ============================================================================

pub struct LogSubscriber {
    broadcast: Arc<LogBroadcast>,
    cursor: u64,
    /// Non-follow streams stop at the head captured when they attached.
    end: Option<u64>,
}

impl LogSubscriber {
    /// Next chunk at or after the cursor; None once the broadcast is closed
    /// and the tail is drained (or the non-follow bound is reached). Chunks
    /// that fell off the ring before the subscriber caught up are skipped
    /// (cursor jumps forward).
    pub async fn next(&mut self) -> Option<Arc<LogChunk>> {
        loop {
            if let Some(end) = self.end {
                if self.cursor >= end {
                    return None;
                }
            }
            // Arm the waiter before inspecting state, otherwise a publish
            // racing between check and await is lost.
            let notified = self.broadcast.notify.notified();
            {
                let ring = self.broadcast.ring.lock().unwrap();
                if let Some(chunk) = ring.chunks.iter().find(|c| c.seq >= self.cursor) {
                    if self.end.is_some_and(|end| chunk.seq >= end) {
                        return None;
                    }
                    self.cursor = chunk.seq + 1;
                    return Some(Arc::clone(chunk));
                }
                if ring.closed {
                    return None;
                }
                // Bounded stream whose remaining range was evicted before
                // it was read: the head is already past the bound, so no
                // future publish can deliver it. Waiting would hang.
                if self.end.is_some_and(|end| ring.next_seq >= end) {
                    return None;
                }
            }
            notified.await;
        }
    }
}

// ============================================================================
// 3. THE REGISTRY
// ============================================================================

/// Job-id keyed broadcast directory. Closed broadcasts stay resident so
/// late subscribers can still read the retained tail of finished jobs.
#[derive(Default)]
pub struct LogRegistry {
    map: RwLock<HashMap<Uuid, Arc<LogBroadcast>>>,
    capacity: usize,
}

impl LogRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn open(&self, job_id: Uuid) -> Arc<LogBroadcast> {
        let mut map = self.map.write().unwrap();
        map.entry(job_id)
            .or_insert_with(|| LogBroadcast::new(self.capacity))
            .clone()
    }

    pub fn get(&self, job_id: &Uuid) -> Option<Arc<LogBroadcast>> {
        self.map.read().unwrap().get(job_id).cloned()
    }

    pub fn close(&self, job_id: &Uuid) {
        if let Some(b) = self.get(job_id) {
            b.close();
        }
    }
}
