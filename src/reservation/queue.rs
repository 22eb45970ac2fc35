//! Rate-limited reconciliation queue.
//!
//! Items are node names. A node is queued at most once; if it is re-added
//! while a worker is processing it, it is marked dirty and re-queued when
//! that worker calls [`ReconcileQueue::done`]. Dequeues are paced by a token
//! bucket so a burst of reservations cannot flood the external store.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Sustained dequeues per second.
    pub qps: f64,
    /// Dequeues allowed back-to-back before pacing starts.
    pub burst: u32,
}

impl RateLimit {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self { qps, burst }
    }

    pub fn unlimited() -> Self {
        Self {
            qps: f64::INFINITY,
            burst: u32::MAX,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            tokens: f64::from(limit.burst),
            last: now,
        }
    }

    /// Take one token, returning how long the caller must wait for it.
    fn reserve(&mut self, now: Instant) -> Duration {
        if self.limit.qps.is_infinite() {
            return Duration::ZERO;
        }
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.limit.qps).min(f64::from(self.limit.burst));
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.limit.qps)
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    shutting_down: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub total_added: u64,
    pub total_coalesced: u64,
    pub total_dequeued: u64,
}

pub struct ReconcileQueue {
    state: Mutex<QueueState>,
    bucket: Mutex<TokenBucket>,
    stats: Mutex<QueueStats>,
    notify: Notify,
}

impl ReconcileQueue {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            bucket: Mutex::new(TokenBucket::new(limit, Instant::now())),
            stats: Mutex::new(QueueStats::default()),
            notify: Notify::new(),
        }
    }

    /// Queue a node for reconciliation. Ignored after shutdown.
    pub fn add(&self, node: &str) {
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        self.stats.lock().total_added += 1;

        if state.processing.contains(node) {
            state.dirty.insert(node.to_string());
            self.stats.lock().total_coalesced += 1;
            return;
        }
        if !state.queued.insert(node.to_string()) {
            self.stats.lock().total_coalesced += 1;
            return;
        }
        state.pending.push_back(node.to_string());
        drop(state);

        debug!(node, "Queued reconciliation");
        self.notify.notify_one();
    }

    /// Wait for the next node to reconcile.
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn next(&self) -> Option<String> {
        let node = loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(node) = state.pending.pop_front() {
                    state.queued.remove(&node);
                    state.processing.insert(node.clone());
                    break node;
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        };

        self.stats.lock().total_dequeued += 1;
        let wait = self.bucket.lock().reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        Some(node)
    }

    /// Mark a node's processing finished, re-queuing it if it was re-added meanwhile.
    pub fn done(&self, node: &str) {
        let mut state = self.state.lock();
        state.processing.remove(node);
        if state.dirty.remove(node) && state.queued.insert(node.to_string()) {
            state.pending.push_back(node.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting work and wake every idle worker.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of queued (not in-flight) nodes.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().processing.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.lock().clone()
    }
}
