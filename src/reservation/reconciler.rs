//! Reconciliation workers.
//!
//! Workers drain the [`ReconcileQueue`] for the life of the process. Each task
//! pushes a node's current reserved set into its external record with
//! fetch-modify-write; version conflicts re-fetch and retry with jittered
//! exponential back-off up to a fixed number of attempts, after which the
//! task is dropped and the record stays stale until the next change for the
//! node re-queues it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::reservation::context::ReservationContext;
use crate::reservation::record::{NodeRecord, RecordStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("node {0} is not tracked for reservations")]
    NodeNotTracked(String),

    #[error("gave up on node {node} after {attempts} conflicting attempts: {last}")]
    RetriesExhausted {
        node: String,
        attempts: u32,
        last: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Bounded exponential back-off with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0 to 1.0+).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        let delay = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::rng().random_range(0.0..=self.jitter) * delay
        } else {
            0.0
        };
        Duration::from_secs_f64(delay + jitter)
    }
}

pub struct Reconciler {
    ctx: Arc<ReservationContext>,
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        ctx: Arc<ReservationContext>,
        store: Arc<dyn RecordStore>,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ctx,
            store,
            policy,
            metrics,
        }
    }

    /// Spawn `workers` tasks draining the context's queue until it shuts down.
    pub fn spawn_workers(self: &Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|worker| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_worker(worker).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize) {
        let queue = Arc::clone(self.ctx.queue());
        debug!(worker, "Reconcile worker started");

        while let Some(node) = queue.next().await {
            match self.reconcile_node(&node).await {
                Ok(record) => {
                    self.metrics.reconcile("ok");
                    debug!(
                        worker,
                        node = %node,
                        generation = record.generation,
                        reserved = record.reserved_workloads.len(),
                        "Record reconciled"
                    );
                }
                Err(ReconcileError::NodeNotTracked(_)) => {
                    // Node deregistered after the task was queued.
                    self.metrics.reconcile("untracked");
                    debug!(worker, node = %node, "Dropping reconcile for untracked node");
                }
                Err(e @ ReconcileError::RetriesExhausted { .. }) => {
                    self.metrics.reconcile("exhausted");
                    error!(worker, node = %node, "Dropping reconcile task: {e}");
                }
                Err(e) => {
                    self.metrics.reconcile("error");
                    error!(worker, node = %node, "Reconcile failed: {e}");
                }
            }
            queue.done(&node);
        }

        info!(worker, "Reconcile worker stopped");
    }

    /// Push the node's current reserved set into its external record.
    pub async fn reconcile_node(&self, node: &str) -> Result<NodeRecord, ReconcileError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let reserved = self
                .ctx
                .reserved_workloads(node)
                .ok_or_else(|| ReconcileError::NodeNotTracked(node.to_string()))?;

            let result = match self.store.get(node).await? {
                None => self.store.create(NodeRecord::new(node, reserved)).await,
                Some(mut record) => {
                    record.reserved_workloads = reserved;
                    self.store.update(record).await
                }
            };

            match result {
                Ok(record) => {
                    self.ctx.record_written(node, record.generation);
                    if attempt > 1 {
                        info!(node, attempt, "Record update succeeded after retry");
                    }
                    return Ok(record);
                }
                Err(e) if is_retryable(&e) && attempt < max_attempts => {
                    let delay = self.policy.delay(attempt - 1);
                    warn!(
                        node,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Record update conflicted, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_retryable(&e) => {
                    return Err(ReconcileError::RetriesExhausted {
                        node: node.to_string(),
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// A lost create race is a conflict too: re-fetching finds the winner's record.
fn is_retryable(err: &StoreError) -> bool {
    matches!(err, StoreError::Conflict { .. } | StoreError::AlreadyExists(_))
}
