//! The admission engine: one explicitly constructed instance per process,
//! wiring the ledger cache, reservation context, reconcilers, normalizers
//! and event handlers together.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::bandwidth::Bandwidth;
use crate::cache::handle::{BandwidthError, CacheHandle};
use crate::cache::ledger::NodeLedger;
use crate::cache::store::BandwidthCache;
use crate::config::Config;
use crate::events::{ClusterEvent, EventProcessor, WorkloadDirectory};
use crate::metrics::Metrics;
use crate::normalizer::{NormalizeError, NormalizerRegistry, ProfileNormalizer};
use crate::reservation::context::{ReservationContext, ReservationError, Workload};
use crate::reservation::queue::ReconcileQueue;
use crate::reservation::reconciler::Reconciler;
use crate::reservation::record::{InMemoryRecordStore, RecordStore, StoreError};
use crate::scorer::ScoreStrategy;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error(transparent)]
    Bandwidth(#[from] BandwidthError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),
}

pub struct AdmissionEngine {
    handle: Arc<CacheHandle>,
    ctx: Arc<ReservationContext>,
    normalizers: Arc<NormalizerRegistry>,
    directory: Arc<WorkloadDirectory>,
    store: Arc<dyn RecordStore>,
    processor: EventProcessor,
    reconciler: Arc<Reconciler>,
    metrics: Arc<Metrics>,
    strategy: ScoreStrategy,
    max_score: i64,
    workers: usize,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionEngine {
    /// Build an engine backed by a process-local record store.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::with_store(config, Arc::new(InMemoryRecordStore::new()))
    }

    pub fn with_store(config: &Config, store: Arc<dyn RecordStore>) -> anyhow::Result<Self> {
        config.validate()?;
        let strategy = config.scoring.strategy()?;
        let metrics = Arc::new(Metrics::new()?);

        let queue = Arc::new(ReconcileQueue::new(config.reconcile.rate_limit()));
        let ctx = Arc::new(ReservationContext::new(
            config.reservation.namespace_allowlist.clone(),
            queue,
        ));
        let handle = Arc::new(CacheHandle::new(Arc::new(BandwidthCache::new()), ctx.clone()));

        let normalizers = Arc::new(NormalizerRegistry::new());
        for profile in &config.normalizers {
            let normalizer = ProfileNormalizer::new(profile.clone());
            normalizers.set(&normalizer.key(), normalizer.into_fn())?;
        }

        let directory = Arc::new(WorkloadDirectory::new());
        let processor = EventProcessor::new(
            handle.clone(),
            ctx.clone(),
            normalizers.clone(),
            directory.clone(),
            store.clone(),
            metrics.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            ctx.clone(),
            store.clone(),
            config.reconcile.retry_policy(),
            metrics.clone(),
        ));

        info!(
            strategy = %strategy,
            max_score = config.scoring.max_score,
            normalizers = config.normalizers.len(),
            allowlist = ?config.reservation.namespace_allowlist,
            "Admission engine configured"
        );

        Ok(Self {
            handle,
            ctx,
            normalizers,
            directory,
            store,
            processor,
            reconciler,
            metrics,
            strategy,
            max_score: config.scoring.max_score,
            workers: config.reconcile.workers,
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the reconcile workers. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut handles = self.worker_handles.lock();
        if !handles.is_empty() {
            return;
        }
        *handles = self.reconciler.spawn_workers(self.workers);
        info!(workers = self.workers, "Reconcile workers started");
    }

    /// Stop accepting reconcile work, let queued tasks drain and wait for
    /// the workers to exit.
    pub async fn shutdown(&self) {
        self.ctx.queue().shut_down();
        let handles = std::mem::take(&mut *self.worker_handles.lock());
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Reconcile worker panicked: {e}");
            }
        }
        info!("Admission engine stopped");
    }

    /// The bandwidth `workload` needs on `node`.
    ///
    /// `None` for allow-listed workloads and workloads without I/O intent.
    pub fn request_for(
        &self,
        node: &str,
        workload: &Workload,
    ) -> Result<Option<Bandwidth>, AdmissionError> {
        if self.ctx.is_allowlisted(&workload.namespace) || workload.io_intent().is_none() {
            return Ok(None);
        }
        let key = self.handle.normalizer_key_for(node)?;
        Ok(self.normalizers.request_for(&key, workload)?)
    }

    /// Whether `node` can host `workload`.
    ///
    /// Normalization failures are logged and let the workload through.
    pub fn filter(&self, node: &str, workload: &Workload) -> Result<(), AdmissionError> {
        let result: Result<(), AdmissionError> = match self.request_for(node, workload) {
            Ok(Some(request)) => self.handle.can_admit(node, &request).map_err(Into::into),
            Ok(None) => Ok(()),
            Err(AdmissionError::Normalize(e)) => {
                warn!(node, workload = %workload.id(), "Skipping bandwidth check: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => self.metrics.admission("admitted"),
            Err(e) => {
                self.metrics.admission("rejected");
                debug!(node, workload = %workload.id(), "Node rejected: {e}");
            }
        }
        result
    }

    /// Score `node` for `workload` in `[0, max_score]`.
    pub fn score(&self, node: &str, workload: &Workload) -> Result<i64, AdmissionError> {
        let request = match self.request_for(node, workload) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(self.max_score),
            // No ledger to resolve a request against; the strategy scores
            // unaccounted nodes.
            Err(AdmissionError::Bandwidth(BandwidthError::NotRegistered { .. })) => Bandwidth::ZERO,
            Err(AdmissionError::Normalize(e)) => {
                warn!(node, workload = %workload.id(), "Scoring without request: {e}");
                return Ok(self.max_score);
            }
            Err(e) => return Err(e),
        };
        Ok(self
            .strategy
            .score(&self.handle, node, &request, self.max_score)?)
    }

    /// Commit `workload`'s bandwidth on `node` and record the reservation.
    ///
    /// Returns whether bandwidth was committed. The commit is rolled back if
    /// the reservation cannot be recorded.
    pub fn reserve(&self, node: &str, workload: &Workload) -> Result<bool, AdmissionError> {
        let result = self.try_reserve(node, workload);
        let outcome = match &result {
            Ok(true) => "committed",
            Ok(false) => "skipped",
            Err(_) => "error",
        };
        self.metrics.reservation("reserve", outcome);

        // Committed workloads are bound under the reservation lock.
        if result == Ok(false) {
            self.directory.upsert(bound_to(node, workload));
        }
        result
    }

    fn try_reserve(&self, node: &str, workload: &Workload) -> Result<bool, AdmissionError> {
        let request = match self.request_for(node, workload) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(false),
            Err(AdmissionError::Normalize(e)) => {
                warn!(node, workload = %workload.id(), "Reserving without accounting: {e}");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        // Check, commit, record and bind all happen under the reservation
        // lock, so neither a concurrent reserve of the same workload nor a
        // node rebuild can interleave.
        let id = workload.id();
        let mut state = self.ctx.lock();
        if state.is_reserved(node, &id) {
            debug!(node, workload = %id, "Workload already reserved");
            return Ok(false);
        }

        self.handle.commit(node, &id, &request)?;
        if let Err(e) = state.insert(node, &id, request) {
            warn!(node, workload = %id, "Recording reservation failed, rolling back: {e}");
            if let Err(e) = self.handle.revert_commit(node, &request) {
                warn!(node, workload = %id, "Rollback failed: {e}");
            }
            return Err(e.into());
        }
        self.directory.upsert(bound_to(node, workload));
        drop(state);

        self.ctx.queue().add(node);
        info!(node, workload = %id, %request, "Reserved bandwidth");
        Ok(true)
    }

    /// Release `workload`'s bandwidth on `node` and drop its reservation.
    ///
    /// Returns whether bandwidth was released.
    pub fn unreserve(&self, node: &str, workload: &Workload) -> Result<bool, AdmissionError> {
        if self.ctx.is_allowlisted(&workload.namespace) {
            self.metrics.reservation("unreserve", "skipped");
            return Ok(false);
        }
        let id = workload.id();
        let released = match self.handle.release(node, &id) {
            Ok(_) => true,
            Err(BandwidthError::WorkloadNotFound { .. }) => false,
            Err(e) => {
                self.metrics.reservation("unreserve", "error");
                return Err(e.into());
            }
        };
        self.ctx.remove_reservation(node, workload)?;
        self.directory.remove(&id);

        self.metrics
            .reservation("unreserve", if released { "released" } else { "skipped" });
        Ok(released)
    }

    /// Handle one cluster event. Returns whether it changed any state.
    pub async fn process_event(&self, event: ClusterEvent) -> bool {
        if let ClusterEvent::WorkloadDeleted { workload } = &event {
            self.directory.remove(&workload.id());
        }
        self.processor.handle(event).await
    }

    /// Agent write path: store an observed allocatable snapshot in the node's
    /// record and feed the resulting status update through the event handlers.
    pub async fn report_status(
        &self,
        node: &str,
        allocatable: BTreeMap<String, Bandwidth>,
    ) -> Result<bool, StoreError> {
        let (old, new) = self.store.report_status(node, allocatable).await?;
        Ok(self
            .process_event(ClusterEvent::StatusUpdated { old, new })
            .await)
    }

    pub fn node_snapshot(&self, node: &str) -> Option<NodeLedger> {
        self.handle.snapshot(node)
    }

    pub fn handle(&self) -> &Arc<CacheHandle> {
        &self.handle
    }

    pub fn context(&self) -> &Arc<ReservationContext> {
        &self.ctx
    }

    pub fn normalizers(&self) -> &Arc<NormalizerRegistry> {
        &self.normalizers
    }

    pub fn directory(&self) -> &Arc<WorkloadDirectory> {
        &self.directory
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn max_score(&self) -> i64 {
        self.max_score
    }
}

/// `workload` as bound to `node`.
fn bound_to(node: &str, workload: &Workload) -> Workload {
    let mut bound = workload.clone();
    bound.node_name = Some(node.to_string());
    bound
}
