//! Event handlers.
//!
//! Every handler is best-effort and independent of the others: failures are
//! logged and counted, and never stop later events from being handled.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ClusterEvent, WorkloadLister};
use crate::cache::bandwidth::Bandwidth;
use crate::cache::handle::{BandwidthError, CacheHandle};
use crate::cache::ledger::DeviceSpec;
use crate::metrics::Metrics;
use crate::normalizer::NormalizerRegistry;
use crate::reservation::context::{ReservationContext, ReservationError, Workload, WorkloadId};
use crate::reservation::record::{NodeRecord, RecordStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error(transparent)]
    Bandwidth(#[from] BandwidthError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct EventProcessor {
    handle: Arc<CacheHandle>,
    ctx: Arc<ReservationContext>,
    normalizers: Arc<NormalizerRegistry>,
    lister: Arc<dyn WorkloadLister>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
}

impl EventProcessor {
    pub fn new(
        handle: Arc<CacheHandle>,
        ctx: Arc<ReservationContext>,
        normalizers: Arc<NormalizerRegistry>,
        lister: Arc<dyn WorkloadLister>,
        store: Arc<dyn RecordStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            handle,
            ctx,
            normalizers,
            lister,
            store,
            metrics,
        }
    }

    /// Dispatch one event. Returns whether it changed any state.
    pub async fn handle(&self, event: ClusterEvent) -> bool {
        let kind = event.kind();
        let result = match event {
            ClusterEvent::DevicesAdded { node, devices } => {
                self.on_devices_added(&node, &devices).await.map(|_| true)
            }
            ClusterEvent::DevicesRemoved { node } => Ok(self.on_devices_removed(&node)),
            ClusterEvent::StatusUpdated { old, new } => self.on_status_updated(&old, &new),
            ClusterEvent::WorkloadDeleted { workload } => self.on_workload_deleted(&workload),
        };

        self.metrics
            .set_registered_nodes(self.handle.registered_nodes().len());
        match result {
            Ok(applied) => {
                self.metrics
                    .event(kind, if applied { "applied" } else { "skipped" });
                applied
            }
            Err(e) => {
                self.metrics.event(kind, "error");
                warn!(kind, "Event handler failed: {e}");
                false
            }
        }
    }

    /// Install a fresh ledger for `node` and rebuild its committed debits
    /// from the workloads already bound to it. Returns how many workloads
    /// were backfilled.
    ///
    /// The rebuild holds the reservation lock throughout, so a concurrent
    /// reserve lands either wholly before it (and is backfilled) or wholly
    /// after it.
    pub async fn on_devices_added(
        &self,
        node: &str,
        devices: &[DeviceSpec],
    ) -> Result<usize, EventError> {
        let backfilled = {
            let mut state = self.ctx.lock();
            self.handle.register_node(node, devices);
            let entries = self.backfill(node);
            let backfilled = entries.len();
            state.restore(node, entries);
            backfilled
        };
        info!(node, backfilled, "Node bandwidth accounting (re)built");

        self.adopt_record(node).await;
        Ok(backfilled)
    }

    fn backfill(&self, node: &str) -> Vec<(WorkloadId, Bandwidth)> {
        let key = match self.handle.normalizer_key_for(node) {
            Ok(key) => key,
            Err(e) => {
                warn!(node, "Skipping backfill: {e}");
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for workload in self.lister.list_on_node(node) {
            if self.ctx.is_allowlisted(&workload.namespace) {
                continue;
            }
            let id = workload.id();
            let request = match self.normalizers.request_for(&key, &workload) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    warn!(node, workload = %id, "Cannot normalize request: {e}");
                    continue;
                }
            };
            match self.handle.commit(node, &id, &request) {
                Ok(_) => entries.push((id, request)),
                Err(e) => warn!(node, workload = %id, "Backfill commit failed: {e}"),
            }
        }
        entries
    }

    /// Bring the external record in line with a freshly rebuilt node.
    async fn adopt_record(&self, node: &str) {
        let Some(reserved) = self.ctx.reserved_workloads(node) else {
            return;
        };

        match self.store.get(node).await {
            Ok(None) => match self.store.create(NodeRecord::new(node, reserved)).await {
                Ok(record) => {
                    self.ctx.record_written(node, record.generation);
                    debug!(node, generation = record.generation, "Created node record");
                }
                Err(e) => {
                    warn!(node, "Creating node record failed, queueing reconcile: {e}");
                    self.ctx.queue().add(node);
                }
            },
            Ok(Some(record)) if record.same_reservations(&reserved) && record.is_observed() => {
                self.ctx.record_written(node, record.generation);
                match self.handle.sync_allocatable(node, &record.status.allocatable) {
                    Ok(applied) => debug!(node, applied, "Adopted observed allocatable from record"),
                    Err(e) => warn!(node, "Adopting record status failed: {e}"),
                }
            }
            Ok(Some(_)) => self.ctx.queue().add(node),
            Err(e) => {
                warn!(node, "Fetching node record failed, queueing reconcile: {e}");
                self.ctx.queue().add(node);
            }
        }
    }

    pub fn on_devices_removed(&self, node: &str) -> bool {
        self.handle.log_ledger(node);
        self.handle.deregister_node(node)
    }

    /// Apply an agent-written status if it is new content for the
    /// generation this engine last wrote.
    pub fn on_status_updated(&self, old: &NodeRecord, new: &NodeRecord) -> Result<bool, EventError> {
        let node = new.node.as_str();
        if old.status.content_hash() == new.status.content_hash() {
            return Ok(false);
        }
        if !new.is_observed() {
            debug!(
                node,
                generation = new.generation,
                observed = ?new.status.observed_generation,
                "Ignoring status for unobserved generation"
            );
            return Ok(false);
        }
        if let Some(written) = self.ctx.written_generation(node) {
            if written != new.generation {
                debug!(
                    node,
                    written,
                    generation = new.generation,
                    "Ignoring status for a generation this engine did not write"
                );
                return Ok(false);
            }
        }

        let applied = self.sync(node, &new.status.allocatable)?;
        Ok(applied > 0)
    }

    fn sync(&self, node: &str, allocatable: &BTreeMap<String, Bandwidth>) -> Result<usize, EventError> {
        let applied = self.handle.sync_allocatable(node, allocatable)?;
        self.handle.log_ledger(node);
        Ok(applied)
    }

    /// Credit back a deleted workload's request and drop its reservation.
    pub fn on_workload_deleted(&self, workload: &Workload) -> Result<bool, EventError> {
        let Some(node) = workload.node_name.as_deref() else {
            return Ok(false);
        };
        if self.ctx.is_allowlisted(&workload.namespace) {
            return Ok(false);
        }
        let id = workload.id();

        let released = match self.handle.release(node, &id) {
            Ok(left) => {
                debug!(node, workload = %id, allocatable = %left, "Released deleted workload");
                true
            }
            Err(BandwidthError::WorkloadNotFound { .. }) => false,
            Err(e) => {
                warn!(node, workload = %id, "Release failed: {e}");
                false
            }
        };
        self.handle.log_ledger(node);

        match self.ctx.remove_reservation(node, workload) {
            Ok(removed) => Ok(released || removed),
            Err(ReservationError::NodeNotTracked(_)) => Ok(released),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::cache::ledger::DeviceType;
    use crate::cache::store::BandwidthCache;
    use crate::events::WorkloadDirectory;
    use crate::normalizer::NormalizeFn;
    use crate::reservation::context::DISKIO_ANNOTATION;
    use crate::reservation::queue::{RateLimit, ReconcileQueue};
    use crate::reservation::record::InMemoryRecordStore;

    struct Fixture {
        processor: EventProcessor,
        handle: Arc<CacheHandle>,
        ctx: Arc<ReservationContext>,
        directory: Arc<WorkloadDirectory>,
        store: Arc<InMemoryRecordStore>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(ReconcileQueue::new(RateLimit::unlimited()));
        let ctx = Arc::new(ReservationContext::new(vec!["kube-system".to_string()], queue));
        let handle = Arc::new(CacheHandle::new(Arc::new(BandwidthCache::new()), ctx.clone()));
        let normalizers = Arc::new(NormalizerRegistry::new());
        let passthrough: NormalizeFn =
            Arc::new(|raw: &str| -> Result<String, crate::normalizer::NormalizeError> {
                Ok(raw.to_string())
            });
        normalizers.set("Intel-P4510", passthrough).unwrap();
        let directory = Arc::new(WorkloadDirectory::new());
        let store = Arc::new(InMemoryRecordStore::new());

        let processor = EventProcessor::new(
            handle.clone(),
            ctx.clone(),
            normalizers,
            directory.clone(),
            store.clone(),
            Arc::new(Metrics::new().unwrap()),
        );
        Fixture {
            processor,
            handle,
            ctx,
            directory,
            store,
        }
    }

    fn devices() -> Vec<DeviceSpec> {
        vec![DeviceSpec {
            id: "sda".to_string(),
            vendor: "Intel".to_string(),
            model: "P4510".to_string(),
            device_type: DeviceType::EmptyDir,
            capacity: Bandwidth::new(1000, 1000, 2000),
        }]
    }

    fn workload(name: &str, namespace: &str, intent: Option<&str>) -> Workload {
        let mut annotations = HashMap::new();
        if let Some(intent) = intent {
            annotations.insert(DISKIO_ANNOTATION.to_string(), intent.to_string());
        }
        Workload {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: "u".to_string(),
            node_name: Some("n1".to_string()),
            annotations,
        }
    }

    #[tokio::test]
    async fn test_devices_added_backfills_and_creates_record() {
        let f = fixture();
        f.directory
            .upsert(workload("a", "default", Some(r#"{"read": 100, "write": 50}"#)));
        f.directory.upsert(workload("plain", "default", None));
        f.directory
            .upsert(workload("dns", "kube-system", Some(r#"{"read": 1, "write": 1}"#)));
        f.directory.upsert(workload("bad", "default", Some("garbage")));

        let backfilled = f.processor.on_devices_added("n1", &devices()).await.unwrap();

        assert_eq!(backfilled, 1);
        assert_eq!(
            f.handle.allocatable("n1").unwrap(),
            Bandwidth::new(900, 950, 1850)
        );
        assert_eq!(f.ctx.reserved_workloads("n1").unwrap(), vec!["a-u"]);

        let record = f.store.snapshot("n1").unwrap();
        assert_eq!(record.reserved_workloads, vec!["a-u"]);
        assert_eq!(f.ctx.written_generation("n1"), Some(record.generation));
        assert!(f.ctx.queue().is_empty());
    }

    #[tokio::test]
    async fn test_devices_added_adopts_observed_record() {
        let f = fixture();
        f.store.create(NodeRecord::new("n1", vec![])).await.unwrap();
        let mut observed = BTreeMap::new();
        observed.insert("sda".to_string(), Bandwidth::new(600, 700, 1300));
        f.store.report_status("n1", observed).await.unwrap();

        f.processor.on_devices_added("n1", &devices()).await.unwrap();

        assert_eq!(
            f.handle.allocatable("n1").unwrap(),
            Bandwidth::new(600, 700, 1300)
        );
        assert!(f.ctx.queue().is_empty());
    }

    #[tokio::test]
    async fn test_devices_added_queues_reconcile_for_stale_record() {
        let f = fixture();
        f.store
            .create(NodeRecord::new("n1", vec!["gone-1".to_string()]))
            .await
            .unwrap();

        f.processor.on_devices_added("n1", &devices()).await.unwrap();

        assert_eq!(f.ctx.queue().len(), 1);
        assert_eq!(
            f.handle.allocatable("n1").unwrap(),
            Bandwidth::new(1000, 1000, 2000)
        );
    }

    #[tokio::test]
    async fn test_devices_removed_deregisters() {
        let f = fixture();
        f.processor.on_devices_added("n1", &devices()).await.unwrap();

        assert!(f.processor.on_devices_removed("n1"));
        assert!(!f.handle.is_registered("n1"));
        assert!(!f.ctx.is_tracked("n1"));
        assert!(!f.processor.on_devices_removed("n1"));
    }

    #[tokio::test]
    async fn test_status_update_guard() {
        let f = fixture();
        f.processor.on_devices_added("n1", &devices()).await.unwrap();
        let written = f.store.snapshot("n1").unwrap();

        let mut observed = BTreeMap::new();
        observed.insert("sda".to_string(), Bandwidth::new(10, 20, 30));
        let (old, new) = f.store.report_status("n1", observed).await.unwrap();

        // Same content: nothing to do.
        assert_eq!(f.processor.on_status_updated(&new, &new), Ok(false));

        // Status for a generation the agent has not observed.
        let mut unobserved = new.clone();
        unobserved.status.observed_generation = Some(written.generation - 1);
        assert_eq!(f.processor.on_status_updated(&old, &unobserved), Ok(false));

        // Observed, but not the generation this engine wrote.
        let mut foreign = new.clone();
        foreign.generation += 5;
        foreign.status.observed_generation = Some(foreign.generation);
        assert_eq!(f.processor.on_status_updated(&old, &foreign), Ok(false));

        assert_eq!(
            f.handle.allocatable("n1").unwrap(),
            Bandwidth::new(1000, 1000, 2000)
        );

        assert_eq!(f.processor.on_status_updated(&old, &new), Ok(true));
        assert_eq!(f.handle.allocatable("n1").unwrap(), Bandwidth::new(10, 20, 30));
    }

    #[tokio::test]
    async fn test_workload_deleted_releases() {
        let f = fixture();
        let w = workload("a", "default", Some(r#"{"read": 100, "write": 50}"#));
        f.directory.upsert(w.clone());
        f.processor.on_devices_added("n1", &devices()).await.unwrap();

        assert_eq!(f.processor.on_workload_deleted(&w), Ok(true));
        assert_eq!(
            f.handle.allocatable("n1").unwrap(),
            Bandwidth::new(1000, 1000, 2000)
        );
        assert!(f.ctx.reserved_workloads("n1").unwrap().is_empty());
        assert_eq!(f.ctx.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_workload_deleted_edge_cases() {
        let f = fixture();
        let mut unbound = workload("a", "default", None);
        unbound.node_name = None;
        assert_eq!(f.processor.on_workload_deleted(&unbound), Ok(false));

        let dns = workload("dns", "kube-system", None);
        assert_eq!(f.processor.on_workload_deleted(&dns), Ok(false));

        // Node never registered: logged, not fatal.
        let stray = workload("stray", "default", None);
        assert_eq!(f.processor.on_workload_deleted(&stray), Ok(false));
    }

    #[tokio::test]
    async fn test_handle_counts_outcomes() {
        let f = fixture();
        let metrics = f.processor.metrics.clone();

        assert!(
            f.processor
                .handle(ClusterEvent::DevicesAdded {
                    node: "n1".to_string(),
                    devices: devices(),
                })
                .await
        );
        assert!(
            !f.processor
                .handle(ClusterEvent::DevicesRemoved {
                    node: "ghost".to_string(),
                })
                .await
        );

        assert_eq!(metrics.event_count("devices_added", "applied"), 1);
        assert_eq!(metrics.event_count("devices_removed", "skipped"), 1);
    }
}
