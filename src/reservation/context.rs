//! Reservation tracking.
//!
//! Records which workloads hold bandwidth on which node, together with the
//! exact request committed for each, and schedules reconciliation of the
//! node's external record after every change.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::bandwidth::Bandwidth;
use crate::reservation::queue::ReconcileQueue;

/// Annotation carrying a workload's raw I/O intent.
pub const DISKIO_ANNOTATION: &str = "blockio.kubernetes.io/resources";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    #[error("node {0} has no reservation entry")]
    NodeNotTracked(String),
}

/// Stable identity of a workload: name plus uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadId {
    pub name: String,
    pub uid: String,
}

impl WorkloadId {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.name, self.uid)
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub uid: String,
    /// Node the workload is bound to, if any.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Workload {
    pub fn id(&self) -> WorkloadId {
        WorkloadId::new(self.name.clone(), self.uid.clone())
    }

    /// The raw I/O intent annotation, if present.
    pub fn io_intent(&self) -> Option<&str> {
        self.annotations.get(DISKIO_ANNOTATION).map(String::as_str)
    }
}

/// Lock-protected reservation state.
#[derive(Debug, Default)]
pub struct ReservationState {
    reserved: HashMap<String, BTreeSet<WorkloadId>>,
    requests: HashMap<WorkloadId, Bandwidth>,
    written_generation: HashMap<String, i64>,
}

impl ReservationState {
    /// The request committed for a workload.
    pub fn request(&self, id: &WorkloadId) -> Option<Bandwidth> {
        self.requests.get(id).copied()
    }

    pub fn is_reserved(&self, node: &str, id: &WorkloadId) -> bool {
        self.reserved
            .get(node)
            .is_some_and(|set| set.contains(id))
    }

    pub fn is_tracked(&self, node: &str) -> bool {
        self.reserved.contains_key(node)
    }

    /// Add a workload to a tracked node's set with its committed request.
    pub fn insert(
        &mut self,
        node: &str,
        id: &WorkloadId,
        request: Bandwidth,
    ) -> Result<(), ReservationError> {
        let set = self
            .reserved
            .get_mut(node)
            .ok_or_else(|| ReservationError::NodeNotTracked(node.to_string()))?;
        set.insert(id.clone());
        self.requests.insert(id.clone(), request);
        Ok(())
    }

    /// Take a workload out of a tracked node's set.
    ///
    /// Returns whether it was in the set.
    pub fn remove(&mut self, node: &str, id: &WorkloadId) -> Result<bool, ReservationError> {
        let set = self
            .reserved
            .get_mut(node)
            .ok_or_else(|| ReservationError::NodeNotTracked(node.to_string()))?;
        let removed = set.remove(id);
        self.requests.remove(id);
        Ok(removed)
    }

    /// Replace a node's set wholesale with already-committed entries.
    pub fn restore(&mut self, node: &str, entries: Vec<(WorkloadId, Bandwidth)>) {
        let set = entries.iter().map(|(id, _)| id.clone()).collect();
        if let Some(old) = self.reserved.insert(node.to_string(), set) {
            for id in old {
                self.requests.remove(&id);
            }
        }
        self.requests.extend(entries);
    }
}

pub struct ReservationContext {
    state: Mutex<ReservationState>,
    namespace_allowlist: Vec<String>,
    queue: Arc<ReconcileQueue>,
}

impl ReservationContext {
    pub fn new(namespace_allowlist: Vec<String>, queue: Arc<ReconcileQueue>) -> Self {
        Self {
            state: Mutex::new(ReservationState::default()),
            namespace_allowlist,
            queue,
        }
    }

    /// Acquire the reservation lock.
    ///
    /// Anything that also locks a ledger must take this lock first.
    pub fn lock(&self) -> MutexGuard<'_, ReservationState> {
        self.state.lock()
    }

    pub fn is_allowlisted(&self, namespace: &str) -> bool {
        self.namespace_allowlist.iter().any(|ns| ns == namespace)
    }

    pub fn namespace_allowlist(&self) -> &[String] {
        &self.namespace_allowlist
    }

    /// Start tracking a node with an empty reservation set, dropping any
    /// previous entry for it.
    pub fn reset_node(&self, node: &str) {
        self.restore_node(node, Vec::new());
    }

    /// Replace a node's reservation set wholesale with already-committed
    /// entries. Does not schedule reconciliation.
    pub fn restore_node(&self, node: &str, entries: Vec<(WorkloadId, Bandwidth)>) {
        self.state.lock().restore(node, entries);
    }

    /// Stop tracking a node and forget the requests reserved on it.
    pub fn remove_node(&self, node: &str) -> bool {
        let mut state = self.state.lock();
        state.written_generation.remove(node);
        match state.reserved.remove(node) {
            Some(ids) => {
                for id in ids {
                    state.requests.remove(&id);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, node: &str) -> bool {
        self.state.lock().is_tracked(node)
    }

    /// Record a committed reservation and schedule reconciliation.
    ///
    /// Returns `Ok(false)` when the workload's namespace is allow-listed and
    /// nothing was recorded.
    pub fn add_reservation(
        &self,
        node: &str,
        workload: &Workload,
        request: Bandwidth,
    ) -> Result<bool, ReservationError> {
        if self.is_allowlisted(&workload.namespace) {
            return Ok(false);
        }
        let id = workload.id();
        self.state.lock().insert(node, &id, request)?;
        debug!(node, workload = %id, %request, "Reservation recorded");
        self.queue.add(node);
        Ok(true)
    }

    /// Drop a workload's reservation and schedule reconciliation.
    ///
    /// Returns whether a reservation was removed.
    pub fn remove_reservation(
        &self,
        node: &str,
        workload: &Workload,
    ) -> Result<bool, ReservationError> {
        if self.is_allowlisted(&workload.namespace) {
            return Ok(false);
        }
        let id = workload.id();
        let removed = self.state.lock().remove(node, &id)?;
        debug!(node, workload = %id, removed, "Reservation dropped");
        self.queue.add(node);
        Ok(removed)
    }

    /// Reserved workload identities on a node, in stable order.
    pub fn reserved_workloads(&self, node: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .reserved
            .get(node)
            .map(|set| set.iter().map(ToString::to_string).collect())
    }

    pub fn request(&self, id: &WorkloadId) -> Option<Bandwidth> {
        self.state.lock().request(id)
    }

    /// Note the generation this engine last wrote to a node's record.
    pub fn record_written(&self, node: &str, generation: i64) {
        self.state
            .lock()
            .written_generation
            .insert(node.to_string(), generation);
    }

    pub fn written_generation(&self, node: &str) -> Option<i64> {
        self.state.lock().written_generation.get(node).copied()
    }

    pub fn queue(&self) -> &Arc<ReconcileQueue> {
        &self.queue
    }
}
