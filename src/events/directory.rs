use std::collections::HashMap;

use parking_lot::RwLock;

use crate::reservation::context::{Workload, WorkloadId};

/// Source of the workloads currently bound to a node.
pub trait WorkloadLister: Send + Sync {
    fn list_on_node(&self, node: &str) -> Vec<Workload>;
}

/// Scheduled workloads known to this process, keyed by identity.
#[derive(Debug, Default)]
pub struct WorkloadDirectory {
    workloads: RwLock<HashMap<WorkloadId, Workload>>,
}

impl WorkloadDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workload.
    pub fn upsert(&self, workload: Workload) {
        self.workloads.write().insert(workload.id(), workload);
    }

    pub fn remove(&self, id: &WorkloadId) -> Option<Workload> {
        self.workloads.write().remove(id)
    }

    pub fn get(&self, id: &WorkloadId) -> Option<Workload> {
        self.workloads.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.workloads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WorkloadLister for WorkloadDirectory {
    fn list_on_node(&self, node: &str) -> Vec<Workload> {
        let mut found: Vec<Workload> = self
            .workloads
            .read()
            .values()
            .filter(|w| w.node_name.as_deref() == Some(node))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(&b.id()));
        found
    }
}
