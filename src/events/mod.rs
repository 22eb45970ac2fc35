//! Cluster events that keep ledgers and reservations in sync.
//!
//! - [`directory`]: In-process view of scheduled workloads
//! - [`processor`]: Best-effort handlers for each event kind

pub mod directory;
pub mod processor;

use serde::{Deserialize, Serialize};

use crate::cache::ledger::DeviceSpec;
use crate::reservation::context::Workload;
use crate::reservation::record::NodeRecord;

pub use directory::{WorkloadDirectory, WorkloadLister};
pub use processor::{EventError, EventProcessor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A node reported its device set.
    DevicesAdded {
        node: String,
        devices: Vec<DeviceSpec>,
    },
    /// A node's device set went away.
    DevicesRemoved { node: String },
    /// The reporting agent rewrote a node record's status.
    StatusUpdated { old: NodeRecord, new: NodeRecord },
    WorkloadDeleted { workload: Workload },
}

impl ClusterEvent {
    /// Metric label for the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::DevicesAdded { .. } => "devices_added",
            ClusterEvent::DevicesRemoved { .. } => "devices_removed",
            ClusterEvent::StatusUpdated { .. } => "status_updated",
            ClusterEvent::WorkloadDeleted { .. } => "workload_deleted",
        }
    }
}
