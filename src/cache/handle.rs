//! Admission, commit and release on node ledgers.
//!
//! Everything here is synchronous and lock-protected: no call blocks on the
//! external record or performs network I/O. Only the default device of a
//! node is subject to accounting.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::bandwidth::{Bandwidth, Dimension};
use crate::cache::ledger::{Device, DeviceSpec, NodeLedger, NodeResource};
use crate::cache::store::BandwidthCache;
use crate::reservation::context::{ReservationContext, ReservationError, WorkloadId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BandwidthError {
    #[error("node {node} is not registered for disk I/O accounting")]
    NotRegistered { node: String },

    #[error("node {node} has insufficient {dimension} bandwidth")]
    InsufficientBandwidth { node: String, dimension: Dimension },

    #[error("no committed request recorded for workload {workload} on node {node}")]
    WorkloadNotFound { node: String, workload: String },

    #[error("node {node} has no default device registered")]
    NoDefaultDevice { node: String },

    #[error("node {node} has zero allocatable {dimension} bandwidth")]
    ZeroAllocatable { node: String, dimension: Dimension },

    #[error(transparent)]
    Reservation(#[from] ReservationError),
}

impl BandwidthError {
    /// The dimension that caused an admission rejection, if any.
    pub fn dimension(&self) -> Option<Dimension> {
        match self {
            BandwidthError::InsufficientBandwidth { dimension, .. }
            | BandwidthError::ZeroAllocatable { dimension, .. } => Some(*dimension),
            _ => None,
        }
    }
}

pub struct CacheHandle {
    cache: Arc<BandwidthCache>,
    ctx: Arc<ReservationContext>,
}

impl CacheHandle {
    pub fn new(cache: Arc<BandwidthCache>, ctx: Arc<ReservationContext>) -> Self {
        Self { cache, ctx }
    }

    /// Build a fresh ledger from a node's reported devices and install it,
    /// replacing any previous one.
    pub fn register_node(&self, node: &str, specs: &[DeviceSpec]) {
        let ledger = NodeLedger::from_specs(node, specs);
        info!(
            node,
            devices = ledger.devices.len(),
            default_device = ledger.default_device.as_deref().unwrap_or("<none>"),
            "Registered node ledger"
        );
        ledger.log_devices();
        self.cache.set_node(node, NodeResource::DiskIo(ledger));
    }

    /// Drop a node's ledger and its reservation entry.
    pub fn deregister_node(&self, node: &str) -> bool {
        let removed = self.cache.delete_node(node);
        self.ctx.remove_node(node);
        info!(node, removed, "Deregistered node ledger");
        removed
    }

    pub fn is_registered(&self, node: &str) -> bool {
        self.cache.contains(node)
    }

    pub fn registered_nodes(&self) -> Vec<String> {
        self.cache.node_names()
    }

    /// Overwrite device allocatable from an observed snapshot.
    ///
    /// Values are clamped to capacity; unknown device ids are ignored.
    /// Returns how many devices were updated.
    pub fn sync_allocatable(
        &self,
        node: &str,
        observed: &BTreeMap<String, Bandwidth>,
    ) -> Result<usize, BandwidthError> {
        self.with_ledger(node, |ledger| {
            let mut applied = 0;
            for (device_id, bandwidth) in observed {
                match ledger.devices.get_mut(device_id) {
                    Some(device) => {
                        device.set_allocatable(*bandwidth);
                        applied += 1;
                    }
                    None => warn!(node, device = %device_id, "Observed bandwidth for unknown device"),
                }
            }
            debug!(node, applied, "Synced observed allocatable");
            Ok(applied)
        })
    }

    /// Whether `request` fits the default device's allocatable on every dimension.
    pub fn can_admit(&self, node: &str, request: &Bandwidth) -> Result<(), BandwidthError> {
        self.with_default_device(node, |device| check_fits(node, device, request))
    }

    /// Average of read and write request/allocatable ratios, for relative scoring only.
    pub fn pressure_ratio(&self, node: &str, request: &Bandwidth) -> Result<f64, BandwidthError> {
        self.with_default_device(node, |device| {
            let ratio = |dimension: Dimension| {
                let allocatable = device.allocatable.get(dimension);
                if allocatable == 0 {
                    return Err(BandwidthError::ZeroAllocatable {
                        node: node.to_string(),
                        dimension,
                    });
                }
                Ok(request.get(dimension) as f64 / allocatable as f64)
            };
            Ok((ratio(Dimension::Read)? + ratio(Dimension::Write)?) / 2.0)
        })
    }

    /// Debit the default device by exactly `request`.
    ///
    /// Admission is re-checked under the ledger lock, so a commit never drives
    /// allocatable below zero. Not idempotent: callers commit a workload at
    /// most once per node. Returns the allocatable left afterwards.
    pub fn commit(
        &self,
        node: &str,
        workload: &WorkloadId,
        request: &Bandwidth,
    ) -> Result<Bandwidth, BandwidthError> {
        let left = self.with_default_device(node, |device| {
            check_fits(node, device, request)?;
            device.allocatable = device.allocatable.checked_sub(request).ok_or_else(|| {
                BandwidthError::InsufficientBandwidth {
                    node: node.to_string(),
                    dimension: Dimension::Total,
                }
            })?;
            Ok(device.allocatable)
        })?;
        debug!(node, workload = %workload, %request, allocatable = %left, "Committed bandwidth");
        Ok(left)
    }

    /// Undo a commit whose reservation could not be recorded.
    pub fn revert_commit(&self, node: &str, request: &Bandwidth) -> Result<Bandwidth, BandwidthError> {
        self.with_default_device(node, |device| {
            device.allocatable = device.allocatable.add_capped(request, &device.capacity);
            Ok(device.allocatable)
        })
    }

    /// Credit back the request previously committed for `workload` and drop
    /// it from the node's reservation set, so a second release finds nothing.
    ///
    /// Takes the reservation lock before the ledger lock.
    pub fn release(&self, node: &str, workload: &WorkloadId) -> Result<Bandwidth, BandwidthError> {
        let mut state = self.ctx.lock();
        let request = state
            .request(workload)
            .filter(|_| state.is_reserved(node, workload))
            .ok_or_else(|| BandwidthError::WorkloadNotFound {
                node: node.to_string(),
                workload: workload.to_string(),
            })?;

        let left = self.with_default_device(node, |device| {
            device.allocatable = device.allocatable.add_capped(&request, &device.capacity);
            Ok(device.allocatable)
        })?;
        state.remove(node, workload)?;
        drop(state);
        self.ctx.queue().add(node);

        debug!(node, workload = %workload, %request, allocatable = %left, "Released bandwidth");
        Ok(left)
    }

    /// Vendor-model key of the node's default device.
    pub fn normalizer_key_for(&self, node: &str) -> Result<String, BandwidthError> {
        self.with_default_device(node, |device| Ok(device.normalizer_key.clone()))
    }

    /// Current allocatable of the node's default device.
    pub fn allocatable(&self, node: &str) -> Result<Bandwidth, BandwidthError> {
        self.with_default_device(node, |device| Ok(device.allocatable))
    }

    /// Copy of a node's ledger.
    pub fn snapshot(&self, node: &str) -> Option<NodeLedger> {
        let resource = self.cache.get_node(node)?;
        let guard = resource.lock();
        match &*guard {
            NodeResource::DiskIo(ledger) => Some(ledger.clone()),
        }
    }

    /// Dump a node's ledger at debug level.
    pub fn log_ledger(&self, node: &str) {
        if let Some(ledger) = self.snapshot(node) {
            ledger.log_devices();
        }
    }

    fn with_ledger<T>(
        &self,
        node: &str,
        f: impl FnOnce(&mut NodeLedger) -> Result<T, BandwidthError>,
    ) -> Result<T, BandwidthError> {
        let resource = self
            .cache
            .get_node(node)
            .ok_or_else(|| BandwidthError::NotRegistered {
                node: node.to_string(),
            })?;
        let mut guard = resource.lock();
        match &mut *guard {
            NodeResource::DiskIo(ledger) => f(ledger),
        }
    }

    fn with_default_device<T>(
        &self,
        node: &str,
        f: impl FnOnce(&mut Device) -> Result<T, BandwidthError>,
    ) -> Result<T, BandwidthError> {
        self.with_ledger(node, |ledger| {
            let device = ledger
                .default_device_mut()
                .ok_or_else(|| BandwidthError::NoDefaultDevice {
                    node: node.to_string(),
                })?;
            f(device)
        })
    }
}

fn check_fits(node: &str, device: &Device, request: &Bandwidth) -> Result<(), BandwidthError> {
    match request.first_exceeding(&device.allocatable) {
        Some(dimension) => Err(BandwidthError::InsufficientBandwidth {
            node: node.to_string(),
            dimension,
        }),
        None => Ok(()),
    }
}
