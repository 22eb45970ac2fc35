//! Per-node device ledger.
//!
//! A ledger is built wholesale from the device set a node reports and is
//! never patched device-by-device: a new registration replaces it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::bandwidth::Bandwidth;

/// Role a device plays on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceType {
    /// Backs ephemeral/shared storage. The only device subject to accounting.
    #[serde(rename = "emptyDir")]
    EmptyDir,
    #[default]
    #[serde(rename = "others")]
    Others,
}

/// A device as reported in a device-registration event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    pub capacity: Bandwidth,
}

impl DeviceSpec {
    /// Key used to look up this device's normalizer.
    pub fn normalizer_key(&self) -> String {
        format!("{}-{}", self.vendor, self.model)
    }
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    pub normalizer_key: String,
    /// Fixed at registration.
    pub capacity: Bandwidth,
    /// Always componentwise `<= capacity`.
    pub allocatable: Bandwidth,
    pub is_default: bool,
}

impl Device {
    fn from_spec(spec: &DeviceSpec, is_default: bool) -> Self {
        Self {
            id: spec.id.clone(),
            normalizer_key: spec.normalizer_key(),
            capacity: spec.capacity,
            allocatable: spec.capacity,
            is_default,
        }
    }

    /// Overwrite allocatable with an observed value, clamped to capacity.
    pub fn set_allocatable(&mut self, observed: Bandwidth) {
        self.allocatable = observed.min(&self.capacity);
    }
}

/// The in-memory bandwidth record for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeLedger {
    pub node: String,
    pub devices: BTreeMap<String, Device>,
    /// Always a key of `devices` when set.
    pub default_device: Option<String>,
}

impl NodeLedger {
    /// Build a ledger from raw device specs: allocatable starts equal to capacity.
    pub fn from_specs(node: &str, specs: &[DeviceSpec]) -> Self {
        let mut flagged: Vec<&str> = specs
            .iter()
            .filter(|s| s.device_type == DeviceType::EmptyDir)
            .map(|s| s.id.as_str())
            .collect();
        flagged.sort_unstable();
        flagged.dedup();

        if flagged.len() > 1 {
            warn!(
                node,
                candidates = ?flagged,
                "Several default devices reported, using the first"
            );
        }
        let default_device = flagged.first().map(|id| id.to_string());

        let devices = specs
            .iter()
            .map(|spec| {
                let is_default = default_device.as_deref() == Some(spec.id.as_str());
                (spec.id.clone(), Device::from_spec(spec, is_default))
            })
            .collect();

        Self {
            node: node.to_string(),
            devices,
            default_device,
        }
    }

    pub fn default_device(&self) -> Option<&Device> {
        self.default_device
            .as_ref()
            .and_then(|id| self.devices.get(id))
    }

    pub fn default_device_mut(&mut self) -> Option<&mut Device> {
        match self.default_device.as_ref() {
            Some(id) => self.devices.get_mut(id),
            None => None,
        }
    }

    /// Dump every device at debug level.
    pub fn log_devices(&self) {
        for device in self.devices.values() {
            debug!(
                node = %self.node,
                device = %device.id,
                normalizer = %device.normalizer_key,
                default = device.is_default,
                capacity = %device.capacity,
                allocatable = %device.allocatable,
                "Ledger device"
            );
        }
    }
}

/// Kind tag for extended per-node resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    DiskIo,
}

/// A per-node extended resource held by the cache.
///
/// Only disk I/O bandwidth exists today; new kinds get their own variant.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeResource {
    DiskIo(NodeLedger),
}

impl NodeResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            NodeResource::DiskIo(_) => ResourceKind::DiskIo,
        }
    }
}
