//! Node → ledger map.
//!
//! Two lock levels: the map lock only guards membership and is held just long
//! enough to clone an `Arc`; each ledger carries its own mutex for device
//! mutation, so work on unrelated nodes never contends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cache::ledger::NodeResource;

/// A node's resource behind its own lock.
pub type SharedResource = Arc<Mutex<NodeResource>>;

#[derive(Default)]
pub struct BandwidthCache {
    nodes: RwLock<HashMap<String, SharedResource>>,
}

impl BandwidthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a node's resource wholesale.
    pub fn set_node(&self, node: &str, resource: NodeResource) {
        self.nodes
            .write()
            .insert(node.to_string(), Arc::new(Mutex::new(resource)));
    }

    pub fn get_node(&self, node: &str) -> Option<SharedResource> {
        self.nodes.read().get(node).cloned()
    }

    /// Remove a node. Returns whether it was present.
    pub fn delete_node(&self, node: &str) -> bool {
        self.nodes.write().remove(node).is_some()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.read().contains_key(node)
    }

    /// Registered node names, sorted.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ledger::NodeLedger;

    fn resource(node: &str) -> NodeResource {
        NodeResource::DiskIo(NodeLedger::from_specs(node, &[]))
    }

    #[test]
    fn test_set_get_delete() {
        let cache = BandwidthCache::new();
        assert!(cache.get_node("n1").is_none());

        cache.set_node("n1", resource("n1"));
        cache.set_node("n2", resource("n2"));
        assert_eq!(cache.node_names(), vec!["n1", "n2"]);
        assert!(cache.get_node("n1").is_some());

        assert!(cache.delete_node("n1"));
        assert!(!cache.delete_node("n1"));
        assert!(!cache.contains("n1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ledger_lock_does_not_block_other_nodes() {
        let cache = BandwidthCache::new();
        cache.set_node("n1", resource("n1"));
        cache.set_node("n2", resource("n2"));

        let n1 = cache.get_node("n1").unwrap();
        let _held = n1.lock();

        // Another node's ledger and the membership map stay available.
        let n2 = cache.get_node("n2").unwrap();
        assert!(n2.try_lock().is_some());
        cache.set_node("n3", resource("n3"));
        assert!(cache.contains("n3"));
    }

    #[test]
    fn test_set_node_replaces_wholesale() {
        let cache = BandwidthCache::new();
        cache.set_node("n1", resource("n1"));
        let old = cache.get_node("n1").unwrap();
        cache.set_node("n1", resource("n1"));
        let new = cache.get_node("n1").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
    }
}
