//! External per-node record.
//!
//! The record mirrors a node's reserved workloads (written by this engine)
//! and its observed allocatable bandwidth (written by the node's reporting
//! agent). Writers use optimistic concurrency on `resource_version`; changes to the
//! reserved set bump `generation`, and the agent stamps `observed_generation` with
//! the generation it has seen.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::bandwidth::Bandwidth;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record for node {node} changed underneath us (expected version {expected}, found {actual})")]
    Conflict {
        node: String,
        expected: u64,
        actual: u64,
    },

    #[error("record for node {0} not found")]
    NotFound(String),

    #[error("record for node {0} already exists")]
    AlreadyExists(String),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Agent-written half of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Device id → currently allocatable bandwidth.
    #[serde(default)]
    pub allocatable: BTreeMap<String, Bandwidth>,
}

impl RecordStatus {
    /// Content hash used to detect status changes.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        format!("sha256:{}", hex::encode(&digest[..16]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub reserved_workloads: Vec<String>,
    #[serde(default)]
    pub status: RecordStatus,
}

impl NodeRecord {
    pub fn new(node: &str, reserved_workloads: Vec<String>) -> Self {
        Self {
            node: node.to_string(),
            generation: 0,
            resource_version: 0,
            reserved_workloads,
            status: RecordStatus::default(),
        }
    }

    /// Whether the reporting agent has observed the current generation.
    pub fn is_observed(&self) -> bool {
        self.status.observed_generation == Some(self.generation)
    }

    /// Order-insensitive comparison of the reserved set.
    pub fn same_reservations(&self, other: &[String]) -> bool {
        let mut mine = self.reserved_workloads.clone();
        let mut theirs = other.to_vec();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}

/// Durable home of node records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, node: &str) -> Result<Option<NodeRecord>, StoreError>;

    /// Create a record. Fails with `AlreadyExists` if one is present.
    async fn create(&self, record: NodeRecord) -> Result<NodeRecord, StoreError>;

    /// Replace the engine-owned fields of a record.
    ///
    /// Fails with `Conflict` unless `record.resource_version` matches the stored one.
    async fn update(&self, record: NodeRecord) -> Result<NodeRecord, StoreError>;

    /// Agent write path: replace the status, returning the record before and after.
    async fn report_status(
        &self,
        node: &str,
        allocatable: BTreeMap<String, Bandwidth>,
    ) -> Result<(NodeRecord, NodeRecord), StoreError>;
}

/// Process-local record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, NodeRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a record without going through the async trait.
    pub fn snapshot(&self, node: &str) -> Option<NodeRecord> {
        self.records.lock().get(node).cloned()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, node: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.records.lock().get(node).cloned())
    }

    async fn create(&self, mut record: NodeRecord) -> Result<NodeRecord, StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(&record.node) {
            return Err(StoreError::AlreadyExists(record.node));
        }
        record.generation = 1;
        record.resource_version = 1;
        records.insert(record.node.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, record: NodeRecord) -> Result<NodeRecord, StoreError> {
        let mut records = self.records.lock();
        let stored = records
            .get_mut(&record.node)
            .ok_or_else(|| StoreError::NotFound(record.node.clone()))?;

        if stored.resource_version != record.resource_version {
            return Err(StoreError::Conflict {
                node: record.node,
                expected: record.resource_version,
                actual: stored.resource_version,
            });
        }

        if stored.reserved_workloads != record.reserved_workloads {
            stored.reserved_workloads = record.reserved_workloads;
            stored.generation += 1;
        }
        stored.resource_version += 1;
        Ok(stored.clone())
    }

    async fn report_status(
        &self,
        node: &str,
        allocatable: BTreeMap<String, Bandwidth>,
    ) -> Result<(NodeRecord, NodeRecord), StoreError> {
        let mut records = self.records.lock();
        let stored = records
            .get_mut(node)
            .ok_or_else(|| StoreError::NotFound(node.to_string()))?;

        let old = stored.clone();
        stored.status = RecordStatus {
            observed_generation: Some(stored.generation),
            allocatable,
        };
        stored.resource_version += 1;
        Ok((old, stored.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_update_bumps_generation_on_spec_change() {
        let store = InMemoryRecordStore::new();
        let created = store
            .create(NodeRecord::new("n1", vec!["a-1".to_string()]))
            .await
            .unwrap();
        assert_eq!((created.generation, created.resource_version), (1, 1));

        let mut next = created.clone();
        next.reserved_workloads.push("b-2".to_string());
        let updated = store.update(next).await.unwrap();
        assert_eq!((updated.generation, updated.resource_version), (2, 2));

        // Same reserved set: version moves, generation does not.
        let again = store.update(updated.clone()).await.unwrap();
        assert_eq!((again.generation, again.resource_version), (2, 3));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryRecordStore::new();
        let created = store.create(NodeRecord::new("n1", vec![])).await.unwrap();
        store.update(created.clone()).await.unwrap();

        let err = store.update(created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = InMemoryRecordStore::new();
        store.create(NodeRecord::new("n1", vec![])).await.unwrap();
        assert_eq!(
            store.create(NodeRecord::new("n1", vec![])).await,
            Err(StoreError::AlreadyExists("n1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_report_status_stamps_observed_generation() {
        let store = InMemoryRecordStore::new();
        store.create(NodeRecord::new("n1", vec![])).await.unwrap();

        let mut alloc = BTreeMap::new();
        alloc.insert("sda".to_string(), Bandwidth::new(1, 2, 3));
        let (old, new) = store.report_status("n1", alloc).await.unwrap();

        assert!(!old.is_observed());
        assert!(new.is_observed());
        assert_ne!(old.status.content_hash(), new.status.content_hash());
    }

    #[test]
    fn test_content_hash_is_stable() {
        let mut status = RecordStatus::default();
        status
            .allocatable
            .insert("sda".to_string(), Bandwidth::new(10, 10, 20));
        assert_eq!(status.content_hash(), status.clone().content_hash());
        assert!(status.content_hash().starts_with("sha256:"));
    }

    #[test]
    fn test_same_reservations_ignores_order() {
        let record = NodeRecord::new("n1", vec!["b".to_string(), "a".to_string()]);
        assert!(record.same_reservations(&["a".to_string(), "b".to_string()]));
        assert!(!record.same_reservations(&["a".to_string()]));
    }
}
