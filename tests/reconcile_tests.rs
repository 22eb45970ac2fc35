//! Integration tests for reservation reconciliation against node records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use diskio_aware::cache::bandwidth::Bandwidth;
use diskio_aware::metrics::Metrics;
use diskio_aware::reservation::context::{ReservationContext, Workload};
use diskio_aware::reservation::queue::{RateLimit, ReconcileQueue};
use diskio_aware::reservation::reconciler::{ReconcileError, Reconciler, RetryPolicy};
use diskio_aware::reservation::record::{InMemoryRecordStore, NodeRecord, RecordStore, StoreError};

/// Wraps the in-memory store and makes the first `failures` updates lose a
/// version race, as if another writer got there first.
struct RacingStore {
    inner: InMemoryRecordStore,
    failures: u32,
    updates: AtomicU32,
}

impl RacingStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            failures,
            updates: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl RecordStore for RacingStore {
    async fn get(&self, node: &str) -> Result<Option<NodeRecord>, StoreError> {
        self.inner.get(node).await
    }

    async fn create(&self, record: NodeRecord) -> Result<NodeRecord, StoreError> {
        self.inner.create(record).await
    }

    async fn update(&self, record: NodeRecord) -> Result<NodeRecord, StoreError> {
        let n = self.updates.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            // Someone else bumps the version underneath us.
            self.inner.report_status(&record.node, BTreeMap::new()).await?;
        }
        self.inner.update(record).await
    }

    async fn report_status(
        &self,
        node: &str,
        allocatable: BTreeMap<String, Bandwidth>,
    ) -> Result<(NodeRecord, NodeRecord), StoreError> {
        self.inner.report_status(node, allocatable).await
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base: Duration::from_millis(1),
        max: Duration::from_millis(5),
        jitter: 1.0,
    }
}

fn context(limit: RateLimit) -> Arc<ReservationContext> {
    let queue = Arc::new(ReconcileQueue::new(limit));
    Arc::new(ReservationContext::new(vec!["kube-system".to_string()], queue))
}

fn workload(name: &str) -> Workload {
    Workload {
        name: name.to_string(),
        namespace: "default".to_string(),
        uid: "1".to_string(),
        node_name: Some("n1".to_string()),
        annotations: Default::default(),
    }
}

#[tokio::test]
async fn test_conflict_is_retried_until_success() {
    let ctx = context(RateLimit::unlimited());
    ctx.reset_node("n1");
    let store = Arc::new(RacingStore::new(2));
    store.create(NodeRecord::new("n1", vec![])).await.unwrap();

    ctx.add_reservation("n1", &workload("a"), Bandwidth::new(1, 1, 2))
        .unwrap();
    let reconciler = Reconciler::new(
        ctx.clone(),
        store.clone(),
        policy(3),
        Arc::new(Metrics::new().unwrap()),
    );

    let record = reconciler.reconcile_node("n1").await.unwrap();
    assert_eq!(record.reserved_workloads, vec!["a-1"]);
    assert_eq!(store.updates.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.written_generation("n1"), Some(record.generation));
}

#[tokio::test]
async fn test_conflicts_past_the_bound_are_dropped() {
    let ctx = context(RateLimit::unlimited());
    ctx.reset_node("n1");
    let store = Arc::new(RacingStore::new(u32::MAX));
    store.create(NodeRecord::new("n1", vec![])).await.unwrap();
    ctx.add_reservation("n1", &workload("a"), Bandwidth::new(1, 1, 2))
        .unwrap();

    let metrics = Arc::new(Metrics::new().unwrap());
    let reconciler = Arc::new(Reconciler::new(ctx.clone(), store.clone(), policy(3), metrics.clone()));

    let err = reconciler.reconcile_node("n1").await.unwrap_err();
    assert!(matches!(err, ReconcileError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(store.updates.load(Ordering::SeqCst), 3);

    // Through the worker pool the task is dropped, not retried forever.
    let handles = reconciler.spawn_workers(1);
    ctx.queue().shut_down();
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(store.updates.load(Ordering::SeqCst), 6);
    assert_eq!(metrics.reconcile_count("exhausted"), 1);
    assert!(store.inner.snapshot("n1").unwrap().reserved_workloads.is_empty());
}

#[tokio::test]
async fn test_latest_reserved_set_wins() {
    let ctx = context(RateLimit::unlimited());
    ctx.reset_node("n1");
    let store = Arc::new(InMemoryRecordStore::new());

    for name in ["a", "b", "c"] {
        ctx.add_reservation("n1", &workload(name), Bandwidth::new(1, 1, 2))
            .unwrap();
    }
    ctx.remove_reservation("n1", &workload("b")).unwrap();

    // Four changes, one queued task.
    assert_eq!(ctx.queue().len(), 1);
    assert_eq!(ctx.queue().stats().total_coalesced, 3);

    let reconciler = Arc::new(Reconciler::new(
        ctx.clone(),
        store.clone(),
        policy(3),
        Arc::new(Metrics::new().unwrap()),
    ));
    let handles = reconciler.spawn_workers(2);
    ctx.queue().shut_down();
    for handle in handles {
        handle.await.unwrap();
    }

    let record = store.snapshot("n1").unwrap();
    assert_eq!(record.reserved_workloads, vec!["a-1", "c-1"]);
}

#[tokio::test]
async fn test_allowlisted_workloads_never_reach_the_record() {
    let ctx = context(RateLimit::unlimited());
    ctx.reset_node("n1");
    let mut dns = workload("coredns");
    dns.namespace = "kube-system".to_string();

    assert_eq!(ctx.add_reservation("n1", &dns, Bandwidth::new(9, 9, 18)), Ok(false));
    assert!(ctx.queue().is_empty());
}

#[tokio::test]
async fn test_rate_limit_paces_dequeues() {
    let queue = ReconcileQueue::new(RateLimit::new(50.0, 1));
    queue.add("n1");
    queue.add("n2");
    queue.add("n3");

    let start = tokio::time::Instant::now();
    for _ in 0..3 {
        let node = queue.next().await.unwrap();
        queue.done(&node);
    }
    // One token up front, then one every 20ms.
    assert!(start.elapsed() >= Duration::from_millis(35));
}
