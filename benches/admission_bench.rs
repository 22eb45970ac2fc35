//! Benchmarks for the synchronous admission path.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use diskio_aware::cache::bandwidth::{parse_quantity, Bandwidth};
use diskio_aware::cache::handle::CacheHandle;
use diskio_aware::cache::ledger::{DeviceSpec, DeviceType};
use diskio_aware::cache::store::BandwidthCache;
use diskio_aware::reservation::context::{ReservationContext, WorkloadId};
use diskio_aware::reservation::queue::{RateLimit, ReconcileQueue};
use diskio_aware::scorer::ScoreStrategy;

fn handle_with_nodes(nodes: usize) -> CacheHandle {
    let queue = Arc::new(ReconcileQueue::new(RateLimit::unlimited()));
    let ctx = Arc::new(ReservationContext::new(vec![], queue));
    let handle = CacheHandle::new(Arc::new(BandwidthCache::new()), ctx);

    let devices = vec![DeviceSpec {
        id: "nvme0".to_string(),
        vendor: "Intel".to_string(),
        model: "P4510".to_string(),
        device_type: DeviceType::EmptyDir,
        capacity: Bandwidth::new(u64::MAX / 4, u64::MAX / 4, u64::MAX / 2),
    }];
    for i in 0..nodes {
        handle.register_node(&format!("node-{i}"), &devices);
    }
    handle
}

fn bench_can_admit(c: &mut Criterion) {
    let handle = handle_with_nodes(1_000);
    let request = Bandwidth::new(100 << 20, 50 << 20, 150 << 20);

    c.bench_function("can_admit_across_1k_nodes", |b| {
        b.iter(|| {
            for i in (0..1_000).step_by(10) {
                let node = format!("node-{i}");
                let _ = black_box(handle.can_admit(&node, black_box(&request)));
            }
        })
    });
}

fn bench_commit_revert(c: &mut Criterion) {
    let handle = handle_with_nodes(1);
    let request = Bandwidth::new(1 << 20, 1 << 20, 2 << 20);
    let id = WorkloadId::new("bench", "0");

    c.bench_function("commit_then_revert", |b| {
        b.iter(|| {
            let _ = black_box(handle.commit("node-0", &id, &request));
            let _ = black_box(handle.revert_commit("node-0", &request));
        })
    });
}

fn bench_score(c: &mut Criterion) {
    let handle = handle_with_nodes(1);
    let request = Bandwidth::new(100 << 20, 50 << 20, 150 << 20);

    c.bench_function("score_least_allocated", |b| {
        b.iter(|| {
            let _ = black_box(ScoreStrategy::LeastAllocated.score(
                &handle,
                "node-0",
                black_box(&request),
                100,
            ));
        })
    });
}

fn bench_parse_quantity(c: &mut Criterion) {
    c.bench_function("parse_quantity", |b| {
        b.iter(|| {
            for q in ["1000", "100Mi", "1.5G", "12.34Mi"] {
                let _ = black_box(parse_quantity(black_box(q)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_can_admit,
    bench_commit_revert,
    bench_score,
    bench_parse_quantity,
);
criterion_main!(benches);
