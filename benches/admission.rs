//! Benchmarks for capacity admission and host ordering
//!
//! Target: admission over 50 volumes well under a millisecond

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use placement_engine::config::StorageThresholds;
use placement_engine::domain::{HostId, PoolId, VolumeRequest};
use placement_engine::memory::{fixtures, DriverRegistry, InMemoryStore, SimulatedDriver};
use placement_engine::scheduler::reorder_by_priority;
use placement_engine::{CapacityAdmissionChecker, EngineConfig, SpaceCheck};
use std::collections::HashMap;
use std::sync::Arc;

fn bench_space_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(1));

    let thresholds = StorageThresholds::default();
    group.bench_function("space_check_pure", |b| {
        let mut asking = 0u64;
        b.iter(|| {
            asking = (asking + fixtures::GB) % (100 * fixtures::GB);
            let check = SpaceCheck {
                effective_capacity: 2000 * fixtures::GB,
                allocated: 1200 * fixtures::GB,
                asking,
            };
            black_box(check.admits(black_box(&thresholds), false))
        });
    });

    group.finish();
}

fn bench_has_enough_space(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(50));

    let store = Arc::new(InMemoryStore::new());
    store.put_pool(fixtures::pool(1, 10_000 * fixtures::GB));
    for i in 0..500 {
        let mut volume = fixtures::volume(1000 + i, 10 * fixtures::GB);
        volume.pool_id = Some(PoolId(1));
        store.put_volume(volume);
    }
    let drivers = Arc::new(DriverRegistry::new().with(SimulatedDriver::default_primary()));
    let checker = CapacityAdmissionChecker::new(store.clone(), drivers, Arc::new(EngineConfig::default()));
    let pool = fixtures::pool(1, 10_000 * fixtures::GB);
    let requests: Vec<VolumeRequest> = (0..50)
        .map(|i| VolumeRequest::of(fixtures::volume(i, 20 * fixtures::GB)))
        .collect();

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("has_enough_space_50_volumes", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    checker
                        .has_enough_space(&pool, black_box(&requests), None)
                        .await
                        .unwrap(),
                )
            })
        });
    });

    group.finish();
}

fn bench_reorder_by_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_ordering");
    group.throughput(Throughput::Elements(1000));

    let hosts: Vec<_> = (0..1000).map(|i| fixtures::host(i, 1)).collect();
    let priorities: HashMap<HostId, i32> = (0..1000)
        .step_by(3)
        .map(|i| (HostId(i), (i % 17) as i32))
        .collect();

    group.bench_function("reorder_1000_hosts", |b| {
        b.iter(|| black_box(reorder_by_priority(hosts.clone(), black_box(&priorities))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_space_check,
    bench_has_enough_space,
    bench_reorder_by_priority
);
criterion_main!(benches);
