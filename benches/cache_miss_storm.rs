//! Benchmarks for cache-miss storms under each population lock strategy

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ip_logs_cache::{
    CacheStrategy, ChangeSet, ConnectionService, DashMapCache, LockStrategy, MemoryStore, OperationLocks, TypedCache,
    UnitOfWork, UserConnectionState,
};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const USERS: i64 = 64;

fn setup_store(rt: &Runtime) -> MemoryStore {
    let store = MemoryStore::new();
    rt.block_on(async {
        let mut changes = ChangeSet::new();
        for id in 1..=USERS {
            changes.add(UserConnectionState {
                id,
                current_ip_address: format!("10.0.{}.{}", id / 256, id % 256),
                last_connection_time_utc: chrono::Utc::now(),
            });
        }
        store
            .save_changes(changes)
            .await
            .unwrap_or_else(|_| panic!("Failed to seed store"));
    });
    store
}

/// Fresh cache per iteration so every lookup starts cold
fn cold_service(store: &MemoryStore, strategy: LockStrategy) -> ConnectionService<MemoryStore> {
    let cache = Arc::new(TypedCache::new(Arc::new(DashMapCache::default()), CacheStrategy::ShortTerm));
    ConnectionService::new(cache, Arc::new(store.clone()), OperationLocks::new(strategy))
}

/// Benchmark concurrent misses for distinct users
fn bench_distinct_key_storm(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let store = setup_store(&rt);
    let mut group = c.benchmark_group("distinct_key_storm");

    for strategy in [LockStrategy::PerOperation, LockStrategy::PerKey] {
        group.bench_with_input(BenchmarkId::from_parameter(strategy), &strategy, |b, &strategy| {
            b.iter(|| {
                rt.block_on(async {
                    let service = cold_service(&store, strategy);
                    let cancel = CancellationToken::new();
                    let mut handles = Vec::with_capacity(USERS as usize);

                    for id in 1..=USERS {
                        let service = service.clone();
                        let cancel = cancel.clone();
                        handles.push(tokio::spawn(async move { service.get_last_connection(id, &cancel).await }));
                    }

                    for handle in handles {
                        black_box(
                            handle
                                .await
                                .unwrap_or_else(|_| panic!("Task failed"))
                                .unwrap_or_else(|_| panic!("Lookup failed")),
                        );
                    }
                });
            });
        });
    }

    group.finish();
}

/// Benchmark concurrent misses for one key
fn bench_same_key_storm(c: &mut Criterion) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let store = setup_store(&rt);

    c.bench_function("same_key_storm_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = cold_service(&store, LockStrategy::PerOperation);
                let cancel = CancellationToken::new();
                let mut handles = Vec::with_capacity(100);

                for _ in 0..100 {
                    let service = service.clone();
                    let cancel = cancel.clone();
                    handles.push(tokio::spawn(async move { service.get_last_connection(1, &cancel).await }));
                }

                for handle in handles {
                    black_box(handle.await.unwrap_or_else(|_| panic!("Task failed")).ok());
                }
            });
        });
    });
}

criterion_group!(benches, bench_distinct_key_storm, bench_same_key_storm);
criterion_main!(benches);
