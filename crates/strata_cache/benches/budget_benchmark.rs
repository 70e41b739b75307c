//! Benchmark for budget accounting on the put path.
//!
//! Run with: cargo bench --package strata_cache --bench budget_benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use strata_cache::BudgetManager;
use strata_core::CacheConfig;

fn benchmark_put_under_budget(c: &mut Criterion) {
    let manager: BudgetManager<u64> = BudgetManager::new(
        "bench",
        &CacheConfig {
            max_bytes: u64::MAX,
            ..CacheConfig::default()
        },
    );
    let group = manager.register("g", 64, 0, |_| true);

    c.bench_function("record_put_no_eviction", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 1) % 10_000;
            manager.record_put(group, black_box(key), 128, true);
        });
    });
}

fn benchmark_put_with_eviction(c: &mut Criterion) {
    let manager: BudgetManager<u64> = BudgetManager::new(
        "bench",
        &CacheConfig {
            max_bytes: 128 * 1_000,
            ..CacheConfig::default()
        },
    );
    let group = manager.register("g", 64, 0, |_| true);

    let mut bench_group = c.benchmark_group("eviction");
    bench_group.throughput(Throughput::Elements(1));
    bench_group.bench_function("record_put_evicting", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key += 1;
            manager.record_put(group, black_box(key), 128, true);
        });
    });
    bench_group.finish();
}

fn benchmark_access(c: &mut Criterion) {
    let manager: BudgetManager<u64> = BudgetManager::new("bench", &CacheConfig::default());
    let group = manager.register("g", 64, 0, |_| true);
    for key in 0..1_000 {
        manager.record_put(group, key, 128, true);
    }

    c.bench_function("record_access", |b| {
        let mut key = 0u64;
        b.iter(|| {
            key = (key + 7) % 1_000;
            manager.record_access(group, black_box(&key));
        });
    });
}

criterion_group!(
    benches,
    benchmark_put_under_budget,
    benchmark_put_with_eviction,
    benchmark_access
);
criterion_main!(benches);
