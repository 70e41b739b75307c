//! Integration tests for budget accounting under concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use strata_cache::{BudgetManager, BudgetPool, CombinedBudgetCoordinator};
use strata_core::CacheConfig;

fn config(max_bytes: u64) -> CacheConfig {
    CacheConfig {
        max_bytes,
        max_evictions_per_pass: 1_024,
        ..CacheConfig::default()
    }
}

#[test]
fn test_concurrent_puts_keep_accounting_exact() {
    let manager: Arc<BudgetManager<(u32, u32)>> =
        Arc::new(BudgetManager::new("shared", &config(u64::MAX)));
    let group = manager.register("g", 16, 0, |_| true);

    // Each thread owns its keys, so it can predict their final sizes.
    let handles: Vec<_> = (0..8u32)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                let mut live = HashMap::new();
                for i in 0..500u32 {
                    let key = (t, i % 50);
                    let size = u64::from(i % 7) * 10;
                    manager.record_put(group, key, size, true);
                    live.insert(key, if size == 0 { 16 } else { size });
                    if i % 3 == 0 {
                        let gone = (t, (i + 1) % 50);
                        manager.record_remove(group, &gone);
                        live.remove(&gone);
                    }
                }
                live
            })
        })
        .collect();

    let mut expected_bytes = 0;
    let mut expected_entries = 0;
    for handle in handles {
        let live = handle.join().unwrap();
        expected_bytes += live.values().sum::<u64>();
        expected_entries += live.len();
    }

    assert_eq!(manager.group_bytes(group), expected_bytes);
    assert_eq!(manager.total_bytes(), expected_bytes);
    assert_eq!(manager.group_entries(group), expected_entries);
}

#[test]
fn test_concurrent_eviction_respects_budget_at_quiescence() {
    let evicted = Arc::new(Mutex::new(HashSet::new()));
    let sink = Arc::clone(&evicted);
    let manager: Arc<BudgetManager<u64>> =
        Arc::new(BudgetManager::new("bounded", &config(10_000)));
    let group = manager.register("g", 1, 0, move |key: &u64| sink.lock().insert(*key));

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..1_000u64 {
                    manager.record_put(group, t * 10_000 + i, 100, true);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    manager.maybe_evict();

    assert!(manager.total_bytes() <= 10_000);
    let live = manager.group_entries(group) as u64;
    assert_eq!(manager.total_bytes(), live * 100);
    assert_eq!(evicted.lock().len() as u64 + live, 4_000);
}

#[test]
fn test_two_managers_under_combined_ceiling() {
    let chunks: Arc<BudgetManager<u32>> =
        Arc::new(BudgetManager::new("chunks", &config(u64::MAX)));
    let meshes: Arc<BudgetManager<String>> =
        Arc::new(BudgetManager::new("meshes", &config(u64::MAX)));
    let chunk_group = chunks.register("terrain", 1, 4, |_| true);
    let mesh_group = meshes.register("near", 1, 4, |_| true);

    for i in 0..200u32 {
        chunks.record_put(chunk_group, i, 300, true);
        meshes.record_put(mesh_group, format!("mesh-{i}"), 200, true);
    }

    let pools = vec![
        Arc::clone(&chunks) as Arc<dyn BudgetPool>,
        Arc::clone(&meshes) as Arc<dyn BudgetPool>,
    ];
    let coordinator = CombinedBudgetCoordinator::new(
        pools,
        &CacheConfig {
            combined_max_bytes: 20_000,
            combined_max_evictions_per_pass: 64,
            ..CacheConfig::default()
        },
    );

    for _ in 0..16 {
        if coordinator.maybe_evict() == 0 {
            break;
        }
    }

    assert!(coordinator.combined_bytes() <= 20_000);
    assert!(chunks.group_entries(chunk_group) >= 4);
    assert!(meshes.group_entries(mesh_group) >= 4);
    assert!(chunks.total_bytes() > 0 && meshes.total_bytes() > 0);
}
