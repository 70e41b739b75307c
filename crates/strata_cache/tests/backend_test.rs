//! Integration tests for the disk and tiered cache backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use strata_cache::{
    BudgetManager, CacheBackend, DiskCacheBackend, MemoryCacheBackend, PutOptions,
    TieredCacheBackend,
};
use strata_core::{CacheConfig, ManualClock};

fn temp_root(tag: &str) -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("strata_cache_{tag}_{id}"))
}

fn memory() -> MemoryCacheBackend {
    let budget = Arc::new(BudgetManager::new("memory", &CacheConfig::default()));
    MemoryCacheBackend::new(budget, ManualClock::new())
}

#[test]
fn test_disk_roundtrip_compressed_and_plain() {
    let root = temp_root("roundtrip");
    let disk = DiskCacheBackend::open(&root).unwrap();
    let value: Vec<u8> = (0..4_096u32).map(|i| (i % 13) as u8).collect();

    disk.put("terrain", "slice-1", value.clone(), &PutOptions::persistent(Duration::from_secs(60), 0))
        .unwrap();
    disk.put("terrain", "slice/2", value.clone(), &PutOptions::memory(Duration::from_secs(60), 0))
        .unwrap();

    assert_eq!(disk.get("terrain", "slice-1").unwrap(), Some(value.clone()));
    assert_eq!(disk.get("terrain", "slice/2").unwrap(), Some(value));
    assert_eq!(disk.get("terrain", "missing").unwrap(), None);
    assert_eq!(disk.len("terrain").unwrap(), 2);

    assert!(disk.remove("terrain", "slice-1").unwrap());
    assert!(!disk.remove("terrain", "slice-1").unwrap());

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_disk_survives_reopen() {
    let root = temp_root("reopen");
    {
        let disk = DiskCacheBackend::open(&root).unwrap();
        disk.put("ns", "k", b"kept".to_vec(), &PutOptions::persistent(Duration::ZERO, 0))
            .unwrap();
    }
    let disk = DiskCacheBackend::open(&root).unwrap();
    assert_eq!(disk.get("ns", "k").unwrap().as_deref(), Some(&b"kept"[..]));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_disk_max_entries_trims_oldest() {
    let root = temp_root("trim");
    let disk = DiskCacheBackend::open(&root).unwrap();
    let options = PutOptions::persistent(Duration::ZERO, 3);

    for i in 0..5 {
        disk.put("ns", &format!("k{i}"), vec![i; 16], &options).unwrap();
        // Modification times need to differ for oldest-first ordering.
        std::thread::sleep(Duration::from_millis(15));
    }

    assert_eq!(disk.len("ns").unwrap(), 3);
    assert_eq!(disk.get("ns", "k0").unwrap(), None);
    assert_eq!(disk.get("ns", "k4").unwrap(), Some(vec![4; 16]));

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_disk_expired_entry_is_a_miss() {
    let root = temp_root("expiry");
    let disk = DiskCacheBackend::open(&root).unwrap();
    disk.put("ns", "k", vec![1], &PutOptions::persistent(Duration::from_millis(1), 0))
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(disk.get("ns", "k").unwrap(), None);
    assert_eq!(disk.len("ns").unwrap(), 0);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_disk_corrupt_entry_is_dropped() {
    let root = temp_root("corrupt");
    let disk = DiskCacheBackend::open(&root).unwrap();
    disk.put("ns", "k", vec![1, 2, 3], &PutOptions::persistent(Duration::ZERO, 0))
        .unwrap();
    let file = std::fs::read_dir(root.join("k_ns"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    std::fs::write(&file, [1u8, 2]).unwrap();

    assert_eq!(disk.get("ns", "k").unwrap(), None);
    assert!(!file.exists());

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_tiered_routes_by_persistence() {
    let root = temp_root("tiered");
    let tiered = TieredCacheBackend::new(memory(), Some(DiskCacheBackend::open(&root).unwrap()));

    tiered
        .put("ns", "hot", vec![1], &PutOptions::memory(Duration::ZERO, 0))
        .unwrap();
    tiered
        .put("ns", "durable", vec![2], &PutOptions::persistent(Duration::ZERO, 0))
        .unwrap();

    let disk = tiered.disk().unwrap();
    assert_eq!(disk.get("ns", "hot").unwrap(), None);
    assert_eq!(disk.get("ns", "durable").unwrap(), Some(vec![2]));

    // A fresh memory front still finds the durable entry on disk.
    let cold = TieredCacheBackend::new(memory(), Some(disk.clone()));
    assert_eq!(cold.get("ns", "durable").unwrap(), Some(vec![2]));
    assert_eq!(cold.get("ns", "hot").unwrap(), None);

    assert!(tiered.remove("ns", "durable").unwrap());
    assert_eq!(cold.get("ns", "durable").unwrap(), None);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_tiered_without_disk_keeps_persistent_in_memory() {
    let tiered = TieredCacheBackend::new(memory(), None);
    tiered
        .put("ns", "k", vec![9], &PutOptions::persistent(Duration::ZERO, 0))
        .unwrap();
    assert_eq!(tiered.get("ns", "k").unwrap(), Some(vec![9]));
    assert_eq!(tiered.memory().len("ns"), 1);
}
