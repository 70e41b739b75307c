//! In-memory backend. Bytes are accounted through a budget manager group per
//! namespace; budget eviction removes the entry from the map.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use strata_core::{Clock, SharedClock};

use super::{expiry_ms, CacheBackend, PutOptions};
use crate::budget::{BudgetManager, GroupHandle};
use crate::error::CacheResult;

/// Size hint for the namespace groups.
const ENTRY_SIZE_HINT: u64 = 256;

struct MemoryEntry {
    value: Vec<u8>,
    expires_at_ms: u64,
    inserted_seq: u64,
}

type EntryMap = Mutex<HashMap<String, MemoryEntry>>;

struct Namespace {
    group: GroupHandle,
    entries: Arc<EntryMap>,
    next_seq: Mutex<u64>,
}

struct MemoryInner {
    namespaces: DashMap<String, Arc<Namespace>>,
    budget: Arc<BudgetManager<String>>,
    clock: SharedClock,
}

/// TTL + max-entry map per namespace, byte-budgeted.
#[derive(Clone)]
pub struct MemoryCacheBackend {
    inner: Arc<MemoryInner>,
}

impl MemoryCacheBackend {
    /// Creates a backend accounting into `budget`.
    #[must_use]
    pub fn new(budget: Arc<BudgetManager<String>>, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                namespaces: DashMap::new(),
                budget,
                clock,
            }),
        }
    }

    /// The budget manager this backend accounts into.
    #[must_use]
    pub fn budget(&self) -> &Arc<BudgetManager<String>> {
        &self.inner.budget
    }

    /// Entries held for `namespace`, expired ones included until read.
    #[must_use]
    pub fn len(&self, namespace: &str) -> usize {
        self.inner
            .namespaces
            .get(namespace)
            .map_or(0, |ns| ns.entries.lock().len())
    }

    /// Whether `namespace` holds no entries.
    #[must_use]
    pub fn is_empty(&self, namespace: &str) -> bool {
        self.len(namespace) == 0
    }

    fn namespace(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.inner.namespaces.get(name) {
            return Arc::clone(ns.value());
        }
        let entry = self
            .inner
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                let entries: Arc<EntryMap> = Arc::new(Mutex::new(HashMap::new()));
                let weak: Weak<EntryMap> = Arc::downgrade(&entries);
                let group = self.inner.budget.register(name, ENTRY_SIZE_HINT, 0, move |key: &String| {
                    weak.upgrade()
                        .is_some_and(|map| map.lock().remove(key).is_some())
                });
                Arc::new(Namespace {
                    group,
                    entries,
                    next_seq: Mutex::new(0),
                })
            });
        Arc::clone(entry.value())
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let Some(ns) = self.inner.namespaces.get(namespace).map(|ns| Arc::clone(ns.value())) else {
            return Ok(None);
        };
        let now = self.inner.clock.now_millis();
        let key = key.to_string();

        // Outer None: absent. Inner None: expired and dropped.
        let found = {
            let mut entries = ns.entries.lock();
            let found = entries
                .get(&key)
                .map(|entry| (entry.expires_at_ms > now).then(|| entry.value.clone()));
            if matches!(found, Some(None)) {
                entries.remove(&key);
            }
            found
        };

        match found {
            Some(Some(value)) => {
                self.inner.budget.record_access(ns.group, &key);
                Ok(Some(value))
            }
            Some(None) => {
                self.inner.budget.record_remove(ns.group, &key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        options: &PutOptions,
    ) -> CacheResult<()> {
        let ns = self.namespace(namespace);
        let now = self.inner.clock.now_millis();
        let size = (value.len() + key.len()) as u64;
        let seq = {
            let mut next = ns.next_seq.lock();
            *next += 1;
            *next
        };

        let trimmed = {
            let mut entries = ns.entries.lock();
            entries.insert(
                key.to_string(),
                MemoryEntry {
                    value,
                    expires_at_ms: expiry_ms(now, options.ttl),
                    inserted_seq: seq,
                },
            );
            trim_oldest(&mut entries, options.max_entries, now)
        };

        for old in &trimmed {
            self.inner.budget.record_remove(ns.group, old);
        }
        if trimmed.iter().all(|old| old != key) {
            self.inner.budget.record_put(ns.group, key.to_string(), size, true);
        }
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        let Some(ns) = self.inner.namespaces.get(namespace).map(|ns| Arc::clone(ns.value())) else {
            return Ok(false);
        };
        let key = key.to_string();
        let removed = ns.entries.lock().remove(&key).is_some();
        if removed {
            self.inner.budget.record_remove(ns.group, &key);
        }
        Ok(removed)
    }
}

/// Drops expired entries, then the oldest insertions until `max_entries`
/// remain. Returns the removed keys.
fn trim_oldest(entries: &mut HashMap<String, MemoryEntry>, max_entries: usize, now: u64) -> Vec<String> {
    if max_entries == 0 || entries.len() <= max_entries {
        return Vec::new();
    }
    let mut removed: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.expires_at_ms <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in &removed {
        entries.remove(key);
    }

    if entries.len() > max_entries {
        let mut by_age: Vec<(u64, String)> = entries
            .iter()
            .map(|(k, e)| (e.inserted_seq, k.clone()))
            .collect();
        by_age.sort_unstable();
        let excess = entries.len() - max_entries;
        for (_, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
            removed.push(key);
        }
    }
    removed
}

impl std::fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBackend")
            .field("namespaces", &self.inner.namespaces.len())
            .field("budget", &self.inner.budget)
            .finish()
    }
}
