//! # Budget Manager
//!
//! Byte accounting for named cache groups sharing one ceiling.
//!
//! ```text
//!   record_put ──> group.sizes[key] = (size, seq) ──> bytes += size
//!                   group.recency.push_back((key, seq))
//!                              │
//!                              ▼
//!   maybe_evict (try-lock) ──> largest group above min_retain
//!                               ──> pop oldest live marker ──> evictor(key)
//!                               ──> deduct size (always)
//! ```
//!
//! ## Recency
//!
//! The recency queue is approximate. Every touch pushes a fresh `(key, seq)`
//! marker; markers whose `seq` no longer matches the live record are stale and
//! skipped on pop. The queue is compacted once it grows past
//! `trim_factor × live entries`.
//!
//! ## Accounting quirk
//!
//! When a key is evicted its size is deducted whether the evictor removed the
//! object, declined, or panicked. Accounting is advisory: a store whose evictor
//! declines must re-put the key if it keeps the object. The size record is
//! dropped before the evictor runs, so the re-put may happen inside it.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use strata_core::{panic_message, CacheConfig, Clock, LogThrottle, SharedClock, SystemClock};

/// Minimum queue length before compaction is considered.
const TRIM_FLOOR: usize = 64;

/// Interval between "still over budget" warnings.
const OVER_BUDGET_LOG_INTERVAL_MS: u64 = 5_000;

/// Eviction callback. Returns true if the object was removed from its store.
pub type Evictor<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Handle to a registered group. Only meaningful for the manager that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupHandle(usize);

impl GroupHandle {
    /// Registration index within the owning manager.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

struct GroupState<K> {
    /// Live records: key -> (size, last touch seq).
    sizes: HashMap<K, (u64, u64)>,
    recency: VecDeque<(K, u64)>,
}

struct Group<K> {
    name: String,
    size_hint: u64,
    min_retain: usize,
    evictor: Evictor<K>,
    bytes: AtomicU64,
    entries: AtomicUsize,
    evictions: AtomicU64,
    state: Mutex<GroupState<K>>,
}

struct Registry<K> {
    groups: Vec<Arc<Group<K>>>,
    by_name: HashMap<String, usize>,
}

/// Point-in-time view of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStats {
    /// Group name.
    pub name: String,
    /// Accounted bytes.
    pub bytes: u64,
    /// Live entries.
    pub entries: usize,
    /// Entries the group never drops below through eviction.
    pub min_retain: usize,
    /// Evictions performed so far.
    pub evictions: u64,
    /// Recency markers, stale ones included.
    pub queue_len: usize,
}

/// Point-in-time view of a manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BudgetStats {
    /// Manager name.
    pub name: String,
    /// Bytes across all groups.
    pub total_bytes: u64,
    /// Configured ceiling.
    pub max_bytes: u64,
    /// Per-group detail in registration order.
    pub groups: Vec<GroupStats>,
}

/// Byte-budgeted accounting for a set of cache groups.
pub struct BudgetManager<K> {
    name: String,
    registry: RwLock<Registry<K>>,
    total_bytes: AtomicU64,
    max_bytes: AtomicU64,
    max_evictions_per_pass: usize,
    trim_factor: usize,
    next_seq: AtomicU64,
    evicting: AtomicBool,
    over_budget_log: LogThrottle,
    clock: SharedClock,
}

impl<K> BudgetManager<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Creates a manager using the cache section of the config.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock::new()))
    }

    /// Creates a manager with an explicit clock for log throttling.
    #[must_use]
    pub fn with_clock(name: impl Into<String>, config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            registry: RwLock::new(Registry {
                groups: Vec::new(),
                by_name: HashMap::new(),
            }),
            total_bytes: AtomicU64::new(0),
            max_bytes: AtomicU64::new(config.max_bytes),
            max_evictions_per_pass: config.max_evictions_per_pass.max(1),
            trim_factor: config.recency_trim_factor.max(2),
            next_seq: AtomicU64::new(1),
            evicting: AtomicBool::new(false),
            over_budget_log: LogThrottle::new(OVER_BUDGET_LOG_INTERVAL_MS),
            clock,
        }
    }

    /// Registers a group, or returns the existing handle for `name`.
    ///
    /// A second registration keeps the first group's hint, floor and evictor.
    pub fn register(
        &self,
        name: &str,
        default_entry_size_hint: u64,
        min_retain: usize,
        evictor: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> GroupHandle {
        if let Some(&index) = self.registry.read().by_name.get(name) {
            return GroupHandle(index);
        }

        let mut registry = self.registry.write();
        if let Some(&index) = registry.by_name.get(name) {
            return GroupHandle(index);
        }
        let index = registry.groups.len();
        registry.groups.push(Arc::new(Group {
            name: name.to_string(),
            size_hint: default_entry_size_hint.max(1),
            min_retain,
            evictor: Arc::new(evictor),
            bytes: AtomicU64::new(0),
            entries: AtomicUsize::new(0),
            evictions: AtomicU64::new(0),
            state: Mutex::new(GroupState {
                sizes: HashMap::new(),
                recency: VecDeque::new(),
            }),
        }));
        registry.by_name.insert(name.to_string(), index);
        tracing::debug!(manager = %self.name, group = name, index, "cache group registered");
        GroupHandle(index)
    }

    /// Accounts for an insertion.
    ///
    /// If `newly_inserted` is false this only refreshes recency. A `size_bytes`
    /// of 0 is replaced by the group's size hint. Re-putting a live key
    /// replaces its previous size.
    pub fn record_put(&self, handle: GroupHandle, key: K, size_bytes: u64, newly_inserted: bool) {
        if !newly_inserted {
            self.record_access(handle, &key);
            return;
        }
        let Some(group) = self.group(handle) else {
            return;
        };

        let size = if size_bytes == 0 {
            group.size_hint
        } else {
            size_bytes
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = group.state.lock();
            match state.sizes.insert(key.clone(), (size, seq)) {
                Some((previous, _)) => self.deduct(&group, previous, false),
                None => {
                    group.entries.fetch_add(1, Ordering::AcqRel);
                }
            }
            group.bytes.fetch_add(size, Ordering::AcqRel);
            self.total_bytes.fetch_add(size, Ordering::AcqRel);
            state.recency.push_back((key, seq));
            self.trim_recency(&mut state);
        }

        self.maybe_evict();
    }

    /// Refreshes the recency of a live key. Unknown keys are ignored.
    pub fn record_access(&self, handle: GroupHandle, key: &K) {
        let Some(group) = self.group(handle) else {
            return;
        };
        {
            let mut state = group.state.lock();
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let Some(record) = state.sizes.get_mut(key) else {
                return;
            };
            record.1 = seq;
            state.recency.push_back((key.clone(), seq));
            self.trim_recency(&mut state);
        }
        self.maybe_evict();
    }

    /// Drops the accounting for a key without calling the evictor.
    ///
    /// Returns the size that was deducted.
    pub fn record_remove(&self, handle: GroupHandle, key: &K) -> Option<u64> {
        let group = self.group(handle)?;
        let mut state = group.state.lock();
        let (size, _) = state.sizes.remove(key)?;
        self.deduct(&group, size, true);
        Some(size)
    }

    /// Evicts the least recently touched key of one group.
    ///
    /// Returns false if the group is at or below its retain floor.
    pub fn evict_one(&self, handle: GroupHandle) -> bool {
        match self.group(handle) {
            Some(group) => self.evict_from(&group),
            None => false,
        }
    }

    /// Evicts one key from the largest group above its retain floor.
    pub fn evict_one_global(&self) -> bool {
        let mut candidates: Vec<Arc<Group<K>>> = self
            .registry
            .read()
            .groups
            .iter()
            .filter(|g| g.entries.load(Ordering::Acquire) > g.min_retain)
            .cloned()
            .collect();
        candidates.sort_by_key(|g| std::cmp::Reverse(g.bytes.load(Ordering::Acquire)));

        candidates.iter().any(|group| self.evict_from(group))
    }

    /// Runs an eviction pass if over budget and no other pass is running.
    ///
    /// Returns the number of evictions performed.
    pub fn maybe_evict(&self) -> usize {
        if self.total_bytes() <= self.max_bytes() {
            return 0;
        }
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let _pass = PassGuard(&self.evicting);

        let mut evicted = 0;
        while self.total_bytes() > self.max_bytes() && evicted < self.max_evictions_per_pass {
            if !self.evict_one_global() {
                break;
            }
            evicted += 1;
        }

        let total = self.total_bytes();
        let max = self.max_bytes();
        if total > max {
            if let Some(suppressed) = self.over_budget_log.check(self.clock.now_millis()) {
                tracing::warn!(
                    manager = %self.name,
                    total_bytes = total,
                    max_bytes = max,
                    evicted,
                    suppressed,
                    "cache budget still exceeded after eviction pass"
                );
            }
        } else if evicted > 0 {
            tracing::trace!(manager = %self.name, evicted, total_bytes = total, "eviction pass");
        }
        evicted
    }

    /// Changes the ceiling and evicts down to it.
    pub fn apply_max_bytes(&self, max_bytes: u64) -> usize {
        self.max_bytes.store(max_bytes, Ordering::Release);
        self.maybe_evict()
    }

    /// Manager name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes across all groups.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Current ceiling.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Accounted bytes of one group.
    #[must_use]
    pub fn group_bytes(&self, handle: GroupHandle) -> u64 {
        self.group(handle)
            .map_or(0, |g| g.bytes.load(Ordering::Acquire))
    }

    /// Live entries of one group.
    #[must_use]
    pub fn group_entries(&self, handle: GroupHandle) -> usize {
        self.group(handle)
            .map_or(0, |g| g.entries.load(Ordering::Acquire))
    }

    /// Whether `key` currently has a size record.
    #[must_use]
    pub fn contains(&self, handle: GroupHandle, key: &K) -> bool {
        self.group(handle)
            .is_some_and(|g| g.state.lock().sizes.contains_key(key))
    }

    /// Snapshot of every group.
    #[must_use]
    pub fn stats(&self) -> BudgetStats {
        let groups = self
            .registry
            .read()
            .groups
            .iter()
            .map(|g| GroupStats {
                name: g.name.clone(),
                bytes: g.bytes.load(Ordering::Acquire),
                entries: g.entries.load(Ordering::Acquire),
                min_retain: g.min_retain,
                evictions: g.evictions.load(Ordering::Acquire),
                queue_len: g.state.lock().recency.len(),
            })
            .collect();
        BudgetStats {
            name: self.name.clone(),
            total_bytes: self.total_bytes(),
            max_bytes: self.max_bytes(),
            groups,
        }
    }

    fn group(&self, handle: GroupHandle) -> Option<Arc<Group<K>>> {
        self.registry.read().groups.get(handle.0).cloned()
    }

    fn deduct(&self, group: &Group<K>, size: u64, drop_entry: bool) {
        group.bytes.fetch_sub(size, Ordering::AcqRel);
        self.total_bytes.fetch_sub(size, Ordering::AcqRel);
        if drop_entry {
            group.entries.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn trim_recency(&self, state: &mut GroupState<K>) {
        let bound = (state.sizes.len() * self.trim_factor).max(TRIM_FLOOR);
        if state.recency.len() <= bound {
            return;
        }
        let GroupState { sizes, recency } = state;
        recency.retain(|(key, seq)| sizes.get(key).is_some_and(|&(_, live)| live == *seq));
    }

    fn evict_from(&self, group: &Group<K>) -> bool {
        let victim = {
            let mut state = group.state.lock();
            if state.sizes.len() <= group.min_retain {
                return false;
            }
            loop {
                let Some((key, seq)) = state.recency.pop_front() else {
                    return false;
                };
                if state.sizes.get(&key).is_some_and(|&(_, live)| live == seq) {
                    if let Some((size, _)) = state.sizes.remove(&key) {
                        self.deduct(group, size, true);
                    }
                    break key;
                }
            }
        };
        group.evictions.fetch_add(1, Ordering::Relaxed);

        let removed = match catch_unwind(AssertUnwindSafe(|| (group.evictor)(&victim))) {
            Ok(removed) => removed,
            Err(payload) => {
                tracing::warn!(
                    manager = %self.name,
                    group = %group.name,
                    panic = %panic_message(payload.as_ref()),
                    "evictor panicked; treating entry as not removed"
                );
                false
            }
        };
        if !removed {
            tracing::trace!(manager = %self.name, group = %group.name, "evictor declined removal");
        }
        true
    }
}

impl<K> std::fmt::Debug for BudgetManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetManager")
            .field("name", &self.name)
            .field("total_bytes", &self.total_bytes.load(Ordering::Relaxed))
            .field("max_bytes", &self.max_bytes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Releases the eviction try-lock on every exit path.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Object-safe view of a budget manager, independent of its key type.
pub trait BudgetPool: Send + Sync {
    /// Pool name for logs.
    fn pool_name(&self) -> &str;
    /// Bytes currently accounted.
    fn pool_bytes(&self) -> u64;
    /// Evicts one entry; false if nothing is evictable.
    fn evict_one_from_pool(&self) -> bool;
}

impl<K> BudgetPool for BudgetManager<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn pool_name(&self) -> &str {
        self.name()
    }

    fn pool_bytes(&self) -> u64 {
        self.total_bytes()
    }

    fn evict_one_from_pool(&self) -> bool {
        self.evict_one_global()
    }
}
