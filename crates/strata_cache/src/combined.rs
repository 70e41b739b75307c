//! # Combined Budget Coordinator
//!
//! One byte ceiling across several independently budgeted managers.
//!
//! Each manager enforces its own `max_bytes`; the coordinator additionally
//! keeps `Σ pool_bytes ≤ combined_max_bytes` by evicting from whichever
//! manager currently holds the larger share. Ties rotate so no manager is
//! drained first every time.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::{CacheConfig, Clock, LogThrottle, SharedClock, SystemClock};

use crate::budget::BudgetPool;

const OVER_BUDGET_LOG_INTERVAL_MS: u64 = 5_000;

/// Enforces a ceiling over the sum of several budget pools.
pub struct CombinedBudgetCoordinator {
    pools: Vec<Arc<dyn BudgetPool>>,
    max_bytes: AtomicU64,
    max_evictions_per_pass: usize,
    cursor: AtomicUsize,
    evicting: AtomicBool,
    over_budget_log: LogThrottle,
    clock: SharedClock,
}

impl CombinedBudgetCoordinator {
    /// Creates a coordinator over `pools` using the combined limits of `config`.
    #[must_use]
    pub fn new(pools: Vec<Arc<dyn BudgetPool>>, config: &CacheConfig) -> Self {
        Self::with_clock(pools, config, Arc::new(SystemClock::new()))
    }

    /// Creates a coordinator with an explicit clock for log throttling.
    #[must_use]
    pub fn with_clock(
        pools: Vec<Arc<dyn BudgetPool>>,
        config: &CacheConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            pools,
            max_bytes: AtomicU64::new(config.combined_max_bytes),
            max_evictions_per_pass: config.combined_max_evictions_per_pass.max(1),
            cursor: AtomicUsize::new(0),
            evicting: AtomicBool::new(false),
            over_budget_log: LogThrottle::new(OVER_BUDGET_LOG_INTERVAL_MS),
            clock,
        }
    }

    /// Sum of every pool's accounted bytes.
    #[must_use]
    pub fn combined_bytes(&self) -> u64 {
        self.pools.iter().map(|p| p.pool_bytes()).sum()
    }

    /// Combined ceiling.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Changes the combined ceiling. Takes effect on the next pass.
    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.max_bytes.store(max_bytes, Ordering::Release);
    }

    /// Number of coordinated pools.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Evicts until the combined total is under the ceiling, nothing is
    /// evictable, or the per-pass cap is reached.
    ///
    /// Returns immediately with 0 if another pass is running.
    pub fn maybe_evict(&self) -> usize {
        if self.combined_bytes() <= self.max_bytes() {
            return 0;
        }
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let mut exhausted = vec![false; self.pools.len()];
        let mut evicted = 0;
        while evicted < self.max_evictions_per_pass && self.combined_bytes() > self.max_bytes() {
            let Some(index) = self.pick_largest(&exhausted) else {
                break;
            };
            if self.pools[index].evict_one_from_pool() {
                evicted += 1;
            } else {
                exhausted[index] = true;
            }
        }
        self.evicting.store(false, Ordering::Release);

        let combined = self.combined_bytes();
        let max = self.max_bytes();
        if combined > max {
            if let Some(suppressed) = self.over_budget_log.check(self.clock.now_millis()) {
                tracing::warn!(
                    combined_bytes = combined,
                    max_bytes = max,
                    evicted,
                    suppressed,
                    "combined cache budget still exceeded"
                );
            }
        } else if evicted > 0 {
            tracing::trace!(evicted, combined_bytes = combined, "combined eviction pass");
        }
        evicted
    }

    /// Largest non-exhausted pool, scanning from the rotating cursor so the
    /// first pool in scan order wins ties.
    fn pick_largest(&self, exhausted: &[bool]) -> Option<usize> {
        let count = self.pools.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % count;
        let mut best: Option<(usize, u64)> = None;
        for offset in 0..count {
            let index = (start + offset) % count;
            if exhausted[index] {
                continue;
            }
            let bytes = self.pools[index].pool_bytes();
            if bytes > 0 && best.map_or(true, |(_, top)| bytes > top) {
                best = Some((index, bytes));
            }
        }
        let (index, _) = best?;
        self.cursor.store(index + 1, Ordering::Relaxed);
        Some(index)
    }
}

impl std::fmt::Debug for CombinedBudgetCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.pools.iter().map(|p| p.pool_name()).collect();
        f.debug_struct("CombinedBudgetCoordinator")
            .field("pools", &names)
            .field("max_bytes", &self.max_bytes())
            .finish_non_exhaustive()
    }
}
