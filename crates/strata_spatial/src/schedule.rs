//! # Region Schedule State
//!
//! One 64-bit cell per region:
//!
//! ```text
//!   bit 63        bits 62..0
//!   ┌─────────┬──────────────────────────┐
//!   │escalated│ scheduled-at (clock ms)  │
//!   └─────────┴──────────────────────────┘
//! ```
//!
//! Each scheduling decision is one compare-and-swap on that cell:
//!
//! ```text
//!   absent / expired           ──> Fresh      (stamp = now)
//!   live, plain, wants accel   ──> Escalated  (stamp = now, flag set)
//!   anything else              ──> Hit        (no write)
//! ```
//!
//! Escalation is sticky: only TTL expiry clears it. Expired entries are
//! removed by bounded prune sweeps over a ring of tracked keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::region::RegionKey;

const ESCALATED_BIT: u64 = 1 << 63;
const STAMP_MASK: u64 = ESCALATED_BIT - 1;

/// Unpacked schedule state of a region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// When the region was last (re)scheduled, in clock milliseconds.
    pub scheduled_at_ms: u64,
    /// Scheduled with accelerator-class resources.
    pub escalated: bool,
}

impl ScheduleState {
    /// Plain state stamped at `now_ms`.
    #[must_use]
    pub const fn scheduled(now_ms: u64) -> Self {
        Self {
            scheduled_at_ms: now_ms & STAMP_MASK,
            escalated: false,
        }
    }

    /// Escalated state stamped at `now_ms`.
    #[must_use]
    pub const fn escalated(now_ms: u64) -> Self {
        Self {
            scheduled_at_ms: now_ms & STAMP_MASK,
            escalated: true,
        }
    }

    /// Storage form.
    #[must_use]
    pub const fn pack(self) -> u64 {
        let flag = if self.escalated { ESCALATED_BIT } else { 0 };
        (self.scheduled_at_ms & STAMP_MASK) | flag
    }

    /// Inverse of [`pack`](Self::pack).
    #[must_use]
    pub const fn unpack(raw: u64) -> Self {
        Self {
            scheduled_at_ms: raw & STAMP_MASK,
            escalated: raw & ESCALATED_BIT != 0,
        }
    }

    /// Whether the state has outlived `ttl_ms` at `now_ms`.
    #[must_use]
    pub const fn is_expired(self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.scheduled_at_ms) >= ttl_ms
    }
}

/// Outcome of a scheduling decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Region was unscheduled or expired and has been scheduled.
    Fresh,
    /// Region was scheduled on CPU and has been upgraded in place.
    Escalated,
    /// Region is already covered; nothing to do.
    Hit,
}

impl ScheduleDecision {
    /// Whether the region must be (re)computed.
    #[must_use]
    pub const fn needs_work(self) -> bool {
        !matches!(self, Self::Hit)
    }
}

/// Concurrent region → schedule state table.
pub struct ScheduleTable {
    cells: DashMap<RegionKey, AtomicU64>,
    /// Every tracked key exactly once, oldest insert first.
    ring: Mutex<VecDeque<RegionKey>>,
    ttl_ms: u64,
    prune_scan: usize,
}

impl ScheduleTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(ttl_ms: u64, prune_scan: usize) -> Self {
        Self {
            cells: DashMap::new(),
            ring: Mutex::new(VecDeque::new()),
            ttl_ms,
            prune_scan,
        }
    }

    /// Records a scheduling request for `region`.
    pub fn decide(&self, region: RegionKey, now_ms: u64, accelerated: bool) -> ScheduleDecision {
        if let Some(cell) = self.cells.get(&region) {
            return self.transition(&cell, now_ms, accelerated);
        }

        match self.cells.entry(region) {
            Entry::Occupied(occupied) => self.transition(occupied.get(), now_ms, accelerated),
            Entry::Vacant(vacant) => {
                let state = if accelerated {
                    ScheduleState::escalated(now_ms)
                } else {
                    ScheduleState::scheduled(now_ms)
                };
                vacant.insert(AtomicU64::new(state.pack()));
                self.ring.lock().push_back(region);
                ScheduleDecision::Fresh
            }
        }
    }

    fn transition(&self, cell: &AtomicU64, now_ms: u64, accelerated: bool) -> ScheduleDecision {
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let state = ScheduleState::unpack(current);
            let (next, decision) = if state.is_expired(now_ms, self.ttl_ms) {
                let next = if accelerated {
                    ScheduleState::escalated(now_ms)
                } else {
                    ScheduleState::scheduled(now_ms)
                };
                (next, ScheduleDecision::Fresh)
            } else if accelerated && !state.escalated {
                (ScheduleState::escalated(now_ms), ScheduleDecision::Escalated)
            } else {
                return ScheduleDecision::Hit;
            };

            match cell.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return decision,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current state of `region`, expired or not.
    #[must_use]
    pub fn state(&self, region: RegionKey) -> Option<ScheduleState> {
        self.cells
            .get(&region)
            .map(|cell| ScheduleState::unpack(cell.load(Ordering::Acquire)))
    }

    /// Regions with a state cell.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no region is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Inspects up to `prune_scan` of the oldest tracked keys and drops the
    /// expired ones. Returns the number removed.
    pub fn prune(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        let mut ring = self.ring.lock();
        let scan = self.prune_scan.min(ring.len());
        for _ in 0..scan {
            let Some(region) = ring.pop_front() else {
                break;
            };
            let expired = self.cells.remove_if(&region, |_, cell| {
                ScheduleState::unpack(cell.load(Ordering::Acquire)).is_expired(now_ms, self.ttl_ms)
            });
            if expired.is_some() {
                removed += 1;
            } else if self.cells.contains_key(&region) {
                ring.push_back(region);
            }
        }
        if removed > 0 {
            tracing::trace!(removed, tracked = self.cells.len(), "schedule states pruned");
        }
        removed
    }
}

impl std::fmt::Debug for ScheduleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleTable")
            .field("tracked", &self.cells.len())
            .field("ttl_ms", &self.ttl_ms)
            .finish_non_exhaustive()
    }
}
