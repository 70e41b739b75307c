//! # Adaptive Concurrency Limiter
//!
//! A resizable gate in front of coarse-grained work. One mutex, one condvar,
//! no lock-free fast path: it guards batches, not hot-path calls.
//!
//! ```text
//!   enter() ──> active < limit ? ──yes──> active += 1 ──> LimiterToken
//!                     │no
//!                     └──> wait on condvar (woken by token drop / set_limit)
//! ```

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    active: usize,
}

/// Bounded, live-resizable concurrency gate.
#[derive(Debug)]
pub struct AdaptiveConcurrencyLimiter {
    state: Mutex<LimiterState>,
    available: Condvar,
    min: usize,
    max: usize,
}

impl AdaptiveConcurrencyLimiter {
    /// Creates a limiter. `min` is raised to 1 and `max` to `min`; the initial
    /// limit is clamped into `[min, max]`.
    #[must_use]
    pub fn new(initial: usize, min: usize, max: usize) -> Arc<Self> {
        let min = min.max(1);
        let max = max.max(min);
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                limit: initial.clamp(min, max),
                active: 0,
            }),
            available: Condvar::new(),
            min,
            max,
        })
    }

    /// Blocks until a unit of capacity is free, then claims it.
    ///
    /// The wait is uninterruptible; the token releases the unit on drop.
    #[must_use]
    pub fn enter(self: &Arc<Self>) -> LimiterToken {
        let mut state = self.state.lock();
        while state.active >= state.limit {
            self.available.wait(&mut state);
        }
        state.active += 1;
        LimiterToken {
            limiter: Arc::clone(self),
        }
    }

    /// Claims a unit of capacity if one is free right now.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<LimiterToken> {
        let mut state = self.state.lock();
        if state.active >= state.limit {
            return None;
        }
        state.active += 1;
        Some(LimiterToken {
            limiter: Arc::clone(self),
        })
    }

    /// Changes the ceiling. Holders above a shrunk ceiling keep running;
    /// only future admissions are throttled.
    ///
    /// Returns the applied (clamped) limit.
    pub fn set_limit(&self, new_limit: usize) -> usize {
        let clamped = new_limit.clamp(self.min, self.max);
        let mut state = self.state.lock();
        if state.limit != clamped {
            tracing::debug!(from = state.limit, to = clamped, "concurrency limit changed");
            state.limit = clamped;
            drop(state);
            self.available.notify_all();
        }
        clamped
    }

    /// Current ceiling.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Tokens currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Lower clamp.
    #[must_use]
    pub const fn min(&self) -> usize {
        self.min
    }

    /// Upper clamp.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

/// One unit of limiter capacity. Released exactly once, when dropped.
#[derive(Debug)]
#[must_use = "dropping the token immediately releases the capacity"]
pub struct LimiterToken {
    limiter: Arc<AdaptiveConcurrencyLimiter>,
}

impl LimiterToken {
    /// Releases the capacity now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LimiterToken {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
