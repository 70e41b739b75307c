//! # Log Throttling
//!
//! Saturation and degradation conditions can fire thousands of times per
//! second. These helpers keep the log to one line per condition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NEVER: u64 = 0;

/// Allows one event per interval; counts the ones it suppresses.
#[derive(Debug)]
pub struct LogThrottle {
    interval_ms: u64,
    last_ms: AtomicU64,
    suppressed: AtomicU64,
}

impl LogThrottle {
    /// Creates a throttle allowing one event per `interval_ms`.
    #[must_use]
    pub const fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            last_ms: AtomicU64::new(NEVER),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(suppressed_since_last)` if the caller should log now.
    ///
    /// `now_ms` must come from a [`Clock`](crate::clock::Clock) (never 0).
    pub fn check(&self, now_ms: u64) -> Option<u64> {
        let last = self.last_ms.load(Ordering::Acquire);
        let due = last == NEVER || now_ms.saturating_sub(last) >= self.interval_ms;
        if due
            && self
                .last_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::AcqRel));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}

/// Reports a degraded state once, until the state clears.
#[derive(Debug, Default)]
pub struct StateLatch {
    latched: AtomicBool,
}

impl StateLatch {
    /// Creates a clear latch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            latched: AtomicBool::new(false),
        }
    }

    /// Returns true only for the first call since the last [`clear`](Self::clear).
    pub fn enter(&self) -> bool {
        !self.latched.swap(true, Ordering::AcqRel)
    }

    /// Returns true if the latch was set.
    pub fn clear(&self) -> bool {
        self.latched.swap(false, Ordering::AcqRel)
    }

    /// Whether the degraded state is currently latched.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }
}
