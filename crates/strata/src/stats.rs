//! Per-tick statistics.

use crate::engine::TickSignal;
use crate::main_thread::DrainReport;

/// Accumulator for tick statistics.
#[derive(Clone, Debug)]
pub struct TickStatsAccumulator {
    /// Ticks recorded.
    pub ticks_recorded: u64,
    /// Sum of host tick time.
    pub spent_us_sum: u64,
    /// Shortest tick.
    pub min_tick_us: u64,
    /// Longest tick.
    pub max_tick_us: u64,
    /// Ticks that exceeded their budget.
    pub ticks_over_budget: u64,
    /// Main-thread tasks run by tick-end drains.
    pub tasks_drained: u64,
    /// Sum of tick-end drain time.
    pub drain_us_sum: u64,
}

impl TickStatsAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ticks_recorded: 0,
            spent_us_sum: 0,
            min_tick_us: u64::MAX,
            max_tick_us: 0,
            ticks_over_budget: 0,
            tasks_drained: 0,
            drain_us_sum: 0,
        }
    }

    /// Records one tick and its drain.
    pub fn record(&mut self, signal: &TickSignal, drain: &DrainReport) {
        let spent_us = u64::try_from(signal.spent.as_micros()).unwrap_or(u64::MAX);
        self.ticks_recorded += 1;
        self.spent_us_sum = self.spent_us_sum.saturating_add(spent_us);
        self.min_tick_us = self.min_tick_us.min(spent_us);
        self.max_tick_us = self.max_tick_us.max(spent_us);
        if signal.is_over_budget() {
            self.ticks_over_budget += 1;
        }
        self.tasks_drained += drain.executed as u64;
        self.drain_us_sum = self
            .drain_us_sum
            .saturating_add(u64::try_from(drain.elapsed.as_micros()).unwrap_or(u64::MAX));
    }

    /// Average host tick time.
    #[must_use]
    pub fn avg_tick_us(&self) -> u64 {
        if self.ticks_recorded == 0 {
            0
        } else {
            self.spent_us_sum / self.ticks_recorded
        }
    }

    /// Average tick-end drain time.
    #[must_use]
    pub fn avg_drain_us(&self) -> u64 {
        if self.ticks_recorded == 0 {
            0
        } else {
            self.drain_us_sum / self.ticks_recorded
        }
    }

    /// Percentage of ticks over budget.
    #[must_use]
    pub fn over_budget_percent(&self) -> f64 {
        if self.ticks_recorded == 0 {
            0.0
        } else {
            (self.ticks_over_budget as f64 / self.ticks_recorded as f64) * 100.0
        }
    }
}

impl Default for TickStatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
