//! # Cost Model
//!
//! Per-batch-kind estimate of nanoseconds per slice, as an exponentially
//! weighted moving average with a decay of 1/8 per sample.
//!
//! ```text
//!   ewma' = ewma + (sample - ewma) / 8
//! ```
//!
//! The estimate drives parallelism: a batch whose estimated total cost is
//! tiny runs on few jobs so fan-out overhead does not dominate.

use std::time::Duration;

use dashmap::DashMap;
use strata_core::DispatchConfig;

/// Weight of the newest sample, as a shift (1/8).
const DECAY_SHIFT: u32 = 3;

/// EWMA of slice cost keyed by batch name.
#[derive(Debug, Default)]
pub struct CostModel {
    estimates: DashMap<String, u64>,
}

impl CostModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a measurement of `slices` slices taking `elapsed` in total.
    pub fn record(&self, name: &str, elapsed: Duration, slices: usize) {
        if slices == 0 {
            return;
        }
        let total = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let sample = total / slices as u64;

        if let Some(mut estimate) = self.estimates.get_mut(name) {
            let current = *estimate;
            *estimate = if sample >= current {
                current + ((sample - current) >> DECAY_SHIFT)
            } else {
                current - ((current - sample) >> DECAY_SHIFT)
            };
            return;
        }
        self.estimates.insert(name.to_string(), sample);
    }

    /// Nanoseconds per slice, if `name` has been measured.
    #[must_use]
    pub fn estimate_nanos(&self, name: &str) -> Option<u64> {
        self.estimates.get(name).map(|e| *e)
    }

    /// Jobs a batch of `slice_count` slices should fan out to.
    #[must_use]
    pub fn parallelism_for(&self, name: &str, slice_count: usize, config: &DispatchConfig) -> usize {
        if slice_count == 0 {
            return 0;
        }
        let threshold_ns = config.small_batch_threshold_us.saturating_mul(1_000);
        let small = match self.estimate_nanos(name) {
            Some(per_slice) => per_slice.saturating_mul(slice_count as u64) < threshold_ns,
            None => slice_count <= config.small_batch_slice_count,
        };
        let cap = if small {
            config.small_batch_parallelism
        } else {
            config.max_parallelism
        };
        cap.max(1).min(slice_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds_estimate() {
        let model = CostModel::new();
        assert_eq!(model.estimate_nanos("mesh"), None);
        model.record("mesh", Duration::from_micros(80), 8);
        assert_eq!(model.estimate_nanos("mesh"), Some(10_000));
    }

    #[test]
    fn test_ewma_moves_an_eighth() {
        let model = CostModel::new();
        model.record("mesh", Duration::from_nanos(8_000), 1);
        model.record("mesh", Duration::from_nanos(16_000), 1);
        assert_eq!(model.estimate_nanos("mesh"), Some(9_000));
        model.record("mesh", Duration::from_nanos(1_000), 1);
        assert_eq!(model.estimate_nanos("mesh"), Some(8_000));
    }

    #[test]
    fn test_small_batches_get_low_parallelism() {
        let config = DispatchConfig::default();
        let model = CostModel::new();

        // Unmeasured: small by slice count.
        assert_eq!(model.parallelism_for("fresh", 8, &config), 2);
        assert_eq!(model.parallelism_for("fresh", 64, &config), 8);
        assert_eq!(model.parallelism_for("fresh", 1, &config), 1);

        // Cheap slices: 100 × 1µs < 500µs.
        model.record("cheap", Duration::from_micros(1), 1);
        assert_eq!(model.parallelism_for("cheap", 100, &config), 2);

        // Expensive slices fan out fully.
        model.record("heavy", Duration::from_millis(2), 1);
        assert_eq!(model.parallelism_for("heavy", 4, &config), 4);
        assert_eq!(model.parallelism_for("heavy", 40, &config), 8);
    }
}
