//! # Engine Configuration
//!
//! All tuning lives in one TOML document, loaded once at startup:
//!
//! ```toml
//! [cache]
//! max_bytes = 268435456
//! combined_max_bytes = 402653184
//!
//! [dispatch]
//! worker_threads = 6
//! max_concurrent_batches = 8
//!
//! [batcher]
//! region_size = 5
//! schedule_ttl_ms = 30000
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Cache budgeting.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Byte ceiling for a single budget manager.
    pub max_bytes: u64,
    /// Byte ceiling across every manager registered with the coordinator.
    pub combined_max_bytes: u64,
    /// Evictions a single manager pass may perform before giving up.
    pub max_evictions_per_pass: usize,
    /// Evictions a single combined pass may perform.
    pub combined_max_evictions_per_pass: usize,
    /// Recency queue length allowed per live entry before it is trimmed.
    pub recency_trim_factor: usize,
    /// Root directory for the persistent slice cache. `None` keeps everything in memory.
    pub disk_root: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            combined_max_bytes: 384 * 1024 * 1024,
            max_evictions_per_pass: 256,
            combined_max_evictions_per_pass: 512,
            recency_trim_factor: 4,
            disk_root: None,
        }
    }
}

/// Adaptive concurrency limiter bounds.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LimiterConfig {
    /// Starting limit.
    pub initial: usize,
    /// Lowest limit the tuner may shrink to.
    pub min: usize,
    /// Highest limit the tuner may grow to.
    pub max: usize,
    /// Consecutive healthy ticks before the tuner grows the limit by one.
    pub grow_after_healthy_ticks: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial: 4,
            min: 1,
            max: 16,
            grow_after_healthy_ticks: 20,
        }
    }
}

/// Parallel dispatcher tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Worker threads in the default pool. `0` means one per logical core.
    pub worker_threads: usize,
    /// Jobs the pool accepts before reporting saturation.
    pub queue_capacity: usize,
    /// Upper bound on jobs a single batch fans out to.
    pub max_parallelism: usize,
    /// Parallelism used for batches classified as small.
    pub small_batch_parallelism: usize,
    /// Estimated batch cost (microseconds) under which a batch counts as small.
    pub small_batch_threshold_us: u64,
    /// Slice count under which an unmeasured batch counts as small.
    pub small_batch_slice_count: usize,
    /// Batches allowed in flight before producers are asked to defer.
    pub max_concurrent_batches: usize,
    /// Whole-batch retries after a saturation rejection.
    pub saturation_retries: u32,
    /// Base delay of the linear saturation backoff.
    pub saturation_base_delay_ms: u64,
    /// Minimum gap between two saturation log lines.
    pub saturation_log_interval_ms: u64,
    /// Deadline for accelerator-hinted batches, covering admission and
    /// execution. Slices not started by then run on the CPU backend.
    pub accelerator_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            queue_capacity: 1024,
            max_parallelism: 8,
            small_batch_parallelism: 2,
            small_batch_threshold_us: 500,
            small_batch_slice_count: 8,
            max_concurrent_batches: 8,
            saturation_retries: 3,
            saturation_base_delay_ms: 5,
            saturation_log_interval_ms: 5_000,
            accelerator_timeout_ms: 50,
        }
    }
}

impl DispatchConfig {
    /// Resolved worker count.
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
    }

    /// Base saturation delay.
    #[must_use]
    pub const fn saturation_base_delay(&self) -> Duration {
        Duration::from_millis(self.saturation_base_delay_ms)
    }

    /// Accelerator admission and execution deadline.
    #[must_use]
    pub const fn accelerator_timeout(&self) -> Duration {
        Duration::from_millis(self.accelerator_timeout_ms)
    }
}

/// Spatial batcher tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BatcherConfig {
    /// Units per region side.
    pub region_size: u32,
    /// Buffered regions that trigger an immediate flush.
    pub batch_size: usize,
    /// Delay before a partial buffer is flushed.
    pub debounce_ms: u64,
    /// Delay before a deferred flush is retried.
    pub flush_retry_ms: u64,
    /// Lifetime of a region's schedule state.
    pub schedule_ttl_ms: u64,
    /// `pre_schedule` calls between two prune sweeps.
    pub prune_every: u32,
    /// Entries inspected by a single prune sweep.
    pub prune_scan: usize,
    /// Minimum gap between two prefetches.
    pub prefetch_cooldown_ms: u64,
    /// Minimum Manhattan distance (in regions) moved between two prefetches.
    pub prefetch_min_distance: u32,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            region_size: 5,
            batch_size: 16,
            debounce_ms: 50,
            flush_retry_ms: 25,
            schedule_ttl_ms: 30_000,
            prune_every: 64,
            prune_scan: 128,
            prefetch_cooldown_ms: 500,
            prefetch_min_distance: 1,
        }
    }
}

impl BatcherConfig {
    /// Debounce delay.
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Deferred flush delay.
    #[must_use]
    pub const fn flush_retry(&self) -> Duration {
        Duration::from_millis(self.flush_retry_ms)
    }
}

/// Main-thread integration queue tuning.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MainThreadConfig {
    /// Tasks a single drain may execute.
    pub max_tasks_per_drain: usize,
    /// Time budget of a tick-end drain.
    pub drain_budget_us: u64,
    /// Queue length that triggers a fast-path drain request.
    pub fast_path_threshold: usize,
    /// Minimum gap between two fast-path requests.
    pub fast_path_min_interval_ms: u64,
    /// Time budget of a fast-path drain.
    pub fast_path_budget_us: u64,
}

impl Default for MainThreadConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_drain: 256,
            drain_budget_us: 2_000,
            fast_path_threshold: 64,
            fast_path_min_interval_ms: 10,
            fast_path_budget_us: 1_000,
        }
    }
}

impl MainThreadConfig {
    /// Tick-end drain budget.
    #[must_use]
    pub const fn drain_budget(&self) -> Duration {
        Duration::from_micros(self.drain_budget_us)
    }

    /// Fast-path drain budget.
    #[must_use]
    pub const fn fast_path_budget(&self) -> Duration {
        Duration::from_micros(self.fast_path_budget_us)
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    /// Cache budgeting.
    pub cache: CacheConfig,
    /// Concurrency limiter.
    pub limiter: LimiterConfig,
    /// Dispatcher.
    pub dispatch: DispatchConfig,
    /// Spatial batcher.
    pub batcher: BatcherConfig,
    /// Main-thread queue.
    pub main_thread: MainThreadConfig,
}

impl StrataConfig {
    /// Dedicated-server preset: larger budgets, more fan-out, longer TTLs.
    #[must_use]
    pub fn production() -> Self {
        Self {
            cache: CacheConfig {
                max_bytes: 1024 * 1024 * 1024,
                combined_max_bytes: 1536 * 1024 * 1024,
                ..CacheConfig::default()
            },
            limiter: LimiterConfig {
                initial: 8,
                min: 2,
                max: 32,
                ..LimiterConfig::default()
            },
            dispatch: DispatchConfig {
                queue_capacity: 4096,
                max_parallelism: 16,
                max_concurrent_batches: 16,
                ..DispatchConfig::default()
            },
            batcher: BatcherConfig {
                batch_size: 32,
                schedule_ttl_ms: 120_000,
                ..BatcherConfig::default()
            },
            main_thread: MainThreadConfig::default(),
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML and
    /// `ConfigError::Invalid` for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise the
    /// errors of [`StrataConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.limiter.min == 0 {
            return invalid("limiter.min must be at least 1");
        }
        if self.limiter.min > self.limiter.max {
            return invalid("limiter.min must not exceed limiter.max");
        }
        if self.dispatch.queue_capacity == 0 {
            return invalid("dispatch.queue_capacity must be at least 1");
        }
        if self.dispatch.max_parallelism == 0 || self.dispatch.small_batch_parallelism == 0 {
            return invalid("dispatch parallelism must be at least 1");
        }
        if self.dispatch.max_concurrent_batches == 0 {
            return invalid("dispatch.max_concurrent_batches must be at least 1");
        }
        if self.batcher.region_size == 0 {
            return invalid("batcher.region_size must be at least 1");
        }
        if self.batcher.batch_size == 0 {
            return invalid("batcher.batch_size must be at least 1");
        }
        if self.batcher.prune_scan == 0 {
            return invalid("batcher.prune_scan must be at least 1");
        }
        if self.cache.recency_trim_factor < 2 {
            return invalid("cache.recency_trim_factor must be at least 2");
        }
        if self.main_thread.max_tasks_per_drain == 0 {
            return invalid("main_thread.max_tasks_per_drain must be at least 1");
        }
        Ok(())
    }
}
