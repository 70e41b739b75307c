//! # Engine
//!
//! The explicit registry that owns every STRATA subsystem.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Engine                                 │
//! │                                                                      │
//! │  SpatialWorkBatcher(s) ──dispatch──> ParallelDispatcher              │
//! │                                         │   ├─ WorkerPoolBackend     │
//! │                                         │   ├─ Accelerator (probed)  │
//! │                                         │   └─ slice cache (tiered)  │
//! │                                         ▼                            │
//! │  AdaptiveConcurrencyLimiter <── LimiterTuner <── on_tick(signal)     │
//! │                                                        │             │
//! │  MainThreadIntegrationQueue <── drain ─────────────────┤             │
//! │  CombinedBudgetCoordinator  <── maybe_evict ───────────┘             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Build one with [`Engine::builder`], call [`Engine::on_tick`] at the end of
//! every host tick, and [`Engine::shutdown`] before exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strata_cache::{
    BudgetManager, BudgetPool, CacheBackend, CombinedBudgetCoordinator, DiskCacheBackend,
    MemoryCacheBackend, TieredCacheBackend,
};
use strata_core::{
    AdaptiveConcurrencyLimiter, SharedClock, SliceError, StrataConfig, StrataResult,
    SystemClock, Timer,
};
use strata_dispatch::{
    AcceleratorProbe, BatchHandle, DispatchOptions, DispatchStats, ExecutionBackend,
    NoAccelerator, ParallelDispatcher, WorkerPoolBackend,
};
use strata_spatial::{RegionBatcher, SpatialWorkBatcher, UnitWork};

use crate::main_thread::{
    DrainReport, HostScheduler, MainThreadIntegrationQueue, QueueStats, StopReason,
};
use crate::stats::TickStatsAccumulator;

/// End-of-tick signal from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickSignal {
    /// Time the tick took.
    pub spent: Duration,
    /// Time the tick was allowed.
    pub budget: Duration,
}

impl TickSignal {
    /// Creates a tick signal.
    #[must_use]
    pub const fn new(spent: Duration, budget: Duration) -> Self {
        Self { spent, budget }
    }

    /// Whether the tick overran its budget.
    #[must_use]
    pub fn is_over_budget(&self) -> bool {
        self.spent > self.budget
    }
}

/// Adapts the limiter to host load: an over-budget tick shrinks the limit by
/// one, a run of healthy ticks grows it by one.
#[derive(Debug)]
pub struct LimiterTuner {
    limiter: Arc<AdaptiveConcurrencyLimiter>,
    grow_after: u32,
    healthy: u32,
}

impl LimiterTuner {
    /// Creates a tuner growing the limit after `grow_after` healthy ticks.
    #[must_use]
    pub fn new(limiter: Arc<AdaptiveConcurrencyLimiter>, grow_after: u32) -> Self {
        Self {
            limiter,
            grow_after: grow_after.max(1),
            healthy: 0,
        }
    }

    /// Feeds one tick. Returns the new limit if it changed.
    pub fn observe(&mut self, over_budget: bool) -> Option<usize> {
        let limit = self.limiter.limit();
        if over_budget {
            self.healthy = 0;
            if limit > self.limiter.min() {
                return Some(self.limiter.set_limit(limit - 1));
            }
            return None;
        }

        self.healthy += 1;
        if self.healthy < self.grow_after {
            return None;
        }
        self.healthy = 0;
        if limit < self.limiter.max() {
            return Some(self.limiter.set_limit(limit + 1));
        }
        None
    }
}

/// Outcome of [`Engine::on_tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickReport {
    /// Tick-end drain of the main-thread queue.
    pub drain: DrainReport,
    /// Limiter ceiling after tuning.
    pub limit: usize,
    /// Whether tuning changed the ceiling.
    pub limit_changed: bool,
    /// Entries evicted by the combined budget pass.
    pub evicted: usize,
}

/// Observable counters across the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Regions buffered across all batchers.
    pub queued_regions: usize,
    /// Batches in flight in the dispatcher.
    pub active_batches: usize,
    /// Schedule requests already covered, across all batchers.
    pub cache_hits: u64,
    /// Schedule requests that produced work, across all batchers.
    pub cache_misses: u64,
    /// In-flight batches per batch name.
    pub pending_by_kind: HashMap<String, usize>,
    /// Tasks waiting for the host thread.
    pub main_thread_pending: usize,
    /// Limiter ceiling.
    pub limiter_limit: usize,
    /// Limiter tokens held.
    pub limiter_active: usize,
    /// Bytes retained by the slice cache.
    pub slice_cache_bytes: u64,
    /// Bytes across every pool under the combined ceiling.
    pub combined_bytes: u64,
    /// Dispatcher counters.
    pub dispatch: DispatchStats,
    /// Main-thread queue counters.
    pub main_thread: QueueStats,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    config: StrataConfig,
    clock: Option<SharedClock>,
    host: Option<Arc<dyn HostScheduler>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    probe: Box<dyn AcceleratorProbe>,
    pools: Vec<Arc<dyn BudgetPool>>,
}

impl EngineBuilder {
    /// Clock for TTLs, rate limits and diagnostics.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Host scheduler for fast-path drains and backpressure.
    #[must_use]
    pub fn host(mut self, host: Arc<dyn HostScheduler>) -> Self {
        self.host = Some(host);
        self
    }

    /// Execution backend. Defaults to a worker pool sized from the config.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Accelerator capability probe, run once by `build`.
    #[must_use]
    pub fn accelerator_probe(mut self, probe: impl AcceleratorProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Adds a budget manager to the combined ceiling.
    #[must_use]
    pub fn budget_pool(mut self, pool: Arc<dyn BudgetPool>) -> Self {
        self.pools.push(pool);
        self
    }

    /// Validates the config and starts every subsystem.
    ///
    /// # Errors
    ///
    /// Returns `StrataError::Config` for an invalid configuration. A disk
    /// cache that cannot be opened is logged and skipped.
    pub fn build(self) -> StrataResult<Engine> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let timer = Timer::start("strata-timer");
        let limiter = AdaptiveConcurrencyLimiter::new(
            config.limiter.initial,
            config.limiter.min,
            config.limiter.max,
        );

        let (backend, pool): (Arc<dyn ExecutionBackend>, Option<Arc<WorkerPoolBackend>>) =
            match self.backend {
                Some(backend) => (backend, None),
                None => {
                    let pool = Arc::new(WorkerPoolBackend::new(
                        "strata-worker",
                        config.dispatch.resolved_worker_threads(),
                        config.dispatch.queue_capacity,
                    ));
                    (Arc::clone(&pool) as Arc<dyn ExecutionBackend>, Some(pool))
                }
            };

        let slice_budget: Arc<BudgetManager<String>> = Arc::new(BudgetManager::with_clock(
            "slice-cache",
            &config.cache,
            Arc::clone(&clock),
        ));
        let disk = config.cache.disk_root.as_ref().and_then(|root| {
            DiskCacheBackend::open(root.clone())
                .map_err(|e| {
                    tracing::warn!(root = %root.display(), error = %e, "disk cache unavailable; persistent slices stay in memory");
                })
                .ok()
        });
        let slice_cache = TieredCacheBackend::new(
            MemoryCacheBackend::new(Arc::clone(&slice_budget), Arc::clone(&clock)),
            disk,
        );

        let probe = self.probe;
        let dispatcher = ParallelDispatcher::builder(config.dispatch.clone(), backend)
            .limiter(Arc::clone(&limiter))
            .cache(Arc::new(slice_cache.clone()) as Arc<dyn CacheBackend>)
            .timer(Arc::clone(&timer))
            .clock(Arc::clone(&clock))
            .accelerator_probe(move || probe.probe())
            .build();

        let mut pools = self.pools;
        pools.insert(0, Arc::clone(&slice_budget) as Arc<dyn BudgetPool>);
        let coordinator = CombinedBudgetCoordinator::with_clock(pools, &config.cache, Arc::clone(&clock));

        let main_thread =
            MainThreadIntegrationQueue::with_clock(config.main_thread.clone(), Arc::clone(&clock));
        if let Some(host) = self.host {
            main_thread.set_host(host);
        }

        let tuner = LimiterTuner::new(Arc::clone(&limiter), config.limiter.grow_after_healthy_ticks);

        tracing::info!(
            workers = pool.as_ref().map_or(0, |p| p.worker_count()),
            limit = limiter.limit(),
            accelerator = dispatcher.has_accelerator(),
            disk_cache = slice_cache.disk().is_some(),
            "strata engine started"
        );

        Ok(Engine {
            config,
            clock,
            timer,
            limiter,
            tuner: Mutex::new(tuner),
            pool,
            dispatcher,
            slice_budget,
            slice_cache,
            coordinator,
            main_thread,
            batchers: RwLock::new(Vec::new()),
            tick_stats: Mutex::new(TickStatsAccumulator::new()),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// The background precomputation engine.
pub struct Engine {
    config: StrataConfig,
    clock: SharedClock,
    timer: Arc<Timer>,
    limiter: Arc<AdaptiveConcurrencyLimiter>,
    tuner: Mutex<LimiterTuner>,
    pool: Option<Arc<WorkerPoolBackend>>,
    dispatcher: ParallelDispatcher,
    slice_budget: Arc<BudgetManager<String>>,
    slice_cache: TieredCacheBackend,
    coordinator: CombinedBudgetCoordinator,
    main_thread: MainThreadIntegrationQueue,
    batchers: RwLock<Vec<Arc<dyn RegionBatcher>>>,
    tick_stats: Mutex<TickStatsAccumulator>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder(config: StrataConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            host: None,
            backend: None,
            probe: Box::new(NoAccelerator),
            pools: Vec::new(),
        }
    }

    /// Creates a batcher feeding `work`, registered for counters and shutdown.
    pub fn spatial_batcher<W: UnitWork>(&self, name: &str, work: Arc<W>) -> SpatialWorkBatcher<W> {
        let batcher = SpatialWorkBatcher::with_clock(
            name,
            self.config.batcher.clone(),
            work,
            self.dispatcher.clone(),
            Arc::clone(&self.timer),
            Arc::clone(&self.clock),
        );
        self.batchers
            .write()
            .push(Arc::new(batcher.clone()) as Arc<dyn RegionBatcher>);
        batcher
    }

    /// Dispatches a batch of slices on the engine's dispatcher.
    pub fn dispatch<T, F>(&self, name: &str, slices: Vec<F>, options: DispatchOptions<T>) -> BatchHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, SliceError> + Send + 'static,
    {
        self.dispatcher.dispatch(name, slices, options)
    }

    /// Queues `task` for the host thread.
    pub fn submit_to_main_thread(&self, task: impl FnOnce() + Send + 'static) {
        self.main_thread.submit(task);
    }

    /// End-of-tick hook: tunes the limiter, drains the main-thread queue in
    /// the time the tick has left and runs a combined budget pass.
    pub fn on_tick(&self, signal: TickSignal) -> TickReport {
        let over_budget = signal.is_over_budget();
        let changed = self.tuner.lock().observe(over_budget);
        if let Some(limit) = changed {
            tracing::debug!(limit, over_budget, spent_us = signal.spent.as_micros(), "limiter retuned");
        }

        let drain = self.drain_within(&signal);
        let evicted = self.coordinator.maybe_evict();
        self.tick_stats.lock().record(&signal, &drain);

        TickReport {
            drain,
            limit: self.limiter.limit(),
            limit_changed: changed.is_some(),
            evicted,
        }
    }

    /// Drains the main-thread queue within what is left of the tick. An
    /// over-budget tick runs nothing.
    fn drain_within(&self, signal: &TickSignal) -> DrainReport {
        if signal.is_over_budget() {
            return DrainReport {
                executed: 0,
                failed: 0,
                remaining: self.main_thread.len(),
                stop: StopReason::Backpressure,
                elapsed: Duration::ZERO,
            };
        }
        let left = signal.budget.saturating_sub(signal.spent);
        self.main_thread
            .drain_with_budget(self.config.main_thread.drain_budget().min(left))
    }

    /// Counter snapshot across every subsystem.
    #[must_use]
    pub fn counters(&self) -> EngineCounters {
        let mut counters = EngineCounters {
            active_batches: self.dispatcher.active_batches(),
            pending_by_kind: self.dispatcher.pending_by_kind(),
            main_thread_pending: self.main_thread.len(),
            limiter_limit: self.limiter.limit(),
            limiter_active: self.limiter.active(),
            slice_cache_bytes: self.slice_budget.total_bytes(),
            combined_bytes: self.coordinator.combined_bytes(),
            dispatch: self.dispatcher.stats(),
            main_thread: self.main_thread.stats(),
            ..EngineCounters::default()
        };
        for batcher in self.batchers.read().iter() {
            let stats = batcher.stats();
            counters.queued_regions += stats.queued_regions;
            counters.cache_hits += stats.cache_hits;
            counters.cache_misses += stats.cache_misses;
        }
        counters
    }

    /// Tick statistics so far.
    #[must_use]
    pub fn tick_stats(&self) -> TickStatsAccumulator {
        self.tick_stats.lock().clone()
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &ParallelDispatcher {
        &self.dispatcher
    }

    /// The limiter.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<AdaptiveConcurrencyLimiter> {
        &self.limiter
    }

    /// The main-thread queue.
    #[must_use]
    pub const fn main_thread(&self) -> &MainThreadIntegrationQueue {
        &self.main_thread
    }

    /// The slice cache.
    #[must_use]
    pub const fn slice_cache(&self) -> &TieredCacheBackend {
        &self.slice_cache
    }

    /// The combined budget coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &CombinedBudgetCoordinator {
        &self.coordinator
    }

    /// The shared timer thread.
    #[must_use]
    pub const fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// Flushes buffered regions, then stops the timer, worker pool and
    /// fallback lane. Queued work finishes; later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let flushed: usize = self.batchers.read().iter().map(|b| b.flush_now()).sum();
        self.timer.shutdown();
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        self.dispatcher.shutdown();

        let counters = self.counters();
        tracing::info!(
            flushed,
            submitted = counters.dispatch.submitted,
            completed = counters.dispatch.completed,
            failed = counters.dispatch.failed,
            "strata engine stopped"
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dispatcher", &self.dispatcher)
            .field("main_thread", &self.main_thread)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
