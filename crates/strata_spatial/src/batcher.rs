//! # Spatial Work Batcher
//!
//! Turns a stream of per-unit precomputation requests into region batches.
//!
//! ```text
//!   pre_schedule(ctx, unit)
//!         │
//!         ▼
//!   RegionKey ──> ScheduleTable (one CAS) ──Hit──> done
//!                        │ Fresh / Escalated
//!                        ▼
//!                 region buffer (dedupe, upgrade)
//!                        │  len ≥ batch_size ──> flush now
//!                        │  otherwise        ──> flush after debounce
//!                        ▼
//!                   flush (one at a time)
//!                        │  dispatcher full ──> retry after flush_retry
//!                        ▼
//!   dispatch("<name>", size×size closures per region, accelerated if any
//!            region escalated)
//! ```
//!
//! Flushes run on the timer thread, so producers only pay for the schedule
//! decision and a short buffer lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use strata_core::{BatcherConfig, Clock, SharedClock, SliceError, StrataResult, SystemClock, Timer};
use strata_dispatch::{AcceleratedWorkload, DispatchOptions, ParallelDispatcher};

use crate::region::{RegionKey, UnitPos};
use crate::schedule::{ScheduleDecision, ScheduleState, ScheduleTable};

/// The per-unit computation a batcher feeds.
pub trait UnitWork: Send + Sync + 'static {
    /// Artifact produced for one unit.
    type Output: Send + 'static;

    /// Computes one unit. Runs on a worker thread.
    ///
    /// # Errors
    ///
    /// A failure fails the region batch it belongs to.
    fn run(&self, region: RegionKey, unit: UnitPos) -> Result<Self::Output, SliceError>;

    /// Called as each unit finishes successfully.
    fn on_unit_complete(&self, _region: RegionKey, _unit: UnitPos, _output: &Self::Output) {}

    /// Called once per batch with every result in unit order, or the error.
    fn on_batch_complete(&self, _regions: &[RegionKey], _result: &StrataResult<Vec<Self::Output>>) {}
}

/// What the caller of `pre_schedule` knows about its situation.
pub trait ScheduleContext {
    /// Namespace (dimension) the unit lives in.
    fn namespace(&self) -> u32;

    /// Whether accelerator-class resources are available to this caller.
    fn has_accelerator(&self) -> bool {
        false
    }
}

/// Counter snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Regions waiting in the buffer.
    pub queued_regions: usize,
    /// Batches submitted by this batcher and not yet resolved.
    pub active_batches: usize,
    /// Requests already covered by a live schedule state.
    pub cache_hits: u64,
    /// Requests that scheduled or escalated a region.
    pub cache_misses: u64,
    /// Batches submitted.
    pub batches_submitted: u64,
    /// Flushes postponed because the dispatcher was full.
    pub deferred_flushes: u64,
    /// Prefetch sweeps performed.
    pub prefetches: u64,
    /// Regions with a schedule state.
    pub tracked_regions: usize,
}

/// Object-safe view of a batcher, for registries that hold batchers of
/// different work types.
pub trait RegionBatcher: Send + Sync {
    /// Batch name.
    fn name(&self) -> &str;

    /// Counter snapshot.
    fn stats(&self) -> BatcherStats;

    /// Flushes every buffered region immediately.
    fn flush_now(&self) -> usize;
}

#[derive(Default)]
struct RegionBuffer {
    order: Vec<RegionKey>,
    escalated: HashMap<RegionKey, bool>,
}

impl RegionBuffer {
    /// Adds or upgrades a region. Returns the buffer length.
    fn push(&mut self, region: RegionKey, escalated: bool) -> usize {
        match self.escalated.get_mut(&region) {
            Some(flag) => *flag |= escalated,
            None => {
                self.escalated.insert(region, escalated);
                self.order.push(region);
            }
        }
        self.order.len()
    }

    /// Takes up to `max` regions of the oldest region's namespace.
    fn drain_batch(&mut self, max: usize) -> Vec<(RegionKey, bool)> {
        let Some(namespace) = self.order.first().map(|r| r.namespace) else {
            return Vec::new();
        };
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.order.len());
        for region in self.order.drain(..) {
            if taken.len() < max && region.namespace == namespace {
                let escalated = self.escalated.remove(&region).unwrap_or(false);
                taken.push((region, escalated));
            } else {
                kept.push(region);
            }
        }
        self.order = kept;
        taken
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    batches_submitted: AtomicU64,
    deferred_flushes: AtomicU64,
    prefetches: AtomicU64,
    calls: AtomicU64,
}

struct Prefetch {
    region: RegionKey,
    at_ms: u64,
}

struct Inner<W: UnitWork> {
    name: String,
    config: BatcherConfig,
    work: Arc<W>,
    dispatcher: ParallelDispatcher,
    timer: Arc<Timer>,
    clock: SharedClock,
    table: ScheduleTable,
    buffer: Mutex<RegionBuffer>,
    flush_gate: Mutex<()>,
    immediate_scheduled: AtomicBool,
    debounce_scheduled: AtomicBool,
    retry_scheduled: AtomicBool,
    active: AtomicUsize,
    last_prefetch: Mutex<Option<Prefetch>>,
    counters: Counters,
}

/// Groups unit requests into region batches. Cheap to clone.
pub struct SpatialWorkBatcher<W: UnitWork> {
    inner: Arc<Inner<W>>,
}

impl<W: UnitWork> Clone for SpatialWorkBatcher<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone, Copy)]
enum FlushDelay {
    Now,
    Debounce,
    Retry,
}

impl<W: UnitWork> SpatialWorkBatcher<W> {
    /// Creates a batcher submitting batches named `name`.
    pub fn new(
        name: impl Into<String>,
        config: BatcherConfig,
        work: Arc<W>,
        dispatcher: ParallelDispatcher,
        timer: Arc<Timer>,
    ) -> Self {
        Self::with_clock(name, config, work, dispatcher, timer, SystemClock::shared())
    }

    /// Like [`new`](Self::new) with an explicit clock.
    pub fn with_clock(
        name: impl Into<String>,
        config: BatcherConfig,
        work: Arc<W>,
        dispatcher: ParallelDispatcher,
        timer: Arc<Timer>,
        clock: SharedClock,
    ) -> Self {
        let table = ScheduleTable::new(config.schedule_ttl_ms, config.prune_scan);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                work,
                dispatcher,
                timer,
                clock,
                table,
                buffer: Mutex::new(RegionBuffer::default()),
                flush_gate: Mutex::new(()),
                immediate_scheduled: AtomicBool::new(false),
                debounce_scheduled: AtomicBool::new(false),
                retry_scheduled: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                last_prefetch: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Requests precomputation of the region owning `unit`.
    pub fn pre_schedule(&self, ctx: &dyn ScheduleContext, unit: UnitPos) -> ScheduleDecision {
        let region = RegionKey::containing(ctx.namespace(), unit, self.inner.config.region_size);
        self.inner.schedule_region(region, ctx.has_accelerator())
    }

    /// Pre-schedules the eight regions around `unit`, at most once per
    /// cooldown and only after moving far enough. Returns the regions that
    /// needed work.
    pub fn prefetch_around(&self, ctx: &dyn ScheduleContext, unit: UnitPos) -> usize {
        let inner = &self.inner;
        let centre = RegionKey::containing(ctx.namespace(), unit, inner.config.region_size);
        let now = inner.clock.now_millis();
        {
            let mut last = inner.last_prefetch.lock();
            if let Some(previous) = last.as_ref() {
                let cooling = now.saturating_sub(previous.at_ms) < inner.config.prefetch_cooldown_ms;
                let too_close = previous.region.manhattan(centre) < inner.config.prefetch_min_distance;
                if cooling || too_close {
                    return 0;
                }
            }
            *last = Some(Prefetch {
                region: centre,
                at_ms: now,
            });
        }

        inner.counters.prefetches.fetch_add(1, Ordering::Relaxed);
        let accelerated = ctx.has_accelerator();
        let scheduled = centre
            .neighbours()
            .into_iter()
            .filter(|region| inner.schedule_region(*region, accelerated).needs_work())
            .count();
        tracing::trace!(batcher = %inner.name, centre = %centre, scheduled, "prefetch");
        scheduled
    }

    /// Flushes every buffered region now, ignoring debounce and dispatcher
    /// capacity. Returns the number of batches submitted.
    pub fn flush_now(&self) -> usize {
        let _gate = self.inner.flush_gate.lock();
        let mut batches = 0;
        while self.inner.submit_next() {
            batches += 1;
        }
        batches
    }

    /// Regions waiting in the buffer.
    #[must_use]
    pub fn queued_regions(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Batches in flight.
    #[must_use]
    pub fn active_batches(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Regions with a schedule state.
    #[must_use]
    pub fn tracked_regions(&self) -> usize {
        self.inner.table.len()
    }

    /// Schedule state of `region`.
    #[must_use]
    pub fn schedule_state(&self, region: RegionKey) -> Option<ScheduleState> {
        self.inner.table.state(region)
    }

    /// Batch name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> BatcherStats {
        let c = &self.inner.counters;
        BatcherStats {
            queued_regions: self.queued_regions(),
            active_batches: self.active_batches(),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            batches_submitted: c.batches_submitted.load(Ordering::Relaxed),
            deferred_flushes: c.deferred_flushes.load(Ordering::Relaxed),
            prefetches: c.prefetches.load(Ordering::Relaxed),
            tracked_regions: self.tracked_regions(),
        }
    }
}

impl<W: UnitWork> RegionBatcher for SpatialWorkBatcher<W> {
    fn name(&self) -> &str {
        SpatialWorkBatcher::name(self)
    }

    fn stats(&self) -> BatcherStats {
        SpatialWorkBatcher::stats(self)
    }

    fn flush_now(&self) -> usize {
        SpatialWorkBatcher::flush_now(self)
    }
}

impl<W: UnitWork> std::fmt::Debug for SpatialWorkBatcher<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialWorkBatcher")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<W: UnitWork> Inner<W> {
    fn schedule_region(self: &Arc<Self>, region: RegionKey, accelerated: bool) -> ScheduleDecision {
        let now = self.clock.now_millis();
        let decision = self.table.decide(region, now, accelerated);

        if decision.needs_work() {
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            let queued = self.buffer.lock().push(region, accelerated);
            if queued >= self.config.batch_size {
                self.request_flush(FlushDelay::Now);
            } else {
                self.request_flush(FlushDelay::Debounce);
            }
        } else {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        }

        let calls = self.counters.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % u64::from(self.config.prune_every.max(1)) == 0 {
            self.table.prune(now);
        }
        decision
    }

    fn request_flush(self: &Arc<Self>, delay: FlushDelay) {
        let (flag, wait) = match delay {
            FlushDelay::Now => (&self.immediate_scheduled, Duration::ZERO),
            FlushDelay::Debounce => (&self.debounce_scheduled, self.config.debounce()),
            FlushDelay::Retry => (&self.retry_scheduled, self.config.flush_retry()),
        };
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let scheduled = self.timer.schedule(wait, move || {
            if let Some(inner) = weak.upgrade() {
                inner.flag(delay).store(false, Ordering::Release);
                inner.flush();
            }
        });
        if !scheduled {
            flag.store(false, Ordering::Release);
            tracing::debug!(batcher = %self.name, "timer stopped; flush not scheduled");
        }
    }

    fn flag(&self, delay: FlushDelay) -> &AtomicBool {
        match delay {
            FlushDelay::Now => &self.immediate_scheduled,
            FlushDelay::Debounce => &self.debounce_scheduled,
            FlushDelay::Retry => &self.retry_scheduled,
        }
    }

    fn flush(self: &Arc<Self>) {
        let Some(gate) = self.flush_gate.try_lock() else {
            // The holder may have drained before our regions arrived.
            self.request_flush(FlushDelay::Retry);
            return;
        };

        if !self.dispatcher.has_capacity() {
            self.counters.deferred_flushes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                batcher = %self.name,
                active = self.dispatcher.active_batches(),
                "dispatcher full; deferring flush"
            );
            drop(gate);
            self.request_flush(FlushDelay::Retry);
            return;
        }

        self.submit_next();
        drop(gate);

        let left = self.buffer.lock().len();
        if left >= self.config.batch_size {
            self.request_flush(FlushDelay::Now);
        } else if left > 0 {
            self.request_flush(FlushDelay::Debounce);
        }
    }

    /// Submits one batch from the buffer. Caller holds the flush gate.
    fn submit_next(self: &Arc<Self>) -> bool {
        let drained = self.buffer.lock().drain_batch(self.config.batch_size.max(1));
        if drained.is_empty() {
            return false;
        }

        let size = self.config.region_size;
        let regions: Arc<Vec<RegionKey>> = Arc::new(drained.iter().map(|(r, _)| *r).collect());
        let units: Arc<Vec<(RegionKey, UnitPos)>> = Arc::new(
            regions
                .iter()
                .flat_map(|region| region.units(size).map(move |unit| (*region, unit)))
                .collect(),
        );

        let slices: Vec<_> = units
            .iter()
            .map(|&(region, unit)| {
                let work = Arc::clone(&self.work);
                move || work.run(region, unit)
            })
            .collect();

        let progress_work = Arc::clone(&self.work);
        let progress_units = Arc::clone(&units);
        let mut options = DispatchOptions::new()
            .namespace(regions[0].namespace.to_string())
            .on_slice_complete(move |index, output: &W::Output| {
                if let Some(&(region, unit)) = progress_units.get(index) {
                    progress_work.on_unit_complete(region, unit, output);
                }
            });
        if drained.iter().any(|(_, escalated)| *escalated) {
            options = options.accelerated(AcceleratedWorkload::new(self.name.clone(), units.len()));
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        self.counters.batches_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            batcher = %self.name,
            regions = regions.len(),
            units = units.len(),
            "submitting region batch"
        );

        let handle = self.dispatcher.dispatch(&self.name, slices, options);
        let done = Arc::clone(self);
        handle.on_complete(move |result| {
            if let Err(e) = result {
                tracing::warn!(batcher = %done.name, regions = regions.len(), error = %e, "region batch failed");
            }
            done.work.on_batch_complete(&regions, result);
            done.active.fetch_sub(1, Ordering::AcqRel);
        });
        true
    }
}
