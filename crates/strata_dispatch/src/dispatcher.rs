//! # Parallel Dispatcher
//!
//! Fan-out/fan-in execution of named batches of slice closures.
//!
//! ```text
//!   dispatch(name, slices) ──> BatchState { take-once cells, result slots }
//!         │
//!         ├─ cost model ──> p jobs, each running its slices under a limiter token
//!         │
//!         ├─ accelerated hint? ──> accelerator ──err / deadline──┐
//!         │                                                      ▼
//!         └────────────────────────────────────────────> CPU backend
//!                                                          │ CapacityExceeded
//!                                    timer: retry after base × (attempt + 1)
//!                                                          │ retries exhausted
//!                                                          ▼
//!                                             sequential fallback lane
//! ```
//!
//! ## Exactly once
//!
//! Each slice closure sits in a take-once cell. Jobs are cheap views over the
//! batch state, so a rejected submission can be rebuilt and resubmitted
//! without any closure running twice.
//!
//! ## Completion
//!
//! The batch handle resolves once every slice has finished. On success it
//! holds the results in slice order; otherwise it holds the first slice error
//! observed.

use std::collections::HashMap;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_cache::{CacheBackend, PutOptions};
use strata_core::{
    completion, panic_message, AdaptiveConcurrencyLimiter, Clock, Completer, CompletionHandle,
    DispatchConfig, LogThrottle, SharedClock, SliceError, StrataError, StrataResult,
    SystemClock, Timer,
};

use crate::accelerator::{AcceleratedWorkload, AcceleratorProbe, AcceleratorSlot, NoAccelerator};
use crate::backend::{BackendError, BatchMeta, ExecutionBackend, Job, ResourceHint};
use crate::cost::CostModel;
use crate::fallback::FallbackLane;

/// A slice closure.
pub type SliceFn<T> = Box<dyn FnOnce() -> Result<T, SliceError> + Send + 'static>;

/// Handle to a dispatched batch. Blocking (`wait`) or `.await`able.
pub type BatchHandle<T> = CompletionHandle<StrataResult<Vec<T>>>;

/// Per-slice completion callback: `(slice index, result)`.
pub type SliceCallback<T> = Arc<dyn Fn(usize, &T) + Send + Sync>;

/// Maps a slice index to its cache key.
pub type SliceKeyFn = Arc<dyn Fn(usize) -> String + Send + Sync>;

const DEFAULT_NAMESPACE: &str = "default";

/// Per-dispatch options.
pub struct DispatchOptions<T> {
    namespace: String,
    accelerated: Option<AcceleratedWorkload>,
    on_slice_complete: Option<SliceCallback<T>>,
}

impl<T> Default for DispatchOptions<T> {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            accelerated: None,
            on_slice_complete: None,
        }
    }
}

impl<T> DispatchOptions<T> {
    /// Options with the default namespace, CPU placement and no callback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the namespace reported to the backend.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Hints that the batch should run on the accelerator if one exists.
    #[must_use]
    pub fn accelerated(mut self, workload: AcceleratedWorkload) -> Self {
        self.accelerated = Some(workload);
        self
    }

    /// Called once per successful slice, as it finishes, on the executing thread.
    #[must_use]
    pub fn on_slice_complete(mut self, callback: impl Fn(usize, &T) + Send + Sync + 'static) -> Self {
        self.on_slice_complete = Some(Arc::new(callback));
        self
    }
}

/// Slice-level result caching for [`ParallelDispatcher::dispatch_cached`].
#[derive(Clone)]
pub struct SliceCacheOptions {
    key: SliceKeyFn,
    put: PutOptions,
}

impl SliceCacheOptions {
    /// In-memory caching with `ttl` and at most `max_entries` per batch name.
    pub fn memory(key: impl Fn(usize) -> String + Send + Sync + 'static, ttl: Duration, max_entries: usize) -> Self {
        Self {
            key: Arc::new(key),
            put: PutOptions::memory(ttl, max_entries),
        }
    }

    /// Compressed persistent caching.
    pub fn persistent(
        key: impl Fn(usize) -> String + Send + Sync + 'static,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            key: Arc::new(key),
            put: PutOptions::persistent(ttl, max_entries),
        }
    }

    /// Storage options applied to each put.
    #[must_use]
    pub const fn put_options(&self) -> &PutOptions {
        &self.put
    }
}

impl std::fmt::Debug for SliceCacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceCacheOptions")
            .field("put", &self.put)
            .finish_non_exhaustive()
    }
}

/// A batch in flight, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBatch {
    /// Sequence number.
    pub seq: u64,
    /// Batch kind.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Slices in the batch, cache hits excluded.
    pub slice_count: usize,
    /// Submission time in clock milliseconds.
    pub submitted_at_ms: u64,
}

/// Counters since the dispatcher was built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Batches dispatched.
    pub submitted: u64,
    /// Batches resolved with results.
    pub completed: u64,
    /// Batches resolved with an error.
    pub failed: u64,
    /// Saturation rejections from the CPU backend.
    pub saturations: u64,
    /// Whole-batch retries scheduled.
    pub retries: u64,
    /// Batches sent to the sequential fallback lane.
    pub fallbacks: u64,
    /// Batches accepted by the accelerator.
    pub accelerated: u64,
    /// Accelerator-hinted batches that ran on CPU instead.
    pub accelerator_fallbacks: u64,
    /// Slices served from the slice cache.
    pub cache_hits: u64,
    /// Slices that missed the slice cache.
    pub cache_misses: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    saturations: AtomicU64,
    retries: AtomicU64,
    fallbacks: AtomicU64,
    accelerated: AtomicU64,
    accelerator_fallbacks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DispatchStats {
            submitted: load(&self.submitted),
            completed: load(&self.completed),
            failed: load(&self.failed),
            saturations: load(&self.saturations),
            retries: load(&self.retries),
            fallbacks: load(&self.fallbacks),
            accelerated: load(&self.accelerated),
            accelerator_fallbacks: load(&self.accelerator_fallbacks),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
        }
    }
}

struct Inner {
    config: DispatchConfig,
    backend: Arc<dyn ExecutionBackend>,
    accelerator: AcceleratorSlot,
    limiter: Arc<AdaptiveConcurrencyLimiter>,
    cache: Option<Arc<dyn CacheBackend>>,
    timer: Arc<Timer>,
    fallback: FallbackLane,
    cost: CostModel,
    clock: SharedClock,
    saturation_log: LogThrottle,
    next_seq: AtomicU64,
    active: AtomicUsize,
    pending: DashMap<u64, PendingBatch>,
    counters: Counters,
}

/// Slice cell: either a closure still to run or a value already known.
enum SliceEntry<T> {
    Run(SliceFn<T>),
    Ready(T),
}

struct BatchState<T> {
    meta: BatchMeta,
    cells: Vec<Mutex<Option<SliceFn<T>>>>,
    /// Indices whose closure has to run, in slice order.
    to_run: Vec<usize>,
    results: Mutex<Vec<Option<T>>>,
    first_error: Mutex<Option<StrataError>>,
    remaining: AtomicUsize,
    exec_nanos: AtomicU64,
    finished: AtomicBool,
    on_slice_complete: Option<SliceCallback<T>>,
    /// Writes fresh results to the slice cache.
    store: Option<SliceCallback<T>>,
    completer: Mutex<Option<Completer<StrataResult<Vec<T>>>>>,
    inner: Arc<Inner>,
}

impl<T> Drop for BatchState<T> {
    /// A batch whose jobs were all dropped unrun (timer or backend shut down)
    /// resolves as shut down rather than leaving its handle pending.
    fn drop(&mut self) {
        if *self.finished.get_mut() {
            return;
        }
        self.inner.pending.remove(&self.meta.seq);
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        Counters::bump(&self.inner.counters.failed);
        if let Some(completer) = self.completer.get_mut().take() {
            completer.complete(Err(StrataError::ShutDown));
        }
    }
}

/// Fan-out/fan-in batch executor. Cheap to clone.
#[derive(Clone)]
pub struct ParallelDispatcher {
    inner: Arc<Inner>,
}

/// Builder for [`ParallelDispatcher`].
pub struct DispatcherBuilder {
    config: DispatchConfig,
    backend: Arc<dyn ExecutionBackend>,
    limiter: Option<Arc<AdaptiveConcurrencyLimiter>>,
    cache: Option<Arc<dyn CacheBackend>>,
    timer: Option<Arc<Timer>>,
    clock: Option<SharedClock>,
    probe: Box<dyn AcceleratorProbe>,
}

impl DispatcherBuilder {
    /// Limiter gating job execution. Defaults to one sized by `max_parallelism`.
    #[must_use]
    pub fn limiter(mut self, limiter: Arc<AdaptiveConcurrencyLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Cache used by `dispatch_cached`.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Timer for saturation backoff. Defaults to a private timer thread.
    #[must_use]
    pub fn timer(mut self, timer: Arc<Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Clock for diagnostics and log throttling.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Accelerator probe, run once by `build`.
    #[must_use]
    pub fn accelerator_probe(mut self, probe: impl AcceleratorProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Resolves the accelerator and starts the fallback lane.
    #[must_use]
    pub fn build(self) -> ParallelDispatcher {
        let limiter = self.limiter.unwrap_or_else(|| {
            AdaptiveConcurrencyLimiter::new(
                self.config.max_parallelism,
                1,
                self.config.max_parallelism.max(1),
            )
        });
        let timer = self.timer.unwrap_or_else(|| Timer::start("strata-dispatch-timer"));
        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let saturation_log = LogThrottle::new(self.config.saturation_log_interval_ms);

        ParallelDispatcher {
            inner: Arc::new(Inner {
                accelerator: AcceleratorSlot::resolve(self.probe.as_ref()),
                backend: self.backend,
                limiter,
                cache: self.cache,
                timer,
                fallback: FallbackLane::start("strata-fallback"),
                cost: CostModel::new(),
                clock,
                saturation_log,
                next_seq: AtomicU64::new(1),
                active: AtomicUsize::new(0),
                pending: DashMap::new(),
                counters: Counters::default(),
                config: self.config,
            }),
        }
    }
}

impl ParallelDispatcher {
    /// Starts building a dispatcher over `backend`.
    #[must_use]
    pub fn builder(config: DispatchConfig, backend: Arc<dyn ExecutionBackend>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            backend,
            limiter: None,
            cache: None,
            timer: None,
            clock: None,
            probe: Box::new(NoAccelerator),
        }
    }

    /// Runs `slices` and resolves with their results in slice order.
    pub fn dispatch<T, F>(&self, name: &str, slices: Vec<F>, options: DispatchOptions<T>) -> BatchHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, SliceError> + Send + 'static,
    {
        let entries = slices
            .into_iter()
            .map(|f| SliceEntry::Run(Box::new(f) as SliceFn<T>))
            .collect();
        self.launch(name, entries, options, None)
    }

    /// Like [`dispatch`](Self::dispatch), consulting the slice cache first.
    ///
    /// Hits skip their closure; misses are stored (bincode) as they finish.
    /// Without a configured cache this is a plain dispatch.
    pub fn dispatch_cached<T, F>(
        &self,
        name: &str,
        slices: Vec<F>,
        options: DispatchOptions<T>,
        cache_options: &SliceCacheOptions,
    ) -> BatchHandle<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Result<T, SliceError> + Send + 'static,
    {
        let Some(cache) = self.inner.cache.clone() else {
            tracing::debug!(batch = name, "no slice cache configured; dispatching uncached");
            return self.dispatch(name, slices, options);
        };

        let mut entries = Vec::with_capacity(slices.len());
        let (mut hits, mut misses) = (0u64, 0u64);
        for (index, slice) in slices.into_iter().enumerate() {
            let key = (cache_options.key)(index);
            match lookup::<T>(cache.as_ref(), name, &key) {
                Some(value) => {
                    hits += 1;
                    entries.push(SliceEntry::Ready(value));
                }
                None => {
                    misses += 1;
                    entries.push(SliceEntry::Run(Box::new(slice) as SliceFn<T>));
                }
            }
        }
        self.inner.counters.cache_hits.fetch_add(hits, Ordering::Relaxed);
        self.inner.counters.cache_misses.fetch_add(misses, Ordering::Relaxed);
        tracing::trace!(batch = name, hits, misses, "slice cache consulted");

        let batch = name.to_string();
        let key_fn = Arc::clone(&cache_options.key);
        let put = cache_options.put.clone();
        let store: SliceCallback<T> = Arc::new(move |index, value: &T| match bincode::serialize(value) {
            Ok(bytes) => {
                if let Err(e) = cache.put(&batch, &key_fn(index), bytes, &put) {
                    tracing::debug!(batch = %batch, index, error = %e, "slice cache put failed");
                }
            }
            Err(e) => {
                tracing::debug!(batch = %batch, index, error = %e, "slice value not cacheable");
            }
        });

        self.launch(name, entries, options, Some(store))
    }

    fn launch<T: Send + 'static>(
        &self,
        name: &str,
        entries: Vec<SliceEntry<T>>,
        options: DispatchOptions<T>,
        store: Option<SliceCallback<T>>,
    ) -> BatchHandle<T> {
        let inner = &self.inner;
        let (completer, handle) = completion();
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        Counters::bump(&inner.counters.submitted);

        let slice_total = entries.len();
        let mut cells = Vec::with_capacity(slice_total);
        let mut results = Vec::with_capacity(slice_total);
        let mut to_run = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                SliceEntry::Run(f) => {
                    to_run.push(index);
                    cells.push(Mutex::new(Some(f)));
                    results.push(None);
                }
                SliceEntry::Ready(value) => {
                    if let Some(callback) = &options.on_slice_complete {
                        notify(callback, name, index, &value);
                    }
                    cells.push(Mutex::new(None));
                    results.push(Some(value));
                }
            }
        }

        let hint = options
            .accelerated
            .map_or(ResourceHint::Cpu, ResourceHint::Accelerated);
        let meta = BatchMeta {
            namespace: options.namespace,
            name: name.to_string(),
            seq,
            slice_count: to_run.len(),
            hint,
        };

        if to_run.is_empty() {
            let values = results.into_iter().flatten().collect();
            Counters::bump(&inner.counters.completed);
            completer.complete(Ok(values));
            return handle;
        }

        inner.active.fetch_add(1, Ordering::AcqRel);
        inner.pending.insert(
            seq,
            PendingBatch {
                seq,
                name: meta.name.clone(),
                namespace: meta.namespace.clone(),
                slice_count: meta.slice_count,
                submitted_at_ms: inner.clock.now_millis(),
            },
        );

        let state = Arc::new(BatchState {
            remaining: AtomicUsize::new(to_run.len()),
            meta,
            cells,
            to_run,
            results: Mutex::new(results),
            first_error: Mutex::new(None),
            exec_nanos: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            on_slice_complete: options.on_slice_complete,
            store,
            completer: Mutex::new(Some(completer)),
            inner: Arc::clone(inner),
        });
        submit(&state, 0);
        handle
    }

    /// Batches dispatched but not yet resolved.
    #[must_use]
    pub fn active_batches(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Concurrent batches producers should stay under.
    #[must_use]
    pub fn max_concurrent_batches(&self) -> usize {
        self.inner.config.max_concurrent_batches
    }

    /// Whether another batch fits under `max_concurrent_batches`.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.active_batches() < self.max_concurrent_batches()
    }

    /// In-flight batch count per batch name.
    #[must_use]
    pub fn pending_by_kind(&self) -> HashMap<String, usize> {
        let mut by_kind = HashMap::new();
        for entry in &self.inner.pending {
            *by_kind.entry(entry.name.clone()).or_insert(0) += 1;
        }
        by_kind
    }

    /// In-flight batches, oldest first.
    #[must_use]
    pub fn pending_batches(&self) -> Vec<PendingBatch> {
        let mut batches: Vec<PendingBatch> =
            self.inner.pending.iter().map(|e| e.value().clone()).collect();
        batches.sort_by_key(|b| b.seq);
        batches
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.inner.counters.snapshot()
    }

    /// Average slice cost for `name`, once measured.
    #[must_use]
    pub fn cost_estimate(&self, name: &str) -> Option<Duration> {
        self.inner.cost.estimate_nanos(name).map(Duration::from_nanos)
    }

    /// The limiter gating job execution.
    #[must_use]
    pub fn limiter(&self) -> &Arc<AdaptiveConcurrencyLimiter> {
        &self.inner.limiter
    }

    /// Whether an accelerator was resolved at build time.
    #[must_use]
    pub fn has_accelerator(&self) -> bool {
        self.inner.accelerator.is_present()
    }

    /// Stops the fallback lane once its queued batches have run.
    ///
    /// Batches that saturate afterwards fail with `StrataError::ShutDown`.
    pub fn shutdown(&self) {
        self.inner.fallback.shutdown();
    }
}

impl std::fmt::Debug for ParallelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDispatcher")
            .field("backend", &self.inner.backend.name())
            .field("accelerator", &self.inner.accelerator)
            .field("active", &self.active_batches())
            .finish_non_exhaustive()
    }
}

fn lookup<T: DeserializeOwned>(cache: &dyn CacheBackend, namespace: &str, key: &str) -> Option<T> {
    match cache.get(namespace, key) {
        Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(namespace, key, error = %e, "undecodable slice cache entry");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(namespace, key, error = %e, "slice cache lookup failed");
            None
        }
    }
}

fn notify<T>(callback: &SliceCallback<T>, batch: &str, index: usize, value: &T) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(index, value))) {
        tracing::warn!(
            batch,
            index,
            panic = %panic_message(payload.as_ref()),
            "slice completion callback panicked"
        );
    }
}

/// Splits `to_run` into `parallelism` contiguous chunks.
fn chunk_ranges(len: usize, parallelism: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let parallelism = parallelism.clamp(1, len);
    let base = len / parallelism;
    let extra = len % parallelism;
    let mut ranges = Vec::with_capacity(parallelism);
    let mut start = 0;
    for i in 0..parallelism {
        let size = base + usize::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

fn make_jobs<T: Send + 'static>(state: &Arc<BatchState<T>>) -> Vec<Job> {
    let inner = &state.inner;
    let parallelism = inner
        .cost
        .parallelism_for(&state.meta.name, state.to_run.len(), &inner.config);
    chunk_ranges(state.to_run.len(), parallelism)
        .into_iter()
        .map(|range| {
            let state = Arc::clone(state);
            Box::new(move || {
                let _token = state.inner.limiter.enter();
                for &index in &state.to_run[range] {
                    run_slice(&state, index);
                }
            }) as Job
        })
        .collect()
}

fn submit<T: Send + 'static>(state: &Arc<BatchState<T>>, attempt: u32) {
    let inner = &state.inner;

    if let ResourceHint::Accelerated(workload) = &state.meta.hint {
        if attempt == 0 {
            match inner.accelerator.get() {
                Some(accelerator) => {
                    let timeout = inner.config.accelerator_timeout();
                    match accelerator.submit(&state.meta, workload, make_jobs(state), timeout) {
                        Ok(()) => {
                            inner.accelerator.note_accepted();
                            Counters::bump(&inner.counters.accelerated);
                            watch_accelerator(state, timeout);
                            return;
                        }
                        Err(e) => {
                            Counters::bump(&inner.counters.accelerator_fallbacks);
                            inner.accelerator.note_fallback(&state.meta.name, &e.to_string());
                        }
                    }
                }
                None => {
                    Counters::bump(&inner.counters.accelerator_fallbacks);
                    inner.accelerator.note_fallback(&state.meta.name, "no accelerator resolved");
                }
            }
        }
    }

    submit_cpu(state, attempt);
}

/// Sends whatever the accelerator has not started to the CPU backend once
/// `timeout` passes with the batch unfinished. Taken cells are skipped, so no
/// slice runs twice.
fn watch_accelerator<T: Send + 'static>(state: &Arc<BatchState<T>>, timeout: Duration) {
    let watched = Arc::clone(state);
    let scheduled = state.inner.timer.schedule(timeout, move || {
        if watched.finished.load(Ordering::Acquire) {
            return;
        }
        let inner = &watched.inner;
        Counters::bump(&inner.counters.accelerator_fallbacks);
        inner
            .accelerator
            .note_fallback(&watched.meta.name, "accelerator execution timed out");
        submit_cpu(&watched, 0);
    });
    if !scheduled {
        tracing::debug!(batch = %state.meta.name, "timer stopped; accelerated batch unwatched");
    }
}

fn submit_cpu<T: Send + 'static>(state: &Arc<BatchState<T>>, attempt: u32) {
    let inner = &state.inner;
    match inner.backend.try_submit(&state.meta, make_jobs(state)) {
        Ok(()) => {}
        Err(e) if e.is_capacity() => saturated(state, attempt, &e),
        Err(e) => {
            tracing::warn!(batch = %state.meta.name, seq = state.meta.seq, error = %e, "batch rejected");
            fail(
                state,
                StrataError::ExecutionFailed {
                    batch: state.meta.name.clone(),
                    reason: e.to_string(),
                },
            );
        }
    }
}

fn saturated<T: Send + 'static>(state: &Arc<BatchState<T>>, attempt: u32, error: &BackendError) {
    let inner = &state.inner;
    Counters::bump(&inner.counters.saturations);
    if let Some(suppressed) = inner.saturation_log.check(inner.clock.now_millis()) {
        tracing::warn!(
            batch = %state.meta.name,
            attempt,
            suppressed,
            error = %error,
            "execution backend saturated"
        );
    }

    if attempt < inner.config.saturation_retries {
        let delay = inner.config.saturation_base_delay() * (attempt + 1);
        let retry = Arc::clone(state);
        if inner.timer.schedule(delay, move || submit(&retry, attempt + 1)) {
            Counters::bump(&inner.counters.retries);
            return;
        }
    }

    Counters::bump(&inner.counters.fallbacks);
    tracing::debug!(batch = %state.meta.name, seq = state.meta.seq, "running batch on fallback lane");
    let sequential = Arc::clone(state);
    let job: Job = Box::new(move || {
        for &index in &sequential.to_run {
            run_slice(&sequential, index);
        }
    });
    if inner.fallback.run(job).is_err() {
        fail(state, StrataError::ShutDown);
    }
}

fn run_slice<T: Send + 'static>(state: &Arc<BatchState<T>>, index: usize) {
    let Some(slice) = state.cells[index].lock().take() else {
        return;
    };

    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(slice))
        .unwrap_or_else(|payload| Err(SliceError::from_panic(payload.as_ref())));
    let elapsed = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
    state.exec_nanos.fetch_add(elapsed, Ordering::Relaxed);

    match outcome {
        Ok(value) => {
            if let Some(store) = &state.store {
                notify(store, &state.meta.name, index, &value);
            }
            if let Some(callback) = &state.on_slice_complete {
                notify(callback, &state.meta.name, index, &value);
            }
            state.results.lock()[index] = Some(value);
        }
        Err(source) => {
            tracing::debug!(batch = %state.meta.name, index, error = %source, "slice failed");
            let mut first = state.first_error.lock();
            if first.is_none() {
                *first = Some(StrataError::SliceFailed {
                    batch: state.meta.name.clone(),
                    index,
                    source,
                });
            }
        }
    }

    if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        finish(state);
    }
}

fn finish<T: Send + 'static>(state: &Arc<BatchState<T>>) {
    let result = match state.first_error.lock().take() {
        Some(error) => Err(error),
        None => {
            let slots = std::mem::take(&mut *state.results.lock());
            slots.into_iter().collect::<Option<Vec<T>>>().ok_or_else(|| {
                StrataError::ExecutionFailed {
                    batch: state.meta.name.clone(),
                    reason: "slice result missing".to_string(),
                }
            })
        }
    };

    if result.is_ok() {
        state.inner.cost.record(
            &state.meta.name,
            Duration::from_nanos(state.exec_nanos.load(Ordering::Relaxed)),
            state.to_run.len(),
        );
    }
    resolve(state, result);
}

fn fail<T: Send + 'static>(state: &Arc<BatchState<T>>, error: StrataError) {
    resolve(state, Err(error));
}

fn resolve<T: Send + 'static>(state: &Arc<BatchState<T>>, result: StrataResult<Vec<T>>) {
    if state.finished.swap(true, Ordering::AcqRel) {
        return;
    }
    let inner = &state.inner;
    inner.pending.remove(&state.meta.seq);
    inner.active.fetch_sub(1, Ordering::AcqRel);
    if result.is_ok() {
        Counters::bump(&inner.counters.completed);
    } else {
        Counters::bump(&inner.counters.failed);
    }

    let completer = state.completer.lock().take();
    if let Some(completer) = completer {
        completer.complete(result);
    }
}
