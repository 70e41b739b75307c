//! # Main-Thread Integration Queue
//!
//! Hands finished background work back to the host's tick thread.
//!
//! ```text
//!   workers ──submit──> [ MPMC channel ] ──drain (tick end)──> host thread
//!                             │
//!                             └─ len ≥ threshold ──> HostScheduler::schedule_on_main
//!                                                    (fast-path drain, rate limited)
//! ```
//!
//! ## Drain Rules
//!
//! A drain runs tasks in submission order and stops at the first of:
//! the task limit, the time budget, or host backpressure
//! (`is_tick_over_budget`). Backpressure is checked before every task, so an
//! already over-budget tick drains nothing. Panicking tasks are logged and
//! counted; the drain continues.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use strata_core::{panic_message, Clock, MainThreadConfig, SharedClock, StateLatch, SystemClock};

/// Minimum intervals after which an accepted fast-path drain that never ran
/// stops blocking new requests.
const STALE_FAST_PATH_INTERVALS: u64 = 4;

/// A task to run on the host thread.
pub type MainTask = Box<dyn FnOnce() + Send + 'static>;

/// The host's tick loop, as seen by the queue.
pub trait HostScheduler: Send + Sync {
    /// Runs `task` on the host thread soon, outside the regular tick-end
    /// drain. Returns false if the host cannot take it right now.
    fn schedule_on_main(&self, task: MainTask) -> bool;

    /// Whether the current tick has already spent its budget.
    fn is_tick_over_budget(&self) -> bool;
}

/// Why a drain stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The queue ran dry.
    Empty,
    /// The per-drain task limit was reached.
    TaskLimit,
    /// The time budget was spent.
    TimeBudget,
    /// The host reported its tick over budget.
    Backpressure,
    /// Another drain was already running.
    Busy,
}

/// Outcome of one drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks run, panicking ones included.
    pub executed: usize,
    /// Tasks that panicked.
    pub failed: usize,
    /// Tasks left in the queue.
    pub remaining: usize,
    /// Why the drain stopped.
    pub stop: StopReason,
    /// Time spent draining.
    pub elapsed: Duration,
}

/// Counters since the queue was created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks submitted.
    pub submitted: u64,
    /// Tasks run.
    pub executed: u64,
    /// Tasks that panicked.
    pub failed: u64,
    /// Drains performed, fast-path drains included.
    pub drains: u64,
    /// Fast-path drains requested from the host.
    pub fast_path_requests: u64,
    /// Fast-path requests the host refused.
    pub fast_path_rejections: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    drains: AtomicU64,
    fast_path_requests: AtomicU64,
    fast_path_rejections: AtomicU64,
}

struct QueueInner {
    config: MainThreadConfig,
    sender: Sender<MainTask>,
    receiver: Receiver<MainTask>,
    host: RwLock<Option<Arc<dyn HostScheduler>>>,
    clock: SharedClock,
    drain_lock: Mutex<()>,
    fast_path_in_flight: AtomicBool,
    /// Clock millis of the last accepted fast-path request, plus one.
    last_fast_path: AtomicU64,
    host_refusing: StateLatch,
    counters: Counters,
}

/// Multi-producer, single-consumer hand-off to the host thread. Cheap to clone.
#[derive(Clone)]
pub struct MainThreadIntegrationQueue {
    inner: Arc<QueueInner>,
}

impl MainThreadIntegrationQueue {
    /// Creates a queue without a host scheduler; only tick-end drains run.
    #[must_use]
    pub fn new(config: MainThreadConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Like [`new`](Self::new) with an explicit clock for the fast-path rate limit.
    #[must_use]
    pub fn with_clock(config: MainThreadConfig, clock: SharedClock) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            inner: Arc::new(QueueInner {
                config,
                sender,
                receiver,
                host: RwLock::new(None),
                clock,
                drain_lock: Mutex::new(()),
                fast_path_in_flight: AtomicBool::new(false),
                last_fast_path: AtomicU64::new(0),
                host_refusing: StateLatch::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Attaches the host scheduler used for fast-path drains.
    pub fn set_host(&self, host: Arc<dyn HostScheduler>) {
        *self.inner.host.write() = Some(host);
    }

    /// Queues `task` for the host thread. Never blocks, never fails.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let inner = &self.inner;
        if inner.sender.send(Box::new(task)).is_err() {
            // The receiver lives as long as the sender; unreachable in practice.
            return;
        }
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if inner.receiver.len() >= inner.config.fast_path_threshold {
            inner.request_fast_path();
        }
    }

    /// Tick-end drain under the configured budget.
    pub fn drain(&self) -> DrainReport {
        self.inner.drain_for(self.inner.config.drain_budget())
    }

    /// Drain with an explicit time budget.
    pub fn drain_with_budget(&self, budget: Duration) -> DrainReport {
        self.inner.drain_for(budget)
    }

    /// Tasks waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Whether no task is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.receiver.is_empty()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        QueueStats {
            submitted: load(&c.submitted),
            executed: load(&c.executed),
            failed: load(&c.failed),
            drains: load(&c.drains),
            fast_path_requests: load(&c.fast_path_requests),
            fast_path_rejections: load(&c.fast_path_rejections),
        }
    }
}

impl std::fmt::Debug for MainThreadIntegrationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadIntegrationQueue")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl QueueInner {
    fn drain_for(&self, budget: Duration) -> DrainReport {
        let started = Instant::now();
        let Some(_guard) = self.drain_lock.try_lock() else {
            return DrainReport {
                executed: 0,
                failed: 0,
                remaining: self.receiver.len(),
                stop: StopReason::Busy,
                elapsed: started.elapsed(),
            };
        };

        let host = self.host.read().clone();
        let mut executed = 0;
        let mut failed = 0;
        let stop = loop {
            if executed >= self.config.max_tasks_per_drain {
                break StopReason::TaskLimit;
            }
            if started.elapsed() >= budget {
                break StopReason::TimeBudget;
            }
            if host.as_ref().is_some_and(|h| h.is_tick_over_budget()) {
                break StopReason::Backpressure;
            }
            let Ok(task) = self.receiver.try_recv() else {
                break StopReason::Empty;
            };

            executed += 1;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                failed += 1;
                tracing::warn!(panic = %panic_message(payload.as_ref()), "main-thread task panicked");
            }
        };

        self.counters.drains.fetch_add(1, Ordering::Relaxed);
        self.counters.executed.fetch_add(executed as u64, Ordering::Relaxed);
        self.counters.failed.fetch_add(failed as u64, Ordering::Relaxed);

        let report = DrainReport {
            executed,
            failed,
            remaining: self.receiver.len(),
            stop,
            elapsed: started.elapsed(),
        };
        if executed > 0 {
            tracing::trace!(executed, remaining = report.remaining, stop = ?stop, "main-thread drain");
        }
        report
    }

    fn request_fast_path(self: &Arc<Self>) {
        let Some(host) = self.host.read().clone() else {
            return;
        };
        let now = self.clock.now_millis();
        let last = self.last_fast_path.load(Ordering::Acquire);
        if self.fast_path_in_flight.swap(true, Ordering::AcqRel) {
            // A host may accept the drain and never run it; re-arm once the
            // accepted request is stale.
            let stale_after = self
                .config
                .fast_path_min_interval_ms
                .saturating_mul(STALE_FAST_PATH_INTERVALS)
                .max(1);
            if last == 0 || now.saturating_sub(last - 1) < stale_after {
                return;
            }
            tracing::debug!(stale_ms = now.saturating_sub(last - 1), "fast-path drain never ran; re-arming");
        }

        if last != 0 && now.saturating_sub(last - 1) < self.config.fast_path_min_interval_ms {
            self.fast_path_in_flight.store(false, Ordering::Release);
            return;
        }

        self.counters.fast_path_requests.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let accepted = host.schedule_on_main(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.drain_for(inner.config.fast_path_budget());
                inner.fast_path_in_flight.store(false, Ordering::Release);
            }
        }));

        if accepted {
            self.last_fast_path.store(now.saturating_add(1), Ordering::Release);
            if self.host_refusing.clear() {
                tracing::debug!("host accepting fast-path drains again");
            }
        } else {
            self.counters.fast_path_rejections.fetch_add(1, Ordering::Relaxed);
            self.fast_path_in_flight.store(false, Ordering::Release);
            if self.host_refusing.enter() {
                tracing::debug!("host not ready for fast-path drains; relying on tick-end drain");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Host {
        over_budget: AtomicBool,
        accept: AtomicBool,
        scheduled: Mutex<Vec<MainTask>>,
    }

    impl Host {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                over_budget: AtomicBool::new(false),
                accept: AtomicBool::new(accept),
                scheduled: Mutex::new(Vec::new()),
            })
        }

        fn run_scheduled(&self) -> usize {
            let tasks: Vec<MainTask> = self.scheduled.lock().drain(..).collect();
            let count = tasks.len();
            for task in tasks {
                task();
            }
            count
        }
    }

    impl HostScheduler for Host {
        fn schedule_on_main(&self, task: MainTask) -> bool {
            if !self.accept.load(Ordering::SeqCst) {
                return false;
            }
            self.scheduled.lock().push(task);
            true
        }

        fn is_tick_over_budget(&self) -> bool {
            self.over_budget.load(Ordering::SeqCst)
        }
    }

    fn config() -> MainThreadConfig {
        MainThreadConfig {
            max_tasks_per_drain: 4,
            drain_budget_us: 1_000_000,
            fast_path_threshold: 3,
            fast_path_min_interval_ms: 10,
            fast_path_budget_us: 1_000_000,
        }
    }

    #[test]
    fn test_drain_is_fifo_and_capped() {
        let queue = MainThreadIntegrationQueue::new(config());
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..6 {
            let order = Arc::clone(&order);
            queue.submit(move || order.lock().push(i));
        }

        let first = queue.drain();
        assert_eq!(first.executed, 4);
        assert_eq!(first.stop, StopReason::TaskLimit);
        assert_eq!(first.remaining, 2);

        let second = queue.drain();
        assert_eq!(second.executed, 2);
        assert_eq!(second.stop, StopReason::Empty);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_backpressure_stops_before_first_task() {
        let queue = MainThreadIntegrationQueue::new(config());
        let host = Host::new(false);
        host.over_budget.store(true, Ordering::SeqCst);
        queue.set_host(host);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let report = queue.drain();
        assert_eq!(report.executed, 0);
        assert_eq!(report.stop, StopReason::Backpressure);
        assert_eq!(report.remaining, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_does_not_halt_drain() {
        let queue = MainThreadIntegrationQueue::new(config());
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        queue.submit(|| panic!("integration failure"));
        queue.submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let report = queue.drain();
        assert_eq!(report.executed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().failed, 1);
    }

    #[test]
    fn test_fast_path_is_coalesced_and_rate_limited() {
        let clock = strata_core::ManualClock::new();
        let queue = MainThreadIntegrationQueue::with_clock(config(), clock.clone());
        let host = Host::new(true);
        queue.set_host(Arc::clone(&host) as Arc<dyn HostScheduler>);

        for _ in 0..5 {
            queue.submit(|| {});
        }
        // Threshold reached at the third submit; later submits coalesce.
        assert_eq!(queue.stats().fast_path_requests, 1);
        assert_eq!(host.run_scheduled(), 1);
        assert_eq!(queue.len(), 1);

        // Within the minimum interval: no new request.
        for _ in 0..3 {
            queue.submit(|| {});
        }
        assert_eq!(queue.stats().fast_path_requests, 1);

        clock.advance(Duration::from_millis(10));
        queue.submit(|| {});
        assert_eq!(queue.stats().fast_path_requests, 2);
        assert_eq!(host.run_scheduled(), 1);
        // Five waiting, the fast-path drain is capped at four tasks.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_dropped_fast_path_rearms_when_stale() {
        let clock = strata_core::ManualClock::new();
        let queue = MainThreadIntegrationQueue::with_clock(config(), clock.clone());
        let host = Host::new(true);
        queue.set_host(Arc::clone(&host) as Arc<dyn HostScheduler>);

        for _ in 0..3 {
            queue.submit(|| {});
        }
        assert_eq!(queue.stats().fast_path_requests, 1);
        // The host loses the scheduled drain.
        host.scheduled.lock().clear();

        clock.advance(Duration::from_millis(39));
        queue.submit(|| {});
        assert_eq!(queue.stats().fast_path_requests, 1);

        clock.advance(Duration::from_millis(1));
        queue.submit(|| {});
        assert_eq!(queue.stats().fast_path_requests, 2);
        assert_eq!(host.run_scheduled(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_refused_fast_path_degrades_to_tick_drain() {
        let queue = MainThreadIntegrationQueue::new(config());
        queue.set_host(Host::new(false));
        for _ in 0..3 {
            queue.submit(|| {});
        }
        let stats = queue.stats();
        assert_eq!(stats.fast_path_requests, 1);
        assert_eq!(stats.fast_path_rejections, 1);
        assert_eq!(queue.drain().executed, 3);
    }
}
