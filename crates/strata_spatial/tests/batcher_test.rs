//! Integration tests for the spatial work batcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_core::{BatcherConfig, Clock, DispatchConfig, ManualClock, SliceError, StrataResult, Timer};
use strata_dispatch::{
    AcceleratedWorkload, Accelerator, BackendError, BatchMeta, DispatchOptions, Job,
    ParallelDispatcher, WorkerPoolBackend,
};
use strata_spatial::{
    RegionKey, ScheduleContext, ScheduleDecision, SpatialWorkBatcher, UnitPos, UnitWork,
};

#[derive(Default)]
struct Recorder {
    units: Mutex<Vec<UnitPos>>,
    batches: AtomicUsize,
    regions: AtomicUsize,
}

impl UnitWork for Recorder {
    type Output = i64;

    fn run(&self, _region: RegionKey, unit: UnitPos) -> Result<i64, SliceError> {
        self.units.lock().push(unit);
        Ok(i64::from(unit.x) * 31 + i64::from(unit.z))
    }

    fn on_batch_complete(&self, regions: &[RegionKey], result: &StrataResult<Vec<i64>>) {
        assert!(result.is_ok());
        self.regions.fetch_add(regions.len(), Ordering::SeqCst);
        self.batches.fetch_add(1, Ordering::SeqCst);
    }
}

struct Ctx {
    namespace: u32,
    accelerated: bool,
}

impl ScheduleContext for Ctx {
    fn namespace(&self) -> u32 {
        self.namespace
    }

    fn has_accelerator(&self) -> bool {
        self.accelerated
    }
}

const CPU: Ctx = Ctx {
    namespace: 0,
    accelerated: false,
};

const GPU: Ctx = Ctx {
    namespace: 0,
    accelerated: true,
};

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn dispatcher(config: DispatchConfig, timer: &Arc<Timer>) -> ParallelDispatcher {
    ParallelDispatcher::builder(config, Arc::new(WorkerPoolBackend::new("batcher-pool", 4, 512)))
        .timer(Arc::clone(timer))
        .build()
}

struct Harness {
    batcher: SpatialWorkBatcher<Recorder>,
    work: Arc<Recorder>,
    clock: Arc<ManualClock>,
    dispatcher: ParallelDispatcher,
}

fn harness(config: BatcherConfig, dispatch: DispatchConfig) -> Harness {
    let timer = Timer::start("batcher-test-timer");
    let dispatcher = dispatcher(dispatch, &timer);
    let clock = ManualClock::new();
    let work = Arc::new(Recorder::default());
    let batcher = SpatialWorkBatcher::with_clock(
        "terrain",
        config,
        Arc::clone(&work),
        dispatcher.clone(),
        timer,
        clock.clone(),
    );
    Harness {
        batcher,
        work,
        clock,
        dispatcher,
    }
}

fn slow_flush() -> BatcherConfig {
    BatcherConfig {
        debounce_ms: 60_000,
        ..BatcherConfig::default()
    }
}

#[test]
fn test_units_of_one_region_schedule_once() {
    let h = harness(slow_flush(), DispatchConfig::default());

    assert_eq!(h.batcher.pre_schedule(&CPU, UnitPos::new(0, 0)), ScheduleDecision::Fresh);
    for x in 0..5 {
        for z in 0..5 {
            assert_eq!(h.batcher.pre_schedule(&CPU, UnitPos::new(x, z)), ScheduleDecision::Hit);
        }
    }
    assert_eq!(h.batcher.queued_regions(), 1);

    assert_eq!(h.batcher.flush_now(), 1);
    wait_until("region batch", || h.work.batches.load(Ordering::SeqCst) == 1);

    let mut units = h.work.units.lock().clone();
    units.sort();
    assert_eq!(units.len(), 25);
    assert_eq!(units.first(), Some(&UnitPos::new(0, 0)));
    assert_eq!(units.last(), Some(&UnitPos::new(4, 4)));

    let stats = h.batcher.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 25);
    assert_eq!(stats.batches_submitted, 1);
    wait_until("batch release", || h.batcher.active_batches() == 0);
}

#[test]
fn test_expired_region_is_rescheduled() {
    let config = BatcherConfig {
        schedule_ttl_ms: 1_000,
        ..slow_flush()
    };
    let h = harness(config, DispatchConfig::default());
    let unit = UnitPos::new(-7, 12);

    assert_eq!(h.batcher.pre_schedule(&CPU, unit), ScheduleDecision::Fresh);
    h.clock.advance(Duration::from_millis(999));
    assert_eq!(h.batcher.pre_schedule(&CPU, unit), ScheduleDecision::Hit);
    h.clock.advance(Duration::from_millis(1));
    assert_eq!(h.batcher.pre_schedule(&CPU, unit), ScheduleDecision::Fresh);

    // The buffer still holds the region once.
    assert_eq!(h.batcher.queued_regions(), 1);
}

#[test]
fn test_escalation_upgrades_in_place() {
    let h = harness(slow_flush(), DispatchConfig::default());
    let unit = UnitPos::new(3, 3);
    let region = RegionKey::containing(0, unit, 5);

    assert_eq!(h.batcher.pre_schedule(&CPU, unit), ScheduleDecision::Fresh);
    h.clock.advance(Duration::from_millis(10));
    assert_eq!(h.batcher.pre_schedule(&GPU, unit), ScheduleDecision::Escalated);
    assert_eq!(h.batcher.pre_schedule(&CPU, unit), ScheduleDecision::Hit);
    assert_eq!(h.batcher.pre_schedule(&GPU, unit), ScheduleDecision::Hit);

    let state = h.batcher.schedule_state(region).unwrap();
    assert!(state.escalated);
    assert_eq!(state.scheduled_at_ms, h.clock.now_millis());
}

#[test]
fn test_escalated_batch_is_offered_to_accelerator() {
    struct Counting(AtomicUsize);

    impl Accelerator for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn submit(
            &self,
            meta: &BatchMeta,
            workload: &AcceleratedWorkload,
            jobs: Vec<Job>,
            _timeout: Duration,
        ) -> Result<(), BackendError> {
            assert_eq!(meta.name, "terrain");
            assert_eq!(workload.units, 25);
            self.0.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || jobs.into_iter().for_each(|job| job()));
            Ok(())
        }
    }

    let timer = Timer::start("batcher-accel-timer");
    let accelerator = Arc::new(Counting(AtomicUsize::new(0)));
    let probe_target = Arc::clone(&accelerator);
    let dispatcher = ParallelDispatcher::builder(
        DispatchConfig::default(),
        Arc::new(WorkerPoolBackend::new("batcher-accel-pool", 2, 64)),
    )
    .timer(Arc::clone(&timer))
    .accelerator_probe(move || -> Option<Arc<dyn Accelerator>> {
        Some(Arc::clone(&probe_target) as Arc<dyn Accelerator>)
    })
    .build();
    let work = Arc::new(Recorder::default());
    let batcher =
        SpatialWorkBatcher::new("terrain", slow_flush(), Arc::clone(&work), dispatcher, timer);

    batcher.pre_schedule(&GPU, UnitPos::new(1, 1));
    assert_eq!(batcher.flush_now(), 1);
    wait_until("accelerated batch", || work.batches.load(Ordering::SeqCst) == 1);
    assert_eq!(accelerator.0.load(Ordering::SeqCst), 1);
}

#[test]
fn test_full_buffer_flushes_immediately() {
    let config = BatcherConfig {
        batch_size: 3,
        ..slow_flush()
    };
    let h = harness(config, DispatchConfig::default());

    for x in 0..3 {
        h.batcher.pre_schedule(&CPU, UnitPos::new(x * 5, 0));
    }
    wait_until("immediate flush", || h.work.batches.load(Ordering::SeqCst) == 1);
    assert_eq!(h.work.regions.load(Ordering::SeqCst), 3);
    assert_eq!(h.work.units.lock().len(), 75);
    assert_eq!(h.batcher.queued_regions(), 0);
}

#[test]
fn test_partial_buffer_flushes_after_debounce() {
    let config = BatcherConfig {
        debounce_ms: 200,
        ..BatcherConfig::default()
    };
    let h = harness(config, DispatchConfig::default());

    h.batcher.pre_schedule(&CPU, UnitPos::new(100, 100));
    h.batcher.pre_schedule(&CPU, UnitPos::new(200, 200));
    assert_eq!(h.batcher.queued_regions(), 2);

    wait_until("debounced flush", || h.work.regions.load(Ordering::SeqCst) == 2);
    assert_eq!(h.work.batches.load(Ordering::SeqCst), 1);
}

#[test]
fn test_flush_waits_for_dispatcher_capacity() {
    let config = BatcherConfig {
        batch_size: 1,
        flush_retry_ms: 5,
        ..slow_flush()
    };
    let dispatch = DispatchConfig {
        max_concurrent_batches: 1,
        ..DispatchConfig::default()
    };
    let h = harness(config, dispatch);

    let gate = Arc::new(Barrier::new(2));
    let blocker = Arc::clone(&gate);
    let blocking = h.dispatcher.dispatch(
        "blocker",
        vec![move || {
            blocker.wait();
            Ok::<_, SliceError>(())
        }],
        DispatchOptions::new(),
    );

    h.batcher.pre_schedule(&CPU, UnitPos::new(0, 0));
    wait_until("deferred flush", || h.batcher.stats().deferred_flushes >= 2);
    assert_eq!(h.batcher.queued_regions(), 1);
    assert_eq!(h.work.batches.load(Ordering::SeqCst), 0);

    gate.wait();
    blocking.wait().unwrap();
    wait_until("retried flush", || h.work.batches.load(Ordering::SeqCst) == 1);
    assert_eq!(h.batcher.queued_regions(), 0);
}

#[test]
fn test_prefetch_is_gated_by_cooldown_and_distance() {
    let config = BatcherConfig {
        prefetch_cooldown_ms: 500,
        prefetch_min_distance: 1,
        ..slow_flush()
    };
    let h = harness(config, DispatchConfig::default());

    assert_eq!(h.batcher.prefetch_around(&CPU, UnitPos::new(2, 2)), 8);
    assert_eq!(h.batcher.prefetch_around(&CPU, UnitPos::new(7, 2)), 0);

    h.clock.advance(Duration::from_millis(500));
    assert_eq!(h.batcher.prefetch_around(&CPU, UnitPos::new(3, 3)), 0);

    // One region east: four of the eight neighbours are already scheduled.
    assert_eq!(h.batcher.prefetch_around(&CPU, UnitPos::new(7, 2)), 4);
    assert_eq!(h.batcher.stats().prefetches, 2);
    assert_eq!(h.batcher.tracked_regions(), 12);
}

#[test]
fn test_expired_states_are_pruned() {
    let config = BatcherConfig {
        schedule_ttl_ms: 100,
        prune_every: 1,
        prune_scan: 32,
        ..slow_flush()
    };
    let h = harness(config, DispatchConfig::default());

    for x in 0..10 {
        h.batcher.pre_schedule(&CPU, UnitPos::new(x * 5, 0));
    }
    assert_eq!(h.batcher.tracked_regions(), 10);

    h.clock.advance(Duration::from_millis(200));
    h.batcher.pre_schedule(&CPU, UnitPos::new(-50, -50));
    assert_eq!(h.batcher.tracked_regions(), 1);
}

#[test]
fn test_namespaces_are_batched_separately() {
    let h = harness(slow_flush(), DispatchConfig::default());
    let nether = Ctx {
        namespace: 1,
        accelerated: false,
    };

    h.batcher.pre_schedule(&CPU, UnitPos::new(0, 0));
    h.batcher.pre_schedule(&nether, UnitPos::new(0, 0));
    h.batcher.pre_schedule(&CPU, UnitPos::new(5, 0));

    assert_eq!(h.batcher.flush_now(), 2);
    wait_until("both batches", || h.work.batches.load(Ordering::SeqCst) == 2);
    assert_eq!(h.work.regions.load(Ordering::SeqCst), 3);
}
