//! Integration tests for the parallel dispatcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_cache::{BudgetManager, CacheBackend, MemoryCacheBackend};
use strata_core::{
    CacheConfig, DispatchConfig, ManualClock, SliceError, StrataError, SystemClock,
};
use strata_dispatch::{
    AcceleratedWorkload, Accelerator, BackendError, BatchMeta, DispatchOptions, ExecutionBackend,
    Job, ParallelDispatcher, SliceCacheOptions, WorkerPoolBackend,
};

fn pool(name: &str) -> Arc<WorkerPoolBackend> {
    Arc::new(WorkerPoolBackend::new(name, 4, 256))
}

fn quick_retries() -> DispatchConfig {
    DispatchConfig {
        saturation_retries: 2,
        saturation_base_delay_ms: 1,
        ..DispatchConfig::default()
    }
}

/// Refuses everything as saturated.
struct AlwaysFull;

impl ExecutionBackend for AlwaysFull {
    fn name(&self) -> &str {
        "always-full"
    }

    fn try_submit(&self, _meta: &BatchMeta, _jobs: Vec<Job>) -> Result<(), BackendError> {
        Err(BackendError::CapacityExceeded {
            pending: 0,
            capacity: 0,
        })
    }
}

/// Refuses everything permanently.
struct Broken;

impl ExecutionBackend for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn try_submit(&self, _meta: &BatchMeta, _jobs: Vec<Job>) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("device lost".into()))
    }
}

/// Accelerator that runs accepted jobs on its own thread.
struct Threaded {
    accepted: AtomicUsize,
}

impl Accelerator for Threaded {
    fn name(&self) -> &str {
        "threaded"
    }

    fn submit(
        &self,
        _meta: &BatchMeta,
        _workload: &AcceleratedWorkload,
        jobs: Vec<Job>,
        _timeout: Duration,
    ) -> Result<(), BackendError> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            for job in jobs {
                job();
            }
        });
        Ok(())
    }
}

struct TimingOut;

impl Accelerator for TimingOut {
    fn name(&self) -> &str {
        "timing-out"
    }

    fn submit(
        &self,
        _meta: &BatchMeta,
        _workload: &AcceleratedWorkload,
        _jobs: Vec<Job>,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        Err(BackendError::TimedOut(timeout))
    }
}

#[test]
fn test_results_keep_slice_order() {
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("order")).build();
    let mut rng = StdRng::seed_from_u64(7);

    let slices: Vec<_> = (0..64u64)
        .map(|i| {
            let delay = rng.gen_range(0..3u64);
            move || {
                thread::sleep(Duration::from_millis(delay));
                Ok::<_, SliceError>(i * 3)
            }
        })
        .collect();

    let results = dispatcher
        .dispatch("ordered", slices, DispatchOptions::new())
        .wait()
        .unwrap();
    assert_eq!(results, (0..64u64).map(|i| i * 3).collect::<Vec<_>>());
    assert_eq!(dispatcher.active_batches(), 0);
    assert!(dispatcher.cost_estimate("ordered").is_some());
}

#[test]
fn test_empty_batch_completes_immediately() {
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("empty")).build();
    let slices: Vec<fn() -> Result<u8, SliceError>> = Vec::new();
    let handle = dispatcher.dispatch("nothing", slices, DispatchOptions::new());
    assert!(handle.is_done());
    assert_eq!(handle.wait().unwrap(), Vec::<u8>::new());
}

#[test]
fn test_saturated_batch_runs_each_slice_once() {
    let dispatcher = ParallelDispatcher::builder(quick_retries(), Arc::new(AlwaysFull)).build();
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..10).map(|_| AtomicUsize::new(0)).collect());

    let slices: Vec<_> = (0..10usize)
        .map(|i| {
            let runs = Arc::clone(&runs);
            move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
                Ok::<_, SliceError>(i)
            }
        })
        .collect();

    let results = dispatcher
        .dispatch("saturated", slices, DispatchOptions::new())
        .wait()
        .unwrap();
    assert_eq!(results, (0..10).collect::<Vec<_>>());
    assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));

    let stats = dispatcher.stats();
    assert_eq!(stats.saturations, 3);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn test_saturation_after_shutdown_fails_batch() {
    let dispatcher = ParallelDispatcher::builder(quick_retries(), Arc::new(AlwaysFull)).build();
    dispatcher.shutdown();

    let result = dispatcher
        .dispatch("late", vec![|| Ok::<_, SliceError>(1)], DispatchOptions::new())
        .wait();
    assert!(matches!(result, Err(StrataError::ShutDown)));
    assert_eq!(dispatcher.active_batches(), 0);
}

#[test]
fn test_permanent_rejection_fails_batch() {
    let dispatcher =
        ParallelDispatcher::builder(DispatchConfig::default(), Arc::new(Broken)).build();
    let result = dispatcher
        .dispatch("doomed", vec![|| Ok::<_, SliceError>(1)], DispatchOptions::new())
        .wait();
    assert!(matches!(result, Err(StrataError::ExecutionFailed { .. })));
    assert_eq!(dispatcher.stats().failed, 1);
}

#[test]
fn test_cached_slices_skip_their_closures() {
    let clock = ManualClock::new();
    let budget = Arc::new(BudgetManager::with_clock(
        "slices",
        &CacheConfig::default(),
        clock.clone(),
    ));
    let memory = MemoryCacheBackend::new(budget, clock.clone());
    let cache: Arc<dyn CacheBackend> = Arc::new(memory.clone());
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("cached"))
        .cache(cache)
        .clock(clock)
        .build();

    let invoked = Arc::new(AtomicUsize::new(0));
    let make_slices = || -> Vec<_> {
        (0..5u32)
            .map(|i| {
                let invoked = Arc::clone(&invoked);
                move || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SliceError>(format!("value-{i}"))
                }
            })
            .collect()
    };
    let cache_options = SliceCacheOptions::memory(|i| format!("k{i}"), Duration::from_secs(30), 10);

    let first = dispatcher
        .dispatch_cached("heights", make_slices(), DispatchOptions::new(), &cache_options)
        .wait()
        .unwrap();
    assert_eq!(invoked.load(Ordering::SeqCst), 5);
    assert_eq!(memory.len("heights"), 5);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let options = DispatchOptions::new().on_slice_complete(move |i, v: &String| {
        sink.lock().push((i, v.clone()));
    });
    let second = dispatcher
        .dispatch_cached("heights", make_slices(), options, &cache_options)
        .wait()
        .unwrap();

    assert_eq!(invoked.load(Ordering::SeqCst), 5);
    assert_eq!(first, second);
    assert_eq!(seen.lock().len(), 5);
    let stats = dispatcher.stats();
    assert_eq!(stats.cache_hits, 5);
    assert_eq!(stats.cache_misses, 5);
}

#[test]
fn test_first_slice_error_is_reported() {
    let config = DispatchConfig {
        max_parallelism: 1,
        small_batch_parallelism: 1,
        ..DispatchConfig::default()
    };
    let dispatcher = ParallelDispatcher::builder(config, pool("errors")).build();
    let completed = Arc::new(AtomicUsize::new(0));

    let slices: Vec<_> = (0..6usize)
        .map(|i| {
            let completed = Arc::clone(&completed);
            move || {
                completed.fetch_add(1, Ordering::SeqCst);
                if i == 2 || i == 4 {
                    Err(SliceError::failed(format!("slice {i} broke")))
                } else {
                    Ok(i)
                }
            }
        })
        .collect();

    let err = dispatcher
        .dispatch("fragile", slices, DispatchOptions::new())
        .wait()
        .unwrap_err();
    match err {
        StrataError::SliceFailed { batch, index, .. } => {
            assert_eq!(batch, "fragile");
            assert_eq!(index, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    // The batch resolves only after every slice has run.
    assert_eq!(completed.load(Ordering::SeqCst), 6);
    assert_eq!(dispatcher.cost_estimate("fragile"), None);
}

#[test]
fn test_panicking_slice_is_captured() {
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("panics")).build();
    let slices: Vec<Box<dyn FnOnce() -> Result<u8, SliceError> + Send>> = vec![
        Box::new(|| Ok(1)),
        Box::new(|| panic!("noise table missing")),
        Box::new(|| Ok(3)),
    ];

    let err = dispatcher
        .dispatch("panicky", slices, DispatchOptions::new())
        .wait()
        .unwrap_err();
    match err {
        StrataError::SliceFailed {
            index,
            source: SliceError::Panicked(message),
            ..
        } => {
            assert_eq!(index, 1);
            assert!(message.contains("noise table missing"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_accelerator_runs_hinted_batches() {
    let accelerator = Arc::new(Threaded {
        accepted: AtomicUsize::new(0),
    });
    let probe_target = Arc::clone(&accelerator);
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("accel"))
        .accelerator_probe(move || -> Option<Arc<dyn Accelerator>> {
            Some(Arc::clone(&probe_target) as Arc<dyn Accelerator>)
        })
        .build();
    assert!(dispatcher.has_accelerator());

    let slices: Vec<_> = (0..8u32).map(|i| move || Ok::<_, SliceError>(i + 1)).collect();
    let options = DispatchOptions::new().accelerated(AcceleratedWorkload::new("erosion", 8));
    let results = dispatcher.dispatch("eroded", slices, options).wait().unwrap();

    assert_eq!(results, (1..=8).collect::<Vec<_>>());
    assert_eq!(accelerator.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.stats().accelerated, 1);
}

#[test]
fn test_accelerator_failure_falls_back_to_cpu() {
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("accel-cpu"))
        .accelerator_probe(|| -> Option<Arc<dyn Accelerator>> { Some(Arc::new(TimingOut)) })
        .build();

    for round in 0..3u32 {
        let slices: Vec<_> = (0..4u32).map(|i| move || Ok::<_, SliceError>(i * round)).collect();
        let options = DispatchOptions::new().accelerated(AcceleratedWorkload::new("erosion", 4));
        let results = dispatcher.dispatch("eroded", slices, options).wait().unwrap();
        assert_eq!(results, (0..4).map(|i| i * round).collect::<Vec<_>>());
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.accelerated, 0);
    assert_eq!(stats.accelerator_fallbacks, 3);
}

/// Accelerator that accepts jobs and never runs them.
#[derive(Default)]
struct Stalled {
    held: Mutex<Vec<Job>>,
}

impl Accelerator for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    fn submit(
        &self,
        _meta: &BatchMeta,
        _workload: &AcceleratedWorkload,
        jobs: Vec<Job>,
        _timeout: Duration,
    ) -> Result<(), BackendError> {
        self.held.lock().extend(jobs);
        Ok(())
    }
}

#[test]
fn test_stalled_accelerator_falls_back_after_deadline() {
    let config = DispatchConfig {
        accelerator_timeout_ms: 50,
        ..DispatchConfig::default()
    };
    let accelerator = Arc::new(Stalled::default());
    let probe_target = Arc::clone(&accelerator);
    let dispatcher = ParallelDispatcher::builder(config, pool("accel-stalled"))
        .accelerator_probe(move || -> Option<Arc<dyn Accelerator>> {
            Some(Arc::clone(&probe_target) as Arc<dyn Accelerator>)
        })
        .build();

    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let slices: Vec<_> = (0..4usize)
        .map(|i| {
            let runs = Arc::clone(&runs);
            move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
                Ok::<_, SliceError>(i * 2)
            }
        })
        .collect();
    let options = DispatchOptions::new().accelerated(AcceleratedWorkload::new("erosion", 4));
    let handle = dispatcher.dispatch("eroded", slices, options);

    let Ok(result) = handle.wait_timeout(Duration::from_secs(2)) else {
        panic!("batch stuck behind a stalled accelerator");
    };
    assert_eq!(result.unwrap(), vec![0, 2, 4, 6]);

    let stats = dispatcher.stats();
    assert_eq!(stats.accelerated, 1);
    assert_eq!(stats.accelerator_fallbacks, 1);
    assert_eq!(stats.completed, 1);

    // Jobs the accelerator runs late find their cells already taken.
    let held: Vec<Job> = accelerator.held.lock().drain(..).collect();
    assert!(!held.is_empty());
    for job in held {
        job();
    }
    assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    assert_eq!(dispatcher.active_batches(), 0);
}

#[test]
fn test_hinted_batch_without_accelerator_runs_on_cpu() {
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), pool("no-accel"))
        .clock(SystemClock::shared())
        .build();
    assert!(!dispatcher.has_accelerator());

    let options = DispatchOptions::new().accelerated(AcceleratedWorkload::new("erosion", 1));
    let results = dispatcher
        .dispatch("eroded", vec![|| Ok::<_, SliceError>(9)], options)
        .wait()
        .unwrap();
    assert_eq!(results, vec![9]);
}

#[test]
fn test_pending_batches_are_visible_until_resolved() {
    let config = DispatchConfig {
        max_concurrent_batches: 1,
        ..DispatchConfig::default()
    };
    let dispatcher = ParallelDispatcher::builder(config, pool("pending")).build();
    let gate = Arc::new(Barrier::new(2));
    let blocker = Arc::clone(&gate);

    let handle = dispatcher.dispatch(
        "blocked",
        vec![move || {
            blocker.wait();
            Ok::<_, SliceError>(())
        }],
        DispatchOptions::new().namespace("overworld"),
    );

    let pending = dispatcher.pending_batches();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "blocked");
    assert_eq!(pending[0].namespace, "overworld");
    assert_eq!(dispatcher.pending_by_kind().get("blocked"), Some(&1));
    assert!(!dispatcher.has_capacity());

    gate.wait();
    handle.wait().unwrap();
    assert!(dispatcher.pending_batches().is_empty());
    assert!(dispatcher.has_capacity());
}

#[test]
fn test_concurrent_dispatchers_share_a_pool() {
    let backend = pool("shared");
    let dispatcher = ParallelDispatcher::builder(DispatchConfig::default(), backend).build();

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                let slices: Vec<_> = (0..32u64).map(|i| move || Ok::<_, SliceError>(t * 100 + i)).collect();
                dispatcher
                    .dispatch("shared", slices, DispatchOptions::new())
                    .wait()
                    .unwrap()
            })
        })
        .collect();

    for (t, handle) in handles.into_iter().enumerate() {
        let t = t as u64;
        assert_eq!(handle.join().unwrap(), (0..32).map(|i| t * 100 + i).collect::<Vec<_>>());
    }
    assert_eq!(dispatcher.stats().completed, 8);
}
