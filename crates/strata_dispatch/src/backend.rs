//! # Execution Backends
//!
//! Where dispatched jobs actually run.
//!
//! ```text
//!   try_submit(meta, jobs) ──> reserve jobs.len() slots ──ok──> channel ──> workers
//!                                     │full
//!                                     └──> BackendError::CapacityExceeded (nothing queued)
//! ```
//!
//! Admission is all-or-nothing: a rejected submission queues no job, so the
//! dispatcher can retry the whole batch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use strata_core::panic_message;
use thiserror::Error;

use crate::accelerator::AcceleratedWorkload;

/// One unit of work handed to a backend.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Advisory placement for a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ResourceHint {
    /// General-purpose worker threads.
    #[default]
    Cpu,
    /// Prefer the accelerator if one was resolved.
    Accelerated(AcceleratedWorkload),
}

/// Identity of a submitted batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMeta {
    /// Namespace (dimension, world, tenant).
    pub namespace: String,
    /// Batch kind, also the key of the cost model.
    pub name: String,
    /// Dispatcher-wide sequence number.
    pub seq: u64,
    /// Slices in the batch.
    pub slice_count: usize,
    /// Placement hint.
    pub hint: ResourceHint,
}

/// Why a backend refused a submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend's queue is full. Transient.
    #[error("backend at capacity ({pending} pending, capacity {capacity})")]
    CapacityExceeded {
        /// Jobs queued or running at the time of the rejection.
        pending: usize,
        /// Backend capacity.
        capacity: usize,
    },

    /// Admission did not complete within the deadline.
    #[error("admission timed out after {0:?}")]
    TimedOut(Duration),

    /// The backend cannot take work right now.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend has been shut down.
    #[error("backend shut down")]
    ShutDown,
}

impl BackendError {
    /// Whether the dispatcher should treat this as saturation.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Accepts jobs for execution.
pub trait ExecutionBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Queues every job or none of them.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the jobs do not fit; other variants for
    /// permanent failures.
    fn try_submit(&self, meta: &BatchMeta, jobs: Vec<Job>) -> Result<(), BackendError>;
}

/// Bounded pool of named worker threads.
pub struct WorkerPoolBackend {
    name: String,
    sender: RwLock<Option<Sender<Job>>>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolBackend {
    /// Starts `threads` workers (at least one) with room for `capacity` jobs.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    #[must_use]
    pub fn new(name: impl Into<String>, threads: usize, capacity: usize) -> Self {
        let name = name.into();
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded::<Job>(capacity);
        let pending = Arc::new(AtomicUsize::new(0));

        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || Self::worker_loop(&receiver, &pending))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(pool = %name, threads = threads.max(1), capacity, "worker pool started");
        Self {
            name,
            sender: RwLock::new(Some(sender)),
            pending,
            capacity,
            workers: Mutex::new(workers),
        }
    }

    fn worker_loop(receiver: &Receiver<Job>, pending: &AtomicUsize) {
        for job in receiver {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                tracing::warn!(panic = %panic_message(payload.as_ref()), "worker job panicked");
            }
            pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Jobs queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Maximum jobs queued or running.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stops accepting jobs, lets queued jobs finish, joins the workers.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.write().take() else {
            return;
        };
        drop(sender);

        let current = thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        tracing::debug!(pool = %self.name, "worker pool stopped");
    }

    fn reserve(&self, count: usize) -> Result<(), BackendError> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current + count > self.capacity {
                return Err(BackendError::CapacityExceeded {
                    pending: current,
                    capacity: self.capacity,
                });
            }
            match self.pending.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl ExecutionBackend for WorkerPoolBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_submit(&self, meta: &BatchMeta, jobs: Vec<Job>) -> Result<(), BackendError> {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            return Err(BackendError::ShutDown);
        };
        let count = jobs.len();
        self.reserve(count)?;

        // Reserved slots guarantee channel room, so sends never block.
        for (sent, job) in jobs.into_iter().enumerate() {
            if sender.send(job).is_err() {
                self.pending.fetch_sub(count - sent, Ordering::AcqRel);
                return Err(BackendError::ShutDown);
            }
        }
        tracing::trace!(pool = %self.name, batch = %meta.name, seq = meta.seq, "jobs queued");
        Ok(())
    }
}

impl Drop for WorkerPoolBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPoolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolBackend")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
