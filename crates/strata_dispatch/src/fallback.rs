//! Sequential fallback lane.
//!
//! A single dedicated thread that runs saturated batches one slice after
//! another. It has no capacity limit and bypasses the concurrency limiter,
//! trading latency for guaranteed completion.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use strata_core::panic_message;

use crate::backend::Job;

/// Dedicated thread for batches that exhausted their saturation retries.
pub struct FallbackLane {
    sender: Mutex<Option<Sender<Job>>>,
    queued: Arc<AtomicUsize>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackLane {
    /// Starts the lane thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread.
    #[must_use]
    pub fn start(name: &str) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));
        let lane_queued = Arc::clone(&queued);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for job in receiver {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                        tracing::warn!(
                            panic = %panic_message(payload.as_ref()),
                            "fallback job panicked"
                        );
                    }
                    lane_queued.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .expect("failed to spawn fallback thread");

        Self {
            sender: Mutex::new(Some(sender)),
            queued,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Queues a job. Gives it back if the lane has shut down.
    ///
    /// # Errors
    ///
    /// Returns the job when the lane no longer accepts work.
    pub fn run(&self, job: Job) -> Result<(), Job> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(job);
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        sender.send(job).map_err(|e| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            e.into_inner()
        })
    }

    /// Jobs waiting or running on the lane.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FallbackLane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FallbackLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackLane")
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}
