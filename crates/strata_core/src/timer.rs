//! # Delayed Task Timer
//!
//! One background thread running small closures after a delay. Used for
//! flush debouncing, deferred flushes and saturation backoff, so none of
//! those paths ever sleep on a caller's thread.
//!
//! ```text
//!   schedule(delay, task) ──> [min-heap by due time] ──> timer thread ──> task()
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::panic_message;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

/// Background thread executing delayed closures in deadline order.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Starts the timer thread.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn the thread.
    #[must_use]
    pub fn start(name: &str) -> Arc<Self> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue::default()),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(&worker_shared))
            .expect("failed to spawn timer thread");

        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules `task` to run after `delay`.
    ///
    /// Returns false (dropping the task) once the timer has shut down.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            due: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        true
    }

    /// Number of tasks waiting for their deadline.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Stops the thread. Tasks that have not yet fired are dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.heap.clear();
        }
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn run(shared: &TimerShared) {
        let mut queue = shared.queue.lock();
        loop {
            if queue.shutdown {
                break;
            }

            let next_due = queue.heap.peek().map(|entry| entry.due);
            match next_due {
                None => shared.wakeup.wait(&mut queue),
                Some(due) if due > Instant::now() => {
                    let _ = shared.wakeup.wait_until(&mut queue, due);
                }
                Some(_) => {
                    if let Some(entry) = queue.heap.pop() {
                        MutexGuard::unlocked(&mut queue, || {
                            if let Err(payload) = catch_unwind(AssertUnwindSafe(entry.task)) {
                                tracing::warn!(
                                    panic = %panic_message(payload.as_ref()),
                                    "timer task panicked"
                                );
                            }
                        });
                    }
                }
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
