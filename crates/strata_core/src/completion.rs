//! # Completion Handles
//!
//! One-shot hand-off of a value from a producer thread to a consumer.
//!
//! The consumer side can block (`wait`, `wait_timeout`), poll (`is_done`,
//! `try_take`) or `.await` the handle; it implements [`Future`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

type Observer<T> = Box<dyn FnOnce(&T) + Send + 'static>;

struct Slot<T> {
    value: Option<T>,
    done: bool,
    waker: Option<Waker>,
    observers: Vec<Observer<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Creates a connected completer/handle pair.
#[must_use]
pub fn completion<T>() -> (Completer<T>, CompletionHandle<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            value: None,
            done: false,
            waker: None,
            observers: Vec::new(),
        }),
        ready: Condvar::new(),
    });
    (
        Completer {
            shared: Arc::clone(&shared),
        },
        CompletionHandle { shared },
    )
}

/// Producer side. Completing consumes it, so a value is published once.
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completer<T> {
    /// Publishes the value, runs observers and wakes every waiter.
    ///
    /// Observers run on the calling thread before the value becomes visible.
    pub fn complete(self, value: T) {
        let mut slot = self.shared.slot.lock();
        loop {
            let observers = std::mem::take(&mut slot.observers);
            if observers.is_empty() {
                break;
            }
            MutexGuard::unlocked(&mut slot, || {
                for observer in observers {
                    observer(&value);
                }
            });
        }
        slot.value = Some(value);
        slot.done = true;
        let waker = slot.waker.take();
        drop(slot);

        self.shared.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Consumer side of a completion.
pub struct CompletionHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> CompletionHandle<T> {
    /// Returns true once the value has been published.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().done
    }

    /// Blocks until the value is published and returns it.
    #[must_use]
    pub fn wait(self) -> T {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Blocks up to `timeout`. Gives the handle back if the value is not ready.
    ///
    /// # Errors
    ///
    /// Returns `Err(self)` when the timeout elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, Self> {
        let deadline = std::time::Instant::now() + timeout;
        {
            let mut slot = self.shared.slot.lock();
            loop {
                if let Some(value) = slot.value.take() {
                    return Ok(value);
                }
                if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                    if let Some(value) = slot.value.take() {
                        return Ok(value);
                    }
                    break;
                }
            }
        }
        Err(self)
    }

    /// Takes the value if it is ready.
    pub fn try_take(&mut self) -> Option<T> {
        self.shared.slot.lock().value.take()
    }

    /// Registers a callback that sees the value when it is published.
    ///
    /// If the value is already published the callback runs immediately on
    /// the calling thread, unless it was already taken. Callbacks must not block.
    pub fn on_complete(&self, observer: impl FnOnce(&T) + Send + 'static) {
        let mut slot = self.shared.slot.lock();
        if slot.done {
            if let Some(value) = slot.value.as_ref() {
                observer(value);
            }
            return;
        }
        slot.observers.push(Box::new(observer));
    }
}

impl<T> Future for CompletionHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut slot = self.shared.slot.lock();
        if let Some(value) = slot.value.take() {
            return Poll::Ready(value);
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("done", &self.is_done())
            .finish()
    }
}
