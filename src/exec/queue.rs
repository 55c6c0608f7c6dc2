//! Cross-thread work queue.
//!
//! A mutex-protected FIFO of closures plus a wake primitive. `push` is safe
//! from any thread and signals the owning loop; `flush` runs only on the
//! owning thread and pops one item per lock acquisition, so the lock is
//! never held while an item executes and pushers are never blocked behind a
//! running callback.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// Wake primitive for the thread that owns a [`TaskQueue`].
pub trait Wake: Send + Sync {
    /// Signal the owning loop that work is pending.
    fn wake(&self);
}

/// Wakes an async loop parked on [`tokio::sync::Notify`].
pub struct NotifyWaker(pub Arc<Notify>);

impl Wake for NotifyWaker {
    fn wake(&self) {
        self.0.notify_one();
    }
}

/// Wakes a plain thread parked on a condition variable.
///
/// The embedder's main thread is not an async loop, so its pump blocks in
/// [`CondvarWaker::wait`] between drains.
#[derive(Default)]
pub struct CondvarWaker {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl CondvarWaker {
    /// Create a new waker with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until woken or until `timeout` elapses. Returns `true` if a
    /// wake was observed. The pending flag is consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.condvar.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

impl Wake for CondvarWaker {
    fn wake(&self) {
        *self.pending.lock() = true;
        self.condvar.notify_one();
    }
}

type Job<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Mutex-guarded FIFO of work items targeting one thread's loop.
///
/// `C` is the context handed to each item when the owning thread drains the
/// queue: the engine core on the background thread, the application pump
/// state on the main thread.
pub struct TaskQueue<C> {
    jobs: Mutex<VecDeque<Job<C>>>,
    waker: Arc<dyn Wake>,
}

impl<C> TaskQueue<C> {
    /// Create a queue that signals `waker` on every push.
    pub fn new(waker: Arc<dyn Wake>) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    /// Append a work item and wake the owning loop. Safe from any thread.
    pub fn push(&self, job: impl FnOnce(&mut C) + Send + 'static) {
        self.jobs.lock().push_back(Box::new(job));
        self.waker.wake();
    }

    /// Drain the queue on the owning thread.
    ///
    /// Items are dequeued one at a time; the lock is released before each
    /// item runs, so items pushed by a running item are picked up in the
    /// same drain and no item observes a partially-drained queue.
    pub fn flush(&self, ctx: &mut C) {
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(ctx),
                None => break,
            }
        }
    }

    /// Number of queued items. Mostly useful for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}
