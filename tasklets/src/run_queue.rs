//! Per-thread FIFO of runnable tasklets.
//!
//! A [`RunQueue`] is cheap to clone (it's an `Arc` handle) and is bound to
//! whichever OS thread calls [`RunQueue::target`]. Tasklets become runnable
//! from arbitrary threads (wait-list `up`/`broadcast`, timer dispatch,
//! watched-fd handlers) but are always *executed* by whichever thread next
//! drains the queue they were enqueued on.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::tasklet::RawTasklet;

thread_local! {
    static TARGET: RefCell<Option<RunQueue>> = const { RefCell::new(None) };
}

struct Inner {
    queue: Mutex<QueueState>,
    not_empty: Condvar,
}

struct QueueState {
    order: VecDeque<Arc<dyn RawTasklet>>,
    members: HashSet<u64>,
}

/// A per-thread FIFO run queue.
///
/// Cloning a `RunQueue` shares the same underlying queue — cloning is how
/// you hand the same queue to multiple OS threads, e.g. a background
/// poller thread delivering a wakeup into a worker thread's queue.
#[derive(Clone)]
pub struct RunQueue {
    inner: Arc<Inner>,
}

impl RunQueue {
    /// Creates a new, empty run queue.
    pub fn create() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(QueueState {
                    order: VecDeque::new(),
                    members: HashSet::new(),
                }),
                not_empty: Condvar::new(),
            }),
        }
    }

    /// Binds `queue` as the current thread's target, or clears the
    /// binding when passed `None`.
    pub fn target(queue: Option<RunQueue>) {
        TARGET.with(|t| *t.borrow_mut() = queue);
    }

    /// Returns the run queue currently targeted by this thread, if any.
    pub fn current() -> Option<RunQueue> {
        TARGET.with(|t| t.borrow().clone())
    }

    /// Appends `tasklet` to this queue. Idempotent: re-enqueueing a
    /// tasklet that's already a member is a no-op — a tasklet is only
    /// ever runnable on at most one run queue at a time.
    pub(crate) fn enqueue(&self, tasklet: Arc<dyn RawTasklet>) {
        let mut state = self.inner.queue.lock();
        if state.members.insert(tasklet.id()) {
            state.order.push_back(tasklet);
            self.inner.not_empty.notify_one();
        }
    }

    /// Appends to whichever queue the calling thread currently targets.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no target set — enqueueing with no
    /// target is a programmer-contract violation.
    pub fn enqueue_current(tasklet: Arc<dyn RawTasklet>) {
        let target =
            Self::current().expect("run_queue::enqueue with no target set on this thread");
        target.enqueue(tasklet);
    }

    /// Removes `tasklet` if present. Used by `Tasklet::stop`/`fini` to
    /// detach from a run queue synchronously.
    pub(crate) fn remove(&self, id: u64) {
        let mut state = self.inner.queue.lock();
        if state.members.remove(&id) {
            state.order.retain(|t| t.id() != id);
        }
    }

    /// Drains `self`, running each tasklet's step under its governing
    /// mutex, in FIFO order; a step that re-enqueues work during its own
    /// execution sees it appended at the tail and picked up before `run`
    /// returns.
    ///
    /// If the queue starts empty and `may_block` is true, blocks on a
    /// condition variable for the *first* tasklet to arrive, then drains
    /// to exhaustion as normal. `run` never blocks a second time within
    /// the same call — once the queue empties after having made progress,
    /// it returns, rather than serving as an unbounded worker loop.
    pub fn run(&self, may_block: bool) {
        let mut processed_any = false;
        loop {
            let next = {
                let mut state = self.inner.queue.lock();
                loop {
                    if let Some(t) = state.order.pop_front() {
                        state.members.remove(&t.id());
                        break Some(t);
                    }
                    if !may_block || processed_any {
                        break None;
                    }
                    self.inner.not_empty.wait(&mut state);
                }
            };

            match next {
                Some(tasklet) => {
                    processed_any = true;
                    tasklet.run_step();
                }
                None => return,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.queue.lock().order.len()
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::create()
    }
}

impl std::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.queue.lock();
        f.debug_struct("RunQueue")
            .field("len", &state.order.len())
            .finish()
    }
}
