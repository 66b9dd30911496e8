//! Tasklets and their governing, tasklet-affine mutex.
//!
//! A step function always runs with its governing mutex held. It must
//! either park the tasklet on a wait list and return (unlocking), hand
//! itself to a run queue via `later`/`goto` and return, or finish via
//! `fini` and return. Steps never block the calling thread — "waiting" is
//! always expressed by returning, never by parking the OS thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::run_queue::RunQueue;
use crate::wait_list::WaitList;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Type-erased handle to a tasklet, good for storing in a [`crate::wait_list::WaitList`]
/// or [`crate::timer::Timer`] regardless of what user data type governs it.
pub type TaskletHandle = Arc<dyn RawTasklet>;

/// The operations a wait list, timer or watched-fd handler needs on a
/// tasklet without knowing its concrete user-data type.
pub trait RawTasklet: Send + Sync {
    /// A process-wide unique id, stable for the tasklet's lifetime.
    fn id(&self) -> u64;

    /// The mutex that must be held while this tasklet's step executes.
    fn governing_mutex(&self) -> Arc<dyn GoverningMutex>;

    /// Invoked by a [`RunQueue`] with no lock held; acquires the
    /// governing mutex itself before running the currently-set step.
    fn run_step(&self);

    /// Records that this tasklet is now parked on `wait_list`, replacing
    /// any previous record — a tasklet parks on at most one wait list at
    /// a time. Called by [`WaitList::wait`]/[`WaitList::down`] when they
    /// queue it.
    fn set_wait_list_member(&self, wait_list: Weak<WaitList>);

    /// Removes this tasklet from whichever wait list it's currently
    /// recorded as parked on, if any, ejecting it from that list's
    /// waiter sequence. Called by `Tasklet::stop`/`fini` so a cancelled
    /// tasklet never lingers in a wait list it will never be released
    /// from — e.g. the losing side of a `wait_list` vs. `timer` race.
    fn cancel_wait_list_member(&self);

    /// Clears any wait-list membership record without removing the
    /// tasklet from that list — used once a list has already released
    /// it (the list itself already popped it from `waiters`) so a stale
    /// record doesn't linger and confuse a later `cancel_wait_list_member`.
    fn clear_wait_list_member(&self);
}

/// Type-erased half of a [`TaskletMutex`], used by wait lists, timers, and
/// watched-fd handlers to release a tasklet without needing to know the
/// mutex's guarded data type.
pub trait GoverningMutex: Send + Sync {
    /// Adds `tasklet` to this mutex's pending-release set. The tasklet is
    /// moved onto a run queue either immediately (if the mutex is free)
    /// or when the current holder next unlocks.
    fn enqueue_pending(&self, tasklet: TaskletHandle);

    /// If nobody currently holds the mutex, acquires and immediately
    /// releases it purely to flush the pending set onto a run queue.
    /// No-op if it's held — the eventual unlock will flush instead.
    fn try_flush_pending(&self);
}

/// Wakes `tasklet`: enqueues it on its governing mutex's pending set, and
/// flushes that set to a run queue immediately if the mutex happens to be
/// free right now. Shared by wait-list `up`/`broadcast`, timer dispatch and
/// watched-fd handlers.
pub(crate) fn wake(tasklet: TaskletHandle) {
    tasklet.clear_wait_list_member();
    let mutex = tasklet.governing_mutex();
    mutex.enqueue_pending(tasklet);
    mutex.try_flush_pending();
}

/// A mutex that additionally tracks tasklets woken while it was locked, so
/// they can be transferred to a run queue the moment it's safe to execute
/// them.
pub struct TaskletMutex<T> {
    data: Mutex<T>,
    pending: Mutex<Vec<TaskletHandle>>,
}

impl<T> TaskletMutex<T> {
    /// Wraps `data` in a new tasklet-affine mutex.
    pub fn new(data: T) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Locks the mutex, blocking the calling OS thread if necessary.
    ///
    /// This is a real blocking lock, used by non-tasklet code (e.g. to
    /// create the first tasklet bound to a fresh mutex). Step functions
    /// never call this themselves — they already hold the lock for the
    /// duration of their own execution.
    pub fn lock(self: &Arc<Self>) -> TaskletMutexGuard<'_, T> {
        TaskletMutexGuard {
            mutex: self,
            guard: Some(self.data.lock()),
        }
    }

    /// Non-blocking variant of [`Self::lock`].
    pub fn try_lock(self: &Arc<Self>) -> Option<TaskletMutexGuard<'_, T>> {
        self.data.try_lock().map(|guard| TaskletMutexGuard {
            mutex: self,
            guard: Some(guard),
        })
    }

    fn flush_pending_locked(&self) {
        let woken: Vec<_> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        for tasklet in woken {
            RunQueue::enqueue_current(tasklet);
        }
    }
}

impl<T> fmt::Debug for TaskletMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskletMutex")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl<T: Send> GoverningMutex for TaskletMutex<T> {
    fn enqueue_pending(&self, tasklet: TaskletHandle) {
        self.pending.lock().push(tasklet);
    }

    fn try_flush_pending(&self) {
        if let Some(_guard) = self.data.try_lock() {
            self.flush_pending_locked();
        }
        // If the mutex is held, the holder's guard-drop flushes instead.
    }
}

/// RAII guard returned by [`TaskletMutex::lock`]/[`TaskletMutex::try_lock`].
///
/// Dropping the guard is `unlock`: it flushes any tasklets that were woken
/// while the mutex was held onto the current thread's run queue before
/// releasing the lock.
pub struct TaskletMutexGuard<'a, T> {
    mutex: &'a Arc<TaskletMutex<T>>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> std::ops::Deref for TaskletMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard already unlocked")
    }
}

impl<T> std::ops::DerefMut for TaskletMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard already unlocked")
    }
}

impl<T> TaskletMutexGuard<'_, T> {
    /// Explicit `unlock`, equivalent to dropping the guard. Provided so
    /// call sites can make the release point read explicitly.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T> Drop for TaskletMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        self.mutex.flush_pending_locked();
    }
}

/// The step a tasklet runs next, boxed so steps can be closures that
/// capture state — the idiomatic equivalent of the C step-function
/// pointer plus `void *` user data bundled together.
type Step<T> = Box<dyn FnMut(&mut T, &Tasklet<T>) + Send>;

struct TaskletInner<T> {
    id: u64,
    mutex: Arc<TaskletMutex<T>>,
    step: Mutex<Option<Step<T>>>,
    // Set by `stop`/`fini`, cleared by `goto`/`later`/`now`: distinguishes
    // "the last step returned without scheduling anything further, so
    // restore it for the next wake-up" (implicit park) from "the last
    // step explicitly finished" (stay idle, don't restore).
    finished: Mutex<bool>,
    run_queue_member: Mutex<Option<RunQueue>>,
    // A tasklet parks on at most one wait list at a time (spec's
    // wait-list membership link); `Weak` because a wait list is
    // borrowed, not owned, by whatever it synchronizes.
    wait_list_member: Mutex<Option<Weak<WaitList>>>,
    // Lets `run_step` reconstruct a `Tasklet<T>` handle to pass to the
    // step without duplicating any state.
    self_ref: Weak<TaskletInner<T>>,
}

/// A cooperative unit of work bound to a [`TaskletMutex`].
///
/// `Tasklet<T>` is a cheap-to-clone handle (an `Arc` underneath); clones
/// refer to the same underlying tasklet, mirroring the C API's use of a
/// stable `struct tasklet *` pointer.
pub struct Tasklet<T> {
    inner: Arc<TaskletInner<T>>,
}

impl<T> Clone for Tasklet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Tasklet<T> {
    /// Creates a tasklet bound to `mutex`, with no step set yet. The
    /// caller is expected to already hold `mutex` and to follow up with
    /// [`Tasklet::goto`]/[`Tasklet::now`]/[`Tasklet::later`] to give it an
    /// initial step.
    pub fn init(mutex: Arc<TaskletMutex<T>>) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_ref| TaskletInner {
                id: next_id(),
                mutex,
                step: Mutex::new(None),
                finished: Mutex::new(true),
                run_queue_member: Mutex::new(None),
                wait_list_member: Mutex::new(None),
                self_ref: self_ref.clone(),
            }),
        }
    }

    /// A type-erased handle for passing this tasklet into a wait list,
    /// timer, or watched-fd API.
    pub fn handle(&self) -> TaskletHandle {
        self.inner.clone()
    }

    /// Unique id, stable for the tasklet's lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The governing mutex this tasklet's steps execute under.
    pub fn mutex(&self) -> &Arc<TaskletMutex<T>> {
        &self.inner.mutex
    }

    /// Sets the next step and runs it immediately as a plain tail call,
    /// using the `&mut T` the caller already has in hand — never
    /// re-acquiring the governing mutex. This is what lets a step call
    /// `goto` on itself (a state-machine transition) without deadlocking
    /// on a mutex it's already holding: `data` must be the very
    /// reference the caller already holds under that mutex, whether
    /// that's a step's own `&mut T` parameter or a reborrow of an
    /// external [`TaskletMutexGuard`].
    pub fn goto<F>(&self, data: &mut T, mut step: F)
    where
        F: FnMut(&mut T, &Tasklet<T>) + Send + 'static,
    {
        *self.inner.finished.lock() = false;
        step(data, self);
        let mut slot = self.inner.step.lock();
        if slot.is_none() && !*self.inner.finished.lock() {
            *slot = Some(Box::new(step));
        }
    }

    /// Sets the next step and enqueues this tasklet on the current
    /// thread's run queue; the caller remains responsible for releasing
    /// the mutex afterwards (typically by returning from its own step,
    /// which drops the guard).
    pub fn later<F>(&self, step: F)
    where
        F: FnMut(&mut T, &Tasklet<T>) + Send + 'static,
    {
        *self.inner.finished.lock() = false;
        *self.inner.step.lock() = Some(Box::new(step));
        let queue = RunQueue::current().expect("later() with no run queue target on this thread");
        queue.enqueue(self.handle());
        *self.inner.run_queue_member.lock() = Some(queue);
    }

    /// Sets the step and executes it synchronously — alias for
    /// [`Tasklet::goto`], kept as a distinct name because call sites read
    /// better distinguishing initial dispatch from an in-step transition,
    /// even though both are a plain tail call here.
    pub fn now<F>(&self, data: &mut T, step: F)
    where
        F: FnMut(&mut T, &Tasklet<T>) + Send + 'static,
    {
        self.goto(data, step);
    }

    /// Cancels any pending runnable/waiter membership; the tasklet
    /// becomes idle. Safe to call even if a wake-up on a wait list is
    /// racing it, because de-queuing is mutex-protected at both ends —
    /// whichever of `stop` and the wait list's `up`/`broadcast` observes
    /// the membership first removes it, and the other becomes a no-op.
    pub fn stop(&self) {
        if let Some(queue) = self.inner.run_queue_member.lock().take() {
            queue.remove(self.inner.id);
        }
        self.inner.cancel_wait_list_member();
        *self.inner.step.lock() = None;
        *self.inner.finished.lock() = true;
    }

    /// As [`Tasklet::stop`], then invalidates the record. The caller must
    /// hold the governing mutex, exactly like `stop`/`fini` in the C API.
    pub fn fini(&self) {
        self.stop();
    }
}

impl<T> fmt::Debug for Tasklet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet").field("id", &self.inner.id).finish()
    }
}

impl<T: Send + 'static> TaskletInner<T> {
    fn handle_self(&self) -> Tasklet<T> {
        Tasklet {
            inner: self
                .self_ref
                .upgrade()
                .expect("tasklet inner outlived by its own step invocation"),
        }
    }
}

impl<T: Send + 'static> RawTasklet for TaskletInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn governing_mutex(&self) -> Arc<dyn GoverningMutex> {
        self.mutex.clone()
    }

    fn run_step(&self) {
        *self.run_queue_member.lock() = None;
        let mut step = match self.step.lock().take() {
            Some(step) => step,
            None => return,
        };
        let tasklet = self.handle_self();
        {
            let mut guard = self.mutex.lock();
            step(&mut guard, &tasklet);
        }
        let mut slot = self.step.lock();
        if slot.is_none() && !*self.finished.lock() {
            *slot = Some(step);
        }
    }

    fn set_wait_list_member(&self, wait_list: Weak<WaitList>) {
        *self.wait_list_member.lock() = Some(wait_list);
    }

    fn cancel_wait_list_member(&self) {
        if let Some(wait_list) = self.wait_list_member.lock().take() {
            if let Some(wait_list) = wait_list.upgrade() {
                wait_list.remove(self.id);
            }
        }
    }

    fn clear_wait_list_member(&self) {
        *self.wait_list_member.lock() = None;
    }
}
