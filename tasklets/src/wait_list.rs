//! Counted wait list: a semaphore-like `up`/`down` pair plus an
//! unconditional `broadcast`, sharing one FIFO of parked tasklets.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tasklet::{self, TaskletHandle};

struct State {
    count: u64,
    waiters: VecDeque<TaskletHandle>,
}

/// A FIFO wait list tasklets park on, released either by count (`up`/
/// `down`, semaphore style) or unconditionally (`broadcast`).
///
/// `up(n)` increments the count and wakes up to `n` of the longest-
/// waiting parked tasklets, but does **not** decrement the count on
/// their behalf: a woken tasklet's step must call `down` again when it
/// re-runs, exactly as any fresh caller would. This means a released
/// tasklet can still find the count already spent by someone who called
/// `down` directly in the meantime — in which case it simply re-parks at
/// the back of the queue. The invariant "if `count > 0` then `waiters` is
/// empty" holds once the run queue has drained, not synchronously at the
/// instant `up` returns.
pub struct WaitList {
    state: Mutex<State>,
}

impl WaitList {
    /// Creates a wait list with the given initial count.
    pub fn init(initial_count: u64) -> Self {
        Self {
            state: Mutex::new(State {
                count: initial_count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Finalizes the wait list.
    ///
    /// # Panics
    ///
    /// Panics if any tasklet is still parked on it — callers must drain
    /// all waiters (by cancelling them via `Tasklet::stop` or by exactly
    /// balancing `down`/`up`) before destruction.
    pub fn fini(self) {
        let state = self.state.into_inner();
        assert!(
            state.waiters.is_empty(),
            "wait_list::fini with waiters still parked"
        );
    }

    /// Increments the count by `n` and wakes up to `n` of the
    /// longest-waiting parked tasklets (FIFO order), regardless of
    /// whether the count ends up covering all of them.
    pub fn up(&self, n: u64) {
        let woken = {
            let mut state = self.state.lock();
            state.count = state.count.saturating_add(n);
            let to_wake = (n as usize).min(state.waiters.len());
            state.waiters.drain(..to_wake).collect::<Vec<_>>()
        };
        for tasklet in woken {
            tasklet::wake(tasklet);
        }
    }

    /// Attempts to decrement the count by `n`.
    ///
    /// If the count is at least `n`, decrements it and returns `true`
    /// immediately — the caller is free to keep calling `down` in a loop
    /// to drain as much as is available, as after a `broadcast`. If the
    /// count is insufficient, parks `tasklet` at the back of the wait
    /// list and returns `false`; the caller's step must return without
    /// touching `tasklet` further; the same step will be re-invoked when
    /// this tasklet is next released.
    ///
    /// Records `tasklet`'s membership in this list (a tasklet parks on
    /// at most one wait list at a time) so `Tasklet::stop`/`fini` can
    /// eject it again if it's cancelled for an unrelated reason — e.g.
    /// racing a timer on the other side of a timeout — before this list
    /// ever releases it.
    pub fn down(self: &Arc<Self>, n: u64, tasklet: &TaskletHandle) -> bool {
        let mut state = self.state.lock();
        if state.count >= n {
            state.count -= n;
            true
        } else {
            state.waiters.push_back(tasklet.clone());
            drop(state);
            tasklet.set_wait_list_member(Arc::downgrade(self));
            false
        }
    }

    /// Unconditionally parks `tasklet` at the back of the wait list,
    /// regardless of the current count. Used for plain condition-variable
    /// style waiting, paired with [`WaitList::broadcast`].
    ///
    /// Records membership the same way [`Self::down`] does.
    pub fn wait(self: &Arc<Self>, tasklet: &TaskletHandle) {
        self.state.lock().waiters.push_back(tasklet.clone());
        tasklet.set_wait_list_member(Arc::downgrade(self));
    }

    /// Removes `tasklet` from the waiter sequence if it's currently
    /// parked here, without touching the count or waking it. Used by
    /// `Tasklet::stop`/`fini` to detach from whichever wait list
    /// currently parks the tasklet, the same way `RunQueue::remove`
    /// detaches it from a run queue.
    pub(crate) fn remove(&self, id: u64) {
        self.state.lock().waiters.retain(|t| t.id() != id);
    }

    /// Wakes every currently parked tasklet without touching the count.
    /// Each woken tasklet re-runs its step and must re-examine whatever
    /// condition it was waiting on (this is a broadcast, not a release of
    /// `waiters.len()` units of count).
    pub fn broadcast(&self) {
        let woken = {
            let mut state = self.state.lock();
            state.waiters.drain(..).collect::<Vec<_>>()
        };
        for tasklet in woken {
            tasklet::wake(tasklet);
        }
    }

    /// Sets the count directly to `n`, then broadcasts if `n > 0`. Used
    /// to seed or reset a wait list used as a level-triggered gate.
    pub fn set(&self, n: u64) {
        {
            let mut state = self.state.lock();
            state.count = n;
        }
        if n > 0 {
            self.broadcast();
        }
    }

    /// The current count, mainly useful for tests and diagnostics.
    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    /// Number of tasklets currently parked, mainly useful for tests and
    /// diagnostics.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
