//! Deadline-window timers dispatched by the poller's background thread.

use std::sync::{Arc, Weak};
use std::time::Instant;

use slab::Slab;

use crate::poller::Poller;
use crate::tasklet::TaskletHandle;
use crate::wait_list::WaitList;

/// What the poller actually needs to know about a registered timer: its
/// window and a weak handle to the wait-list it should broadcast on
/// expiry. Weak, because the poller borrows timers rather than owning
/// them — a timer dropped without an explicit `clear`/`fini` simply fails
/// to upgrade and is pruned the next time the ring is walked.
pub(crate) struct TimerEntry {
    pub(crate) earliest: Instant,
    pub(crate) latest: Instant,
    pub(crate) wait_list: Weak<WaitList>,
}

pub(crate) type TimerRing = Slab<TimerEntry>;

/// A deadline window `[earliest, latest]`, with a wait-list of tasklets
/// parked on it via [`Timer::wait`].
///
/// Registered with the process-wide [`Poller`] singleton, which owns the
/// background thread that walks all live timers and broadcasts the ones
/// whose `earliest` has passed.
pub struct Timer {
    poller: Arc<Poller>,
    wait_list: Arc<WaitList>,
    key: parking_lot::Mutex<Option<usize>>,
    // Kept independent of the ring entry: `dispatch_timers` removes the
    // ring entry the moment a timer fires, but `wait()` must keep
    // reporting "already passed" for the rest of this timer's armed
    // lifetime, not just while it's still sitting in the ring.
    earliest: parking_lot::Mutex<Option<Instant>>,
}

impl Timer {
    /// Creates an unarmed timer registered with the singleton poller.
    pub fn init() -> Self {
        Self {
            poller: Poller::singleton(),
            wait_list: Arc::new(WaitList::init(0)),
            key: parking_lot::Mutex::new(None),
            earliest: parking_lot::Mutex::new(None),
        }
    }

    /// Arms the timer to fire once monotonic time reaches `earliest`,
    /// waking the poller no later than `latest` to do so. Re-arms in
    /// place if already registered.
    pub fn set(&self, earliest: Instant, latest: Instant) {
        debug_assert!(latest >= earliest, "timer latest must not precede earliest");
        let mut ring = self.poller.timers();
        let mut key = self.key.lock();
        let entry = TimerEntry {
            earliest,
            latest,
            wait_list: Arc::downgrade(&self.wait_list),
        };
        match *key {
            Some(k) if ring.contains(k) => ring[k] = entry,
            _ => *key = Some(ring.insert(entry)),
        }
        *self.earliest.lock() = Some(earliest);
        drop(ring);
        self.poller.wake();
    }

    /// As [`Timer::set`], but `earliest`/`latest` are offsets from now.
    pub fn set_relative(&self, earliest: std::time::Duration, latest: std::time::Duration) {
        let now = Instant::now();
        self.set(now + earliest, now + latest);
    }

    /// Deregisters the timer without waking its wait-list. Safe to call
    /// on a timer that isn't currently registered.
    pub fn clear(&self) {
        let mut ring = self.poller.timers();
        if let Some(k) = self.key.lock().take() {
            if ring.contains(k) {
                ring.remove(k);
            }
        }
        *self.earliest.lock() = None;
    }

    /// Parks `tasklet` on this timer's wait-list, to be woken when the
    /// timer fires (or by an explicit [`WaitList::broadcast`] on the
    /// returned handle, for timeout-racing callers).
    ///
    /// Returns `true` immediately, without parking, if `earliest` has
    /// already passed.
    pub fn wait(&self, tasklet: &TaskletHandle) -> bool {
        if self.earliest_passed() {
            return true;
        }
        self.wait_list.wait(tasklet);
        false
    }

    fn earliest_passed(&self) -> bool {
        match *self.earliest.lock() {
            Some(earliest) => earliest <= Instant::now(),
            None => false,
        }
    }

    /// Deregisters and releases the wait-list, asserting no tasklet is
    /// still parked on it.
    pub fn fini(self) {
        self.clear();
        Arc::try_unwrap(self.wait_list)
            .unwrap_or_else(|_| panic!("timer::fini with the wait-list still shared"))
            .fini();
    }
}

/// Visits every timer in `ring` at most once, broadcasting (and
/// unregistering) those whose `earliest` has passed.
///
/// Re-derived from the invariant "visit each timer at most once, tolerate
/// head removal" rather than walked as a live pointer ring: a snapshot of
/// keys is taken up front, so removing the current entry (or any other)
/// mid-walk can never skip or revisit a timer.
pub(crate) fn dispatch_timers(ring: &mut TimerRing) {
    let now = Instant::now();
    let due: Vec<usize> = ring
        .iter()
        .filter(|(_, entry)| entry.earliest <= now)
        .map(|(key, _)| key)
        .collect();

    for key in due {
        if !ring.contains(key) {
            continue;
        }
        let entry = ring.remove(key);
        if let Some(wait_list) = entry.wait_list.upgrade() {
            wait_list.broadcast();
        }
    }
}

/// The sleep bound the poller should use: the minimum `latest` across all
/// live timers, or `None` if there are none registered (sleep
/// indefinitely, modulo a wake signal).
pub(crate) fn next_deadline(ring: &TimerRing) -> Option<Instant> {
    ring.iter().map(|(_, entry)| entry.latest).min()
}
