//! Process-wide singleton: the background thread that blocks on fd
//! readiness and timer expiry, dispatches handlers, and drains its own
//! local run queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Token};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::run_queue::RunQueue;
use crate::timer::{self, TimerRing};
use crate::watched_fd::{self, Handler, WatchedFdEntry};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

struct State {
    fds: slab::Slab<WatchedFdEntry>,
    timers: TimerRing,
    woken: bool,
    stopping: bool,
}

/// The singleton poller. Access it through [`Poller::singleton`]; there
/// is exactly one live instance per process once first requested.
pub struct Poller {
    state: Mutex<State>,
    poll: Mutex<mio::Poll>,
    registry: mio::Registry,
    waker: mio::Waker,
    run_queue: RunQueue,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

static SINGLETON: OnceLock<Arc<Poller>> = OnceLock::new();

impl Poller {
    /// Returns the process-wide poller, creating (and starting its
    /// background thread) on first call. Concurrent first calls race
    /// safely: `OnceLock` ensures exactly one `Poller` is ever installed,
    /// and only its creator spawns the thread.
    pub fn singleton() -> Arc<Poller> {
        SINGLETON
            .get_or_init(|| {
                let poller = Poller::new().expect("failed to create poller backend");
                poller.start().expect("failed to start poller thread");
                poller
            })
            .clone()
    }

    fn new() -> Result<Arc<Self>> {
        let poll = mio::Poll::new().map_err(Error::BackendRegistration)?;
        let registry = poll.registry().try_clone().map_err(Error::BackendRegistration)?;
        let waker = mio::Waker::new(&registry, WAKE_TOKEN).map_err(Error::BackendRegistration)?;
        Ok(Arc::new(Self {
            state: Mutex::new(State {
                fds: slab::Slab::new(),
                timers: slab::Slab::new(),
                woken: false,
                stopping: false,
            }),
            poll: Mutex::new(poll),
            registry,
            waker,
            run_queue: RunQueue::create(),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// Creates a poller with its own background thread, independent of
    /// the process-wide singleton.
    ///
    /// Exists so lifecycle behavior (start, stop, join) can be exercised
    /// in isolation without tearing down the singleton other tests or
    /// collaborators may depend on.
    pub fn new_standalone() -> Result<Arc<Self>> {
        let poller = Self::new()?;
        poller.start()?;
        Ok(poller)
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let poller = self.clone();
        let handle = std::thread::Builder::new()
            .name("tasklets-poller".into())
            .spawn(move || poller.run())
            .map_err(Error::PollerSpawn)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run(self: Arc<Self>) {
        RunQueue::target(Some(self.run_queue.clone()));
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let deadline = {
                let mut state = self.state.lock();
                if state.stopping {
                    return;
                }
                state.woken = false;
                timer::next_deadline(&state.timers)
            };

            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.lock().poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("{}", Error::BackendPoll(err));
                    continue;
                }
            }

            {
                let mut state = self.state.lock();
                state.woken = true;
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    dispatch_fd_event(&mut state, &self.registry, event);
                }
                timer::dispatch_timers(&mut state.timers);
            }

            self.run_queue.run(false);
        }
    }

    /// Signals the poller thread to recompute its sleep deadline. A
    /// no-op if it's already known to be awake, eliding redundant
    /// private wake signals while the thread is still servicing events.
    pub(crate) fn wake(&self) {
        let mut state = self.state.lock();
        if state.woken {
            return;
        }
        state.woken = true;
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to signal poller thread: {err}");
        }
    }

    /// Requests the background thread stop after its current iteration.
    /// Any timers still registered are left as-is — callers are expected
    /// to have cleared what they own first, matching `timer_fini`'s
    /// contract.
    pub fn stop(&self) {
        self.state.lock().stopping = true;
        self.wake();
    }

    /// As [`Self::stop`], then blocks until the background thread has
    /// actually exited. Idempotent: calling it more than once, or on a
    /// poller whose thread already exited, is a no-op on the second call.
    pub fn stop_and_join(&self) {
        self.stop();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stops and joins the process-wide singleton's background thread,
    /// if one has ever been created. Used by tests and by a consuming
    /// binary's shutdown path; a subsequent call to [`Self::singleton`]
    /// within the same process would return the now-stopped instance; a
    /// *standalone* poller (see [`Self::new_standalone`]) should be used
    /// for anything that needs to come back up afterwards.
    pub fn stop_singleton() {
        if let Some(poller) = SINGLETON.get() {
            poller.stop_and_join();
        }
    }

    pub(crate) fn timers(&self) -> parking_lot::MappedMutexGuard<'_, TimerRing> {
        parking_lot::MutexGuard::map(self.state.lock(), |s| &mut s.timers)
    }

    pub(crate) fn register_fd(&self, fd: std::os::fd::RawFd, handler: Handler) -> Result<Token> {
        let mut state = self.state.lock();
        let key = state.fds.insert(WatchedFdEntry {
            fd,
            interest: 0,
            handler,
        });
        Ok(Token(key))
    }

    pub(crate) fn set_handler(&self, token: Token, handler: Handler) {
        let mut state = self.state.lock();
        if let Some(entry) = state.fds.get_mut(token.0) {
            entry.handler = handler;
        }
    }

    pub(crate) fn set_interest(&self, token: Token, bits: u8) -> Result<()> {
        let mut state = self.state.lock();
        let registry = &self.registry;
        let entry = state
            .fds
            .get_mut(token.0)
            .expect("set_interest on a destroyed watched fd");
        watched_fd::apply_interest(registry, entry, token, bits)?;
        drop(state);
        self.wake();
        Ok(())
    }

    pub(crate) fn deregister_fd(&self, token: Token) {
        let mut state = self.state.lock();
        if let Some(entry) = state.fds.try_remove(token.0) {
            if entry.interest != 0 {
                let mut source = mio::unix::SourceFd(&entry.fd);
                let _ = self.registry.deregister(&mut source);
            }
        }
    }
}

fn dispatch_fd_event(state: &mut State, registry: &mio::Registry, event: &mio::event::Event) {
    let token = event.token();
    let bits = watched_fd::event_bits(event);
    let Some(entry) = state.fds.get_mut(token.0) else {
        return;
    };
    let new_interest = (entry.handler)(bits, entry.interest);
    if let Err(err) = watched_fd::reregister(registry, entry.fd, token, entry.interest, new_interest)
    {
        log::warn!("failed to re-arm watched fd after dispatch: {err}");
        return;
    }
    entry.interest = new_interest;
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Poller")
            .field("fds", &state.fds.len())
            .field("timers", &state.timers.len())
            .field("stopping", &state.stopping)
            .finish()
    }
}
