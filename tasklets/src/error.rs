//! Error conditions that can be reported synchronously across the core's
//! external boundaries (backend registration, poller I/O).
//!
//! Programmer-contract violations (finalizing a non-empty wait list,
//! enqueueing with no run-queue target, destroying a tasklet that still
//! holds external resources) are *not* represented here: they are bugs,
//! and surface as panics/assertions instead.

use std::io;

/// Errors the core can report to a caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A watched-fd backend registration (`epoll_ctl`/`kqueue` via `mio`)
    /// failed. State is left unchanged on this error.
    #[error("failed to register interest with the poll backend: {0}")]
    BackendRegistration(#[source] io::Error),

    /// The poller's blocking wait itself returned an OS error that isn't a
    /// benign spurious wakeup (`EINTR` is swallowed by the poller loop and
    /// never reaches here).
    #[error("poll backend wait failed: {0}")]
    BackendPoll(#[source] io::Error),

    /// The singleton poller thread could not be spawned.
    #[error("failed to spawn poller thread: {0}")]
    PollerSpawn(#[source] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
