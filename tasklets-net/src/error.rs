//! Errors surfaced across the socket/tasklet boundary.

use std::io;

/// Errors a socket operation can report to the step that called it.
///
/// I/O and backend-registration failures are reported synchronously
/// rather than masked or retried; it's the caller's step that decides
/// what to do.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying socket syscall failed with something other than
    /// `WouldBlock`.
    #[error("socket I/O error: {0}")]
    Io(#[source] io::Error),

    /// Registering or re-arming the fd with the poller failed.
    #[error(transparent)]
    Poller(#[from] tasklets::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
