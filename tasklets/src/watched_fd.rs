//! Edge-triggered readiness registration over a raw file descriptor.

use std::os::fd::RawFd;
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::error::{Error, Result};
use crate::poller::Poller;

/// Readiness bit: the fd is readable.
pub const IN: u8 = 1;
/// Readiness bit: the fd is writable.
pub const OUT: u8 = 4;
/// Readiness bit: the fd has an error condition. Always reported,
/// regardless of the current interest set.
pub const ERR: u8 = 8;

/// Invoked under the poller lock with the event bits that fired and the
/// interest set in effect when they were observed; must return the new
/// interest set to arm for the next readiness transition.
pub type Handler = Box<dyn FnMut(u8, u8) -> u8 + Send>;

pub(crate) struct WatchedFdEntry {
    pub(crate) fd: RawFd,
    pub(crate) interest: u8,
    pub(crate) handler: Handler,
}

/// A registration of one file descriptor with the singleton [`Poller`].
///
/// The handler is always invoked with the poller's internal lock held;
/// it must not call back into anything that acquires a tasklet mutex,
/// only wake tasklets.
pub struct WatchedFd {
    poller: Arc<Poller>,
    token: Token,
}

fn to_interest(bits: u8) -> Option<Interest> {
    match (bits & IN != 0, bits & OUT != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl WatchedFd {
    /// Registers `fd` with the singleton poller, initially with an empty
    /// interest set. Call [`Self::set_interest`] to begin receiving
    /// events.
    pub fn create(fd: RawFd, handler: Handler) -> Result<Self> {
        let poller = Poller::singleton();
        let token = poller.register_fd(fd, handler)?;
        Ok(Self { poller, token })
    }

    /// Replaces this registration's handler. Takes effect for the next
    /// dispatch; a handler call already in flight on the poller thread
    /// finishes with the old one.
    pub fn set_handler(&self, handler: Handler) {
        self.poller.set_handler(self.token, handler);
    }

    /// ORs `bits` into the current interest set and applies the change
    /// with the poll backend. Errors leave the previous registration
    /// intact.
    pub fn set_interest(&self, bits: u8) -> Result<()> {
        self.poller.set_interest(self.token, bits)
    }

    /// Deregisters the fd. Safe to call concurrently with an in-flight
    /// handler invocation: both are serialized through the poller lock.
    pub fn destroy(self) {
        self.poller.deregister_fd(self.token);
    }
}

pub(crate) fn apply_interest(
    registry: &mio::Registry,
    entry: &mut WatchedFdEntry,
    token: Token,
    bits: u8,
) -> Result<()> {
    let new_interest = entry.interest | bits;
    if new_interest == entry.interest {
        return Ok(());
    }
    reregister(registry, entry.fd, token, entry.interest, new_interest)?;
    entry.interest = new_interest;
    Ok(())
}

pub(crate) fn reregister(
    registry: &mio::Registry,
    fd: RawFd,
    token: Token,
    old_bits: u8,
    new_bits: u8,
) -> Result<()> {
    let mut source = SourceFd(&fd);
    match (to_interest(old_bits), to_interest(new_bits)) {
        (None, Some(interest)) => registry
            .register(&mut source, token, interest)
            .map_err(Error::BackendRegistration),
        (Some(_), Some(interest)) => registry
            .reregister(&mut source, token, interest)
            .map_err(Error::BackendRegistration),
        (Some(_), None) => registry.deregister(&mut source).map_err(Error::BackendRegistration),
        (None, None) => Ok(()),
    }
}

pub(crate) fn event_bits(event: &mio::event::Event) -> u8 {
    let mut bits = 0;
    if event.is_readable() {
        bits |= IN;
    }
    if event.is_writable() {
        bits |= OUT;
    }
    if event.is_error() || event.is_read_closed() || event.is_write_closed() {
        bits |= ERR;
    }
    bits
}

