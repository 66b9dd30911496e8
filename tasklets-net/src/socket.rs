//! Non-blocking TCP stream and listener built purely on
//! [`tasklets::WatchedFd`] and [`tasklets::WaitList`] — no protocol logic,
//! no buffering beyond what the OS socket already does.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use parking_lot::Mutex;

use tasklets::{TaskletHandle, WaitList, WatchedFd, ERR, IN, OUT};

use crate::error::{Error, Result};

/// The outcome of one non-blocking `read`/`write` attempt.
#[derive(Debug)]
pub enum StreamEvent {
    /// The syscall completed for `n` bytes (`read`'s `n == 0` case is
    /// reported as [`StreamEvent::End`] instead, never as `Ready(0)`).
    Ready(usize),
    /// The syscall would have blocked. `tasklet` has been parked on the
    /// relevant direction's wait-list and interest has been re-armed;
    /// the caller must return without touching the tasklet further.
    Waiting,
    /// `read` only: the peer closed its write half.
    End,
}

/// A non-blocking, tasklet-aware TCP connection.
pub struct Socket {
    stream: Mutex<MioTcpStream>,
    watched: Option<WatchedFd>,
    readable: Arc<WaitList>,
    writable: Arc<WaitList>,
}

impl Socket {
    fn new(stream: MioTcpStream) -> Result<Self> {
        let fd = stream.as_raw_fd();
        let readable = Arc::new(WaitList::init(0));
        let writable = Arc::new(WaitList::init(0));

        let handler_readable = readable.clone();
        let handler_writable = writable.clone();
        let watched = WatchedFd::create(
            fd,
            Box::new(move |events, _prev_interest| {
                if events & (IN | ERR) != 0 {
                    handler_readable.broadcast();
                }
                if events & (OUT | ERR) != 0 {
                    handler_writable.broadcast();
                }
                // Edge-triggered: disarm entirely. The next `read`/`write`
                // call that hits `WouldBlock` re-asserts the interest it
                // actually needs.
                0
            }),
        )?;

        Ok(Self {
            stream: Mutex::new(stream),
            watched: Some(watched),
            readable,
            writable,
        })
    }

    fn watched(&self) -> &WatchedFd {
        self.watched.as_ref().expect("socket used after close")
    }

    /// Non-blocking read. On `WouldBlock`, parks `tasklet` on the
    /// readable wait-list and re-arms `IN` before returning
    /// [`StreamEvent::Waiting`] — the caller's step must return without
    /// touching `tasklet` again until it's woken.
    pub fn read(&self, buf: &mut [u8], tasklet: &TaskletHandle) -> Result<StreamEvent> {
        let mut stream = self.stream.lock();
        match stream.read(buf) {
            Ok(0) => Ok(StreamEvent::End),
            Ok(n) => Ok(StreamEvent::Ready(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                drop(stream);
                self.readable.wait(tasklet);
                self.watched().set_interest(IN)?;
                Ok(StreamEvent::Waiting)
            }
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Non-blocking write. Symmetric with [`Self::read`], parking on the
    /// writable wait-list and re-arming `OUT`.
    pub fn write(&self, buf: &[u8], tasklet: &TaskletHandle) -> Result<StreamEvent> {
        let mut stream = self.stream.lock();
        match stream.write(buf) {
            Ok(n) => Ok(StreamEvent::Ready(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                drop(stream);
                self.writable.wait(tasklet);
                self.watched().set_interest(OUT)?;
                Ok(StreamEvent::Waiting)
            }
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// The remote address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.stream.lock().peer_addr().map_err(Error::Io)
    }

    /// Shuts down both halves of the connection. The socket must still
    /// be dropped afterwards to deregister it from the poller.
    pub fn close(&self) {
        if let Err(err) = self.stream.lock().shutdown(Shutdown::Both) {
            log::warn!("socket shutdown failed: {err}");
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(watched) = self.watched.take() {
            watched.destroy();
        }
    }
}

struct Listener {
    listener: Mutex<MioTcpListener>,
    watched: Option<WatchedFd>,
    acceptable: Arc<WaitList>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(watched) = self.watched.take() {
            watched.destroy();
        }
    }
}

/// A non-blocking TCP listener, possibly bound to several local
/// addresses at once (e.g. an IPv4 and an IPv6 wildcard).
pub struct ServerSocket {
    listeners: Vec<Listener>,
}

impl ServerSocket {
    /// Binds a listening socket to every address in `addrs`.
    pub fn bind(addrs: &[SocketAddr]) -> Result<Self> {
        let mut listeners = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = MioTcpListener::bind(*addr).map_err(Error::Io)?;
            let fd = listener.as_raw_fd();
            let acceptable = Arc::new(WaitList::init(0));
            let handler_acceptable = acceptable.clone();
            let watched = WatchedFd::create(
                fd,
                Box::new(move |_events, _prev_interest| {
                    handler_acceptable.broadcast();
                    0
                }),
            )?;
            watched.set_interest(IN)?;
            listeners.push(Listener {
                listener: Mutex::new(listener),
                watched: Some(watched),
                acceptable,
            });
        }
        Ok(Self { listeners })
    }

    /// Accepts one pending connection from whichever bound address has
    /// one ready. Returns `None` if none do — `tasklet` has been parked
    /// on every listener's wait-list and all are re-armed; the caller's
    /// step must return.
    pub fn accept(&self, tasklet: &TaskletHandle) -> Result<Option<Socket>> {
        for entry in &self.listeners {
            let accepted = {
                let mut listener = entry.listener.lock();
                listener.accept()
            };
            match accepted {
                Ok((stream, _peer)) => return Socket::new(stream).map(Some),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }

        for entry in &self.listeners {
            entry.acceptable.wait(tasklet);
            entry
                .watched
                .as_ref()
                .expect("listener used after close")
                .set_interest(IN)?;
        }
        Ok(None)
    }

    /// The local addresses this server socket is bound to.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners
            .iter()
            .map(|entry| entry.listener.lock().local_addr().map_err(Error::Io))
            .collect()
    }
}
