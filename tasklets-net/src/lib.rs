//! Minimal non-blocking TCP sockets for tasklet-based services.
//!
//! Built only on [`tasklets`]'s public watched-fd and wait-list APIs —
//! no protocol parsing, no buffering beyond the OS socket's own. See
//! [`Socket`] for the per-connection stream and [`ServerSocket`] for the
//! listening side.

mod error;
mod socket;

pub use error::{Error, Result};
pub use socket::{ServerSocket, Socket, StreamEvent};
