//! Connections
//!
//! A [`Connection`] is the engine's side of one accepted socket: its read
//! buffer and framer, its write queue, its matcher and filter slots, and the
//! [`ConnectionHandler`] the embedder supplied for it.
//!
//! ## Read Path
//!
//! ```text
//! ┌──────────── IO thread ────────────┐     ┌──────────────── worker ─────────────────┐
//! │                                   │     │                                          │
//! │ readable ──> read interest off ───┼────>│ socket ──> [filter] ──> read buffer      │
//! │                                   │     │                            │             │
//! │                                   │     │                            ▼             │
//! │                                   │     │           matcher ──> PDU ──> on_input   │
//! │                                   │     │                            │             │
//! │ read interest on <────────────────┼─────┼──── EnableRead task <──────┘             │
//! └───────────────────────────────────┘     └──────────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//!
//! ```text
//! handler.write(bytes) ──> [filter] ──> write queue ──> EnableWrite ──> IO thread
//!                                                                          │
//!                                          socket <── drain on writable <──┘
//! ```
//!
//! ## Closing
//!
//! - [`Connection::close`]: stop reading, flush what is queued, then close.
//! - [`Connection::close_now`]: close on the next IO thread turn.
//!
//! Either way the handler's `on_disconnect` runs exactly once, on a worker,
//! and the read buffer goes back to the pool.

mod conn;
mod framing;
pub mod handler;
pub mod write_queue;

pub use conn::Connection;
pub use handler::{ConnectionHandler, HandlerFactory};
pub use write_queue::{Drain, WriteQueue};

use std::io;
use thiserror::Error;

use crate::buffer::BufferPoolError;
use crate::filter::FilterError;

/// Errors that end a connection or reject a request on it.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The filter rejected the traffic
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// No read buffer could be had
    #[error("buffer pool error: {0}")]
    Pool(#[from] BufferPoolError),

    /// A handler callback failed
    #[error("handler error: {0}")]
    Handler(anyhow::Error),

    /// A handler callback panicked
    #[error("handler panicked")]
    HandlerPanicked,

    /// The connection is closed or closing
    #[error("connection closed")]
    Closed,

    /// A filter is already installed
    #[error("a filter is already installed")]
    FilterInstalled,

    /// `write_line` got text that is not ASCII
    #[error("non-ASCII character {character:?} at byte {index}")]
    NonAscii { character: char, index: usize },
}

impl ConnectionError {
    /// True for errors that just mean the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Io(e) => is_disconnect(e),
            ConnectionError::Filter(FilterError::Io(e)) => is_disconnect(e),
            ConnectionError::Filter(FilterError::PeerClosed) => true,
            ConnectionError::Closed => true,
            _ => false,
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        let reset = ConnectionError::Io(io::ErrorKind::ConnectionReset.into());
        assert!(reset.is_disconnect());

        let pipe = ConnectionError::Filter(FilterError::Io(io::ErrorKind::BrokenPipe.into()));
        assert!(pipe.is_disconnect());

        assert!(ConnectionError::Filter(FilterError::PeerClosed).is_disconnect());

        let denied = ConnectionError::Io(io::ErrorKind::PermissionDenied.into());
        assert!(!denied.is_disconnect());
        assert!(!ConnectionError::HandlerPanicked.is_disconnect());
    }

    #[test]
    fn test_error_display() {
        let err = ConnectionError::NonAscii {
            character: 'é',
            index: 3,
        };
        assert_eq!(err.to_string(), "non-ASCII character 'é' at byte 3");

        let err = ConnectionError::Handler(anyhow::anyhow!("bad command"));
        assert_eq!(err.to_string(), "handler error: bad command");
    }
}
