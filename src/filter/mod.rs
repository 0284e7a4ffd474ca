//! Byte Filters
//!
//! A filter sits between the socket and the matcher. Wire bytes go in, and
//! plaintext comes out for framing. Plaintext written by the handler goes in,
//! and wire bytes come out for the write queue.
//!
//! ```text
//!            read path                              write path
//!
//!   socket ──> Filter::read ──> framer      handler ──> Filter::write ──> queue
//!                  │                                         │
//!                  └──> FilterIo::send_handshake ────────────┘
//! ```
//!
//! A connection without a filter passes bytes straight through. At most one
//! filter is installed at a time; installing one mid-stream (STARTTLS) makes
//! the engine discard whatever unfiltered bytes were left in that read.
//!
//! Filters never touch the socket or the connection directly. Everything
//! they produce goes through [`FilterIo`], which the engine turns into
//! framer input and write-interest requests once the filter call returns.

pub mod channel;
pub mod tls;

pub use channel::{ChannelStatus, HandshakeStatus, RustlsChannel, SecureChannel, Unwrapped};
pub use tls::TlsFilter;

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;

use crate::connection::WriteQueue;

/// Errors raised by a filter.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The TLS engine rejected the peer's data
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Moving bytes through the engine failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The handshake reported a state it cannot be in
    #[error("unexpected handshake status: {0:?}")]
    UnexpectedHandshakeStatus(HandshakeStatus),

    /// The peer closed the secure channel
    #[error("peer closed the secure channel")]
    PeerClosed,
}

/// The engine side of a filter call.
pub struct FilterIo<'a> {
    queue: &'a WriteQueue,
    plaintext: BytesMut,
    flush: bool,
    paused: bool,
}

/// What a filter call produced, collected by the connection afterwards.
#[derive(Debug, Default)]
pub struct FilterOutput {
    /// Plaintext to hand to the framer
    pub plaintext: BytesMut,
    /// Write interest should be requested
    pub flush: bool,
    /// The filter waits for the write queue to drain
    pub paused: bool,
}

impl<'a> FilterIo<'a> {
    pub fn new(queue: &'a WriteQueue) -> Self {
        Self {
            queue,
            plaintext: BytesMut::new(),
            flush: false,
            paused: false,
        }
    }

    /// Hands plaintext to the framer.
    pub fn deliver(&mut self, plaintext: &[u8]) {
        self.plaintext.extend_from_slice(plaintext);
    }

    /// Queues wire bytes behind everything already queued.
    pub fn send(&mut self, wire: Bytes) {
        self.queue.push(wire);
    }

    /// Queues handshake bytes ahead of application data.
    pub fn send_handshake(&mut self, wire: Bytes) {
        self.queue.push_handshake(wire);
    }

    /// True while application bytes queued for the socket have not gone out.
    pub fn has_pending_data(&self) -> bool {
        self.queue.has_pending_data()
    }

    /// Asks the engine to flush the write queue.
    pub fn request_flush(&mut self) {
        self.flush = true;
    }

    /// Asks the engine to call [`Filter::flush`] again once the write queue
    /// has drained.
    pub fn pause_until_drained(&mut self) {
        self.paused = true;
        self.flush = true;
    }

    pub fn finish(self) -> FilterOutput {
        FilterOutput {
            plaintext: self.plaintext,
            flush: self.flush,
            paused: self.paused,
        }
    }
}

/// A byte transform interposed between socket and matcher.
pub trait Filter: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Processes bytes read from the wire.
    fn read(&mut self, io: &mut FilterIo<'_>, wire: &[u8]) -> Result<(), FilterError>;

    /// Processes plaintext written by the handler.
    fn write(&mut self, io: &mut FilterIo<'_>, data: Bytes) -> Result<(), FilterError>;

    /// Called when the write queue drained after
    /// [`FilterIo::pause_until_drained`].
    fn flush(&mut self, io: &mut FilterIo<'_>) -> Result<(), FilterError>;

    /// Emits whatever closing bytes the protocol needs.
    fn close(&mut self, io: &mut FilterIo<'_>) -> Result<(), FilterError>;
}
