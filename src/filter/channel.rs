//! Secure Channel Primitive
//!
//! The TLS filter drives a handshake state machine over a [`SecureChannel`]:
//! an engine that never touches a socket itself. Ciphertext is handed in
//! with [`unwrap`](SecureChannel::unwrap), ciphertext to send is pulled out
//! with [`wrap`](SecureChannel::wrap), and
//! [`handshake_status`](SecureChannel::handshake_status) says which of the
//! two the engine needs next.
//!
//! [`RustlsChannel`] maps this onto `rustls::ServerConnection`:
//!
//! | status           | rustls condition                                   |
//! |------------------|----------------------------------------------------|
//! | `NeedTask`       | ciphertext read in but `process_new_packets` not run |
//! | `NeedWrap`       | `wants_write()`                                    |
//! | `NeedUnwrap`     | `is_handshaking()` and nothing to write             |
//! | `Finished`       | handshake done, nothing left to write              |
//! | `NotHandshaking` | the channel was closed                             |

use bytes::BytesMut;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use super::FilterError;

/// Size of the scratch buffer used to pull plaintext out of rustls.
const PLAINTEXT_CHUNK: usize = 4096;

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Needs ciphertext from the peer
    NeedUnwrap,
    /// Has handshake records to send
    NeedWrap,
    /// Has work to run before it can continue
    NeedTask,
    /// The handshake just completed
    Finished,
    /// No handshake in progress
    NotHandshaking,
}

/// Result status of an unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Ok,
    /// Not enough ciphertext to make progress
    BufferUnderflow,
    /// The peer closed the channel
    Closed,
}

/// Result of [`SecureChannel::unwrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwrapped {
    /// Ciphertext bytes taken from the source
    pub consumed: usize,
    pub status: ChannelStatus,
}

/// A socket-less secure channel engine.
pub trait SecureChannel: Send {
    fn handshake_status(&self) -> HandshakeStatus;

    /// Consumes ciphertext from `src`, appending any plaintext to `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<Unwrapped, FilterError>;

    /// Encrypts `src` (possibly empty) and appends every pending record to
    /// `dst`. Returns the number of bytes appended.
    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<usize, FilterError>;

    /// Runs work the handshake deferred.
    fn run_delegated_tasks(&mut self) -> Result<(), FilterError>;

    /// Queues the close notification for the peer.
    fn close_outbound(&mut self);
}

/// [`SecureChannel`] over a rustls server connection.
pub struct RustlsChannel {
    conn: rustls::ServerConnection,
    /// Ciphertext read in but not yet processed
    unprocessed: bool,
    closed: bool,
}

impl RustlsChannel {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, FilterError> {
        Ok(Self {
            conn: rustls::ServerConnection::new(config)?,
            unprocessed: false,
            closed: false,
        })
    }

    /// The SNI name the client asked for, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }

    fn process(&mut self) -> Result<(), FilterError> {
        self.unprocessed = false;
        let state = self.conn.process_new_packets()?;
        if state.peer_has_closed() && state.plaintext_bytes_to_read() == 0 {
            self.closed = true;
        }
        Ok(())
    }

    /// Moves decrypted plaintext into `dst`.
    fn drain_plaintext(&mut self, dst: &mut BytesMut) -> Result<(), FilterError> {
        let mut chunk = [0u8; PLAINTEXT_CHUNK];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => dst.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.closed = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl fmt::Debug for RustlsChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsChannel")
            .field("handshaking", &self.conn.is_handshaking())
            .field("unprocessed", &self.unprocessed)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SecureChannel for RustlsChannel {
    fn handshake_status(&self) -> HandshakeStatus {
        if self.closed {
            HandshakeStatus::NotHandshaking
        } else if self.unprocessed {
            HandshakeStatus::NeedTask
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::Finished
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<Unwrapped, FilterError> {
        let before = dst.len();

        // Records that arrived with the last handshake flight were decrypted
        // already; hand those out before reading more
        if !self.conn.is_handshaking() {
            self.drain_plaintext(dst)?;
        }

        let mut consumed = 0;
        if !src.is_empty() && !self.closed {
            let mut rd = src;
            consumed = self.conn.read_tls(&mut rd)?;

            if self.conn.is_handshaking() {
                self.unprocessed = true;
                return Ok(Unwrapped {
                    consumed,
                    status: ChannelStatus::Ok,
                });
            }

            self.process()?;
            self.drain_plaintext(dst)?;
        }

        let status = if self.closed {
            ChannelStatus::Closed
        } else if consumed == 0 && dst.len() == before {
            ChannelStatus::BufferUnderflow
        } else {
            ChannelStatus::Ok
        };
        Ok(Unwrapped { consumed, status })
    }

    fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<usize, FilterError> {
        let mut out = Vec::new();
        let mut rest = src;
        loop {
            // rustls stops taking plaintext once its outgoing record buffer
            // is full, so records are drained between partial writes
            let taken = if rest.is_empty() {
                0
            } else {
                self.conn.writer().write(rest)?
            };
            rest = &rest[taken..];

            let before = out.len();
            while self.conn.wants_write() {
                if self.conn.write_tls(&mut out)? == 0 {
                    break;
                }
            }

            if rest.is_empty() {
                break;
            }
            if taken == 0 && out.len() == before {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
        }
        dst.extend_from_slice(&out);
        Ok(out.len())
    }

    fn run_delegated_tasks(&mut self) -> Result<(), FilterError> {
        if self.unprocessed {
            self.process()?;
        }
        Ok(())
    }

    fn close_outbound(&mut self) {
        self.conn.send_close_notify();
    }
}
