//! TLS Filter
//!
//! Runs a TLS session over a connection that may already have carried
//! plaintext (STARTTLS). The handler installs the filter right after queuing
//! its "go ahead" reply; from then on every read and write passes through
//! here.
//!
//! ## Handshake State Machine
//!
//! ```text
//!            ┌──────────────┐  no ciphertext buffered
//!   read ───>│  NeedUnwrap  │──────────────────────────> wait for next read
//!            └──────┬───────┘
//!                   │ records consumed
//!                   ▼
//!            ┌──────────────┐
//!            │   NeedTask   │  run delegated work
//!            └──────┬───────┘
//!                   ▼
//!            ┌──────────────┐  application data still queued
//!            │   NeedWrap   │──────────────────────────> pause until drained
//!            └──────┬───────┘                            (resumed by flush)
//!                   │ handshake records queued ahead of data
//!                   ▼
//!            ┌──────────────┐
//!            │   Finished   │  flush buffered writes, unwrap early data
//!            └──────────────┘
//! ```
//!
//! Once finished the filter is complete and never goes back into the state
//! machine. Writes issued before completion are held here and sent, in
//! order, the moment the handshake finishes.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use super::channel::{ChannelStatus, HandshakeStatus, RustlsChannel, SecureChannel};
use super::{Filter, FilterError, FilterIo};

/// TLS filter over a [`SecureChannel`].
pub struct TlsFilter<C = RustlsChannel> {
    channel: C,
    /// The handshake finished
    complete: bool,
    /// Ciphertext the channel has not consumed yet
    incoming: BytesMut,
    /// Plaintext written before the handshake finished
    pending_writes: VecDeque<Bytes>,
    closed: bool,
}

impl TlsFilter<RustlsChannel> {
    /// Creates a server-side TLS filter.
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, FilterError> {
        Ok(Self::with_channel(RustlsChannel::new(config)?))
    }
}

impl<C: SecureChannel> TlsFilter<C> {
    pub fn with_channel(channel: C) -> Self {
        Self {
            channel,
            complete: false,
            incoming: BytesMut::new(),
            pending_writes: VecDeque::new(),
            closed: false,
        }
    }

    /// True once the handshake finished.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Advances the handshake as far as buffered input and the write queue
    /// allow.
    fn drive(&mut self, io: &mut FilterIo<'_>) -> Result<(), FilterError> {
        while !self.complete {
            let status = self.channel.handshake_status();
            trace!(?status, buffered = self.incoming.len(), "TLS handshake step");

            match status {
                HandshakeStatus::NeedUnwrap => {
                    if self.incoming.is_empty() {
                        return Ok(());
                    }
                    let mut plain = BytesMut::new();
                    let unwrapped = self.channel.unwrap(&self.incoming, &mut plain)?;
                    self.incoming.advance(unwrapped.consumed);
                    if !plain.is_empty() {
                        io.deliver(&plain);
                    }
                    match unwrapped.status {
                        ChannelStatus::Closed => return Err(FilterError::PeerClosed),
                        ChannelStatus::BufferUnderflow => return Ok(()),
                        ChannelStatus::Ok if unwrapped.consumed == 0 => return Ok(()),
                        ChannelStatus::Ok => {}
                    }
                }
                HandshakeStatus::NeedWrap => {
                    // The reply that announced TLS must reach the peer in
                    // plaintext before any handshake record
                    if io.has_pending_data() {
                        debug!("TLS handshake paused until queued data drains");
                        io.pause_until_drained();
                        return Ok(());
                    }
                    let mut wire = BytesMut::new();
                    if self.channel.wrap(&[], &mut wire)? == 0 {
                        return Ok(());
                    }
                    io.send_handshake(wire.freeze());
                    io.request_flush();
                }
                HandshakeStatus::NeedTask => self.channel.run_delegated_tasks()?,
                HandshakeStatus::Finished => {
                    self.complete = true;
                    debug!(
                        buffered_writes = self.pending_writes.len(),
                        "TLS handshake complete"
                    );
                    while let Some(data) = self.pending_writes.pop_front() {
                        self.send_application(io, &data)?;
                    }
                    self.read_application(io)?;
                }
                HandshakeStatus::NotHandshaking => {
                    return Err(FilterError::UnexpectedHandshakeStatus(status));
                }
            }
        }
        Ok(())
    }

    fn read_application(&mut self, io: &mut FilterIo<'_>) -> Result<(), FilterError> {
        loop {
            let mut plain = BytesMut::new();
            let unwrapped = self.channel.unwrap(&self.incoming, &mut plain)?;
            self.incoming.advance(unwrapped.consumed);
            if !plain.is_empty() {
                io.deliver(&plain);
            }
            match unwrapped.status {
                ChannelStatus::Closed => return Err(FilterError::PeerClosed),
                ChannelStatus::BufferUnderflow => return Ok(()),
                ChannelStatus::Ok => {}
            }
        }
    }

    fn send_application(&mut self, io: &mut FilterIo<'_>, data: &[u8]) -> Result<(), FilterError> {
        let mut wire = BytesMut::new();
        self.channel.wrap(data, &mut wire)?;
        if !wire.is_empty() {
            io.send(wire.freeze());
            io.request_flush();
        }
        Ok(())
    }
}

impl<C: SecureChannel> Filter for TlsFilter<C> {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn read(&mut self, io: &mut FilterIo<'_>, wire: &[u8]) -> Result<(), FilterError> {
        self.incoming.extend_from_slice(wire);
        if self.complete {
            self.read_application(io)
        } else {
            self.drive(io)
        }
    }

    fn write(&mut self, io: &mut FilterIo<'_>, data: Bytes) -> Result<(), FilterError> {
        if self.complete {
            self.send_application(io, &data)
        } else {
            self.pending_writes.push_back(data);
            Ok(())
        }
    }

    fn flush(&mut self, io: &mut FilterIo<'_>) -> Result<(), FilterError> {
        if self.complete {
            return Ok(());
        }
        self.drive(io)
    }

    fn close(&mut self, io: &mut FilterIo<'_>) -> Result<(), FilterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel.close_outbound();

        let mut wire = BytesMut::new();
        if self.channel.wrap(&[], &mut wire)? > 0 {
            io.send(wire.freeze());
            io.request_flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::WriteQueue;
    use crate::filter::channel::Unwrapped;

    /// A toy channel: the client sends "CH", the server answers "SH", the
    /// client finishes with "CF". After that bytes pass through unchanged
    /// and "BYE" closes the channel. Wrapped application data is bracketed.
    #[derive(Debug, Default)]
    struct FakeChannel {
        stage: u8,
        broken: bool,
        close_pending: bool,
    }

    impl SecureChannel for FakeChannel {
        fn handshake_status(&self) -> HandshakeStatus {
            if self.broken {
                return HandshakeStatus::NotHandshaking;
            }
            match self.stage {
                0 | 3 => HandshakeStatus::NeedUnwrap,
                1 => HandshakeStatus::NeedTask,
                2 => HandshakeStatus::NeedWrap,
                _ => HandshakeStatus::Finished,
            }
        }

        fn unwrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<Unwrapped, FilterError> {
            let underflow = Unwrapped {
                consumed: 0,
                status: ChannelStatus::BufferUnderflow,
            };
            match self.stage {
                0 | 3 if src.len() < 2 => Ok(underflow),
                0 | 3 => {
                    self.stage += 1;
                    Ok(Unwrapped {
                        consumed: 2,
                        status: ChannelStatus::Ok,
                    })
                }
                _ if src.is_empty() => Ok(underflow),
                _ if src.starts_with(b"BYE") => Ok(Unwrapped {
                    consumed: 3,
                    status: ChannelStatus::Closed,
                }),
                _ => {
                    dst.extend_from_slice(src);
                    Ok(Unwrapped {
                        consumed: src.len(),
                        status: ChannelStatus::Ok,
                    })
                }
            }
        }

        fn wrap(&mut self, src: &[u8], dst: &mut BytesMut) -> Result<usize, FilterError> {
            let before = dst.len();
            if self.stage == 2 {
                dst.extend_from_slice(b"SH");
                self.stage = 3;
            } else if !src.is_empty() {
                dst.extend_from_slice(b"<");
                dst.extend_from_slice(src);
                dst.extend_from_slice(b">");
            }
            if std::mem::take(&mut self.close_pending) {
                dst.extend_from_slice(b"CN");
            }
            Ok(dst.len() - before)
        }

        fn run_delegated_tasks(&mut self) -> Result<(), FilterError> {
            if self.stage == 1 {
                self.stage = 2;
            }
            Ok(())
        }

        fn close_outbound(&mut self) {
            self.close_pending = true;
        }
    }

    fn drain_all(queue: &WriteQueue) -> Vec<u8> {
        let mut sent = Vec::new();
        queue.drain(|b| {
            sent.extend_from_slice(b);
            Ok(b.len())
        });
        sent
    }

    #[test]
    fn test_handshake_in_one_read() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"CHCF").unwrap();
        let out = io.finish();

        assert!(filter.is_complete());
        assert!(out.flush);
        assert!(!out.paused);
        assert!(out.plaintext.is_empty());
        assert_eq!(drain_all(&queue), b"SH");
    }

    #[test]
    fn test_handshake_across_reads() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"C").unwrap();
        assert!(!io.finish().flush);
        assert!(queue.is_empty());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"H").unwrap();
        assert!(io.finish().flush);
        assert!(!filter.is_complete());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"CF").unwrap();
        assert!(filter.is_complete());
    }

    #[test]
    fn test_writes_before_completion_are_buffered_in_order() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.write(&mut io, Bytes::from_static(b"a")).unwrap();
        filter.write(&mut io, Bytes::from_static(b"b")).unwrap();
        assert!(queue.is_empty());

        filter.read(&mut io, b"CHCF").unwrap();
        assert_eq!(drain_all(&queue), b"SH<a><b>");

        filter.write(&mut io, Bytes::from_static(b"c")).unwrap();
        assert_eq!(drain_all(&queue), b"<c>");
    }

    #[test]
    fn test_pauses_while_plaintext_reply_is_queued() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"220 ready\r\n"));
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"CH").unwrap();
        let out = io.finish();
        assert!(out.paused);
        assert!(out.flush);

        // The engine drains the queue, then resumes the filter
        assert_eq!(drain_all(&queue), b"220 ready\r\n");

        let mut io = FilterIo::new(&queue);
        filter.flush(&mut io).unwrap();
        assert!(!io.finish().paused);
        assert_eq!(drain_all(&queue), b"SH");
    }

    #[test]
    fn test_application_data_with_final_flight() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"CHCFEHLO x\r\n").unwrap();
        assert_eq!(&io.finish().plaintext[..], b"EHLO x\r\n");
    }

    #[test]
    fn test_peer_close_after_data() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"CHCF").unwrap();

        let mut io = FilterIo::new(&queue);
        let result = filter.read(&mut io, b"BYE");
        assert!(matches!(result, Err(FilterError::PeerClosed)));
    }

    #[test]
    fn test_not_handshaking_before_completion_is_an_error() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel {
            broken: true,
            ..Default::default()
        });

        let mut io = FilterIo::new(&queue);
        let result = filter.read(&mut io, b"CH");
        assert!(matches!(
            result,
            Err(FilterError::UnexpectedHandshakeStatus(
                HandshakeStatus::NotHandshaking
            ))
        ));
    }

    #[test]
    fn test_close_sends_close_notify_once() {
        let queue = WriteQueue::new();
        let mut filter = TlsFilter::with_channel(FakeChannel::default());

        let mut io = FilterIo::new(&queue);
        filter.read(&mut io, b"CHCF").unwrap();
        drain_all(&queue);

        let mut io = FilterIo::new(&queue);
        filter.close(&mut io).unwrap();
        filter.close(&mut io).unwrap();
        assert!(io.finish().flush);
        assert_eq!(drain_all(&queue), b"CN");
    }
}
