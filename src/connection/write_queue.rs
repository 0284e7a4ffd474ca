//! Outgoing Write Queue
//!
//! Handlers write from worker threads; the IO thread drains the queue when
//! the socket reports writable. The queue is the only state both sides touch
//! on the write path, so it carries its own lock.
//!
//! ```text
//!   push("250 OK\r\n")  ──┐
//!   push("354 go\r\n")  ──┤     ┌──────────┬──────────┬──────────┐
//!                         └────>│ 250 OK.. │ 354 go.. │   ...    │───> socket
//!   push_handshake(..)  ───────>└──────────┴──────────┴──────────┘
//!                               front (partial remainder stays here)
//! ```
//!
//! A chunk the socket only partly accepted is requeued at the front, so
//! bytes always leave in the order they were queued. Handshake records from
//! the TLS filter jump ahead of queued application data but never ahead of
//! a chunk that has already started going out.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use crate::util::lock;

/// Outcome of one [`WriteQueue::drain`] pass.
#[derive(Debug)]
pub enum Drain {
    /// Everything queued was written
    Complete {
        written: usize,
        close_after_write: bool,
    },
    /// The socket stopped accepting bytes; the rest stays queued
    Partial { written: usize },
    /// The socket failed
    Failed(io::Error),
}

#[derive(Debug)]
struct Chunk {
    bytes: Bytes,
    handshake: bool,
    /// Part of this chunk has already been written
    started: bool,
}

#[derive(Debug, Default)]
struct Inner {
    chunks: VecDeque<Chunk>,
    pending_bytes: usize,
    close_after_write: bool,
}

/// FIFO of byte chunks waiting for the socket.
#[derive(Debug, Default)]
pub struct WriteQueue {
    inner: Mutex<Inner>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends application bytes and returns the number of bytes pending.
    pub fn push(&self, bytes: Bytes) -> usize {
        let mut inner = lock(&self.inner);
        if !bytes.is_empty() {
            inner.pending_bytes += bytes.len();
            inner.chunks.push_back(Chunk {
                bytes,
                handshake: false,
                started: false,
            });
        }
        inner.pending_bytes
    }

    /// Queues handshake bytes ahead of application data that has not started
    /// going out yet.
    pub fn push_handshake(&self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = lock(&self.inner);
        let at = inner
            .chunks
            .iter()
            .position(|c| !c.handshake && !c.started)
            .unwrap_or(inner.chunks.len());
        inner.pending_bytes += bytes.len();
        inner.chunks.insert(
            at,
            Chunk {
                bytes,
                handshake: true,
                started: false,
            },
        );
    }

    /// True when application (non-handshake) bytes are still queued.
    pub fn has_pending_data(&self) -> bool {
        lock(&self.inner).chunks.iter().any(|c| !c.handshake)
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).chunks.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        lock(&self.inner).pending_bytes
    }

    /// Asks for the connection to be closed once the queue is empty.
    ///
    /// Returns whether anything is still queued.
    pub fn mark_close_after_write(&self) -> bool {
        let mut inner = lock(&self.inner);
        inner.close_after_write = true;
        !inner.chunks.is_empty()
    }

    pub fn close_after_write(&self) -> bool {
        lock(&self.inner).close_after_write
    }

    /// Drops every queued chunk, returning how many bytes were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = lock(&self.inner);
        inner.chunks.clear();
        std::mem::take(&mut inner.pending_bytes)
    }

    /// Writes queued chunks in order until the writer stops accepting bytes.
    ///
    /// The writer follows non-blocking socket semantics: it returns how many
    /// bytes it took, `Ok(0)` or `WouldBlock` when it cannot take any more
    /// right now.
    pub fn drain<W>(&self, mut write: W) -> Drain
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut inner = lock(&self.inner);
        let mut written = 0;

        while let Some(mut chunk) = inner.chunks.pop_front() {
            match write(&chunk.bytes) {
                Ok(n) if n >= chunk.bytes.len() => {
                    written += chunk.bytes.len();
                    inner.pending_bytes -= chunk.bytes.len();
                }
                Ok(n) => {
                    written += n;
                    inner.pending_bytes -= n;
                    if n > 0 {
                        chunk.bytes = chunk.bytes.slice(n..);
                        chunk.started = true;
                    }
                    inner.chunks.push_front(chunk);
                    return Drain::Partial { written };
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    inner.chunks.push_front(chunk);
                    return Drain::Partial { written };
                }
                Err(e) => {
                    inner.chunks.push_front(chunk);
                    return Drain::Failed(e);
                }
            }
        }

        Drain::Complete {
            written,
            close_after_write: inner.close_after_write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A socket that accepts at most `budget` bytes per drain pass.
    struct FakeSocket {
        sent: Vec<u8>,
        budget: usize,
    }

    impl FakeSocket {
        fn new(budget: usize) -> Self {
            Self {
                sent: Vec::new(),
                budget,
            }
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.sent.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_drains_in_order() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"one "));
        queue.push(Bytes::from_static(b"two "));
        assert_eq!(queue.push(Bytes::from_static(b"three")), 13);

        let mut socket = FakeSocket::new(usize::MAX);
        match queue.drain(|b| socket.write(b)) {
            Drain::Complete {
                written,
                close_after_write,
            } => {
                assert_eq!(written, 13);
                assert!(!close_after_write);
            }
            other => panic!("unexpected drain result: {:?}", other),
        }
        assert_eq!(socket.sent, b"one two three");
        assert!(queue.is_empty());
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[test]
    fn test_partial_write_requeues_remainder_at_front() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"hello "));
        queue.push(Bytes::from_static(b"world"));

        let mut socket = FakeSocket::new(3);
        assert!(matches!(
            queue.drain(|b| socket.write(b)),
            Drain::Partial { written: 3 }
        ));
        assert_eq!(queue.pending_bytes(), 8);

        // Later writes go behind the remainder
        queue.push(Bytes::from_static(b"!"));

        socket.budget = usize::MAX;
        assert!(matches!(
            queue.drain(|b| socket.write(b)),
            Drain::Complete { written: 9, .. }
        ));
        assert_eq!(socket.sent, b"hello world!");
    }

    #[test]
    fn test_zero_byte_write_keeps_chunk() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"abc"));

        assert!(matches!(queue.drain(|_| Ok(0)), Drain::Partial { written: 0 }));
        assert_eq!(queue.pending_bytes(), 3);
    }

    #[test]
    fn test_failure_is_reported() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"abc"));

        let result = queue.drain(|_| Err(io::ErrorKind::BrokenPipe.into()));
        match result {
            Drain::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected drain result: {:?}", other),
        }
    }

    #[test]
    fn test_handshake_bytes_jump_queued_data() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"app"));
        queue.push_handshake(Bytes::from_static(b"hs1"));
        queue.push_handshake(Bytes::from_static(b"hs2"));

        assert!(queue.has_pending_data());

        let mut socket = FakeSocket::new(usize::MAX);
        queue.drain(|b| socket.write(b));
        assert_eq!(socket.sent, b"hs1hs2app");
    }

    #[test]
    fn test_handshake_bytes_never_split_a_started_chunk() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"abcdef"));

        let mut socket = FakeSocket::new(2);
        queue.drain(|b| socket.write(b));

        queue.push_handshake(Bytes::from_static(b"HS"));
        socket.budget = usize::MAX;
        queue.drain(|b| socket.write(b));

        assert_eq!(socket.sent, b"abcdefHS");
    }

    #[test]
    fn test_only_handshake_bytes_is_not_pending_data() {
        let queue = WriteQueue::new();
        queue.push_handshake(Bytes::from_static(b"hs"));
        assert!(!queue.has_pending_data());
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_close_after_write() {
        let queue = WriteQueue::new();
        assert!(!queue.mark_close_after_write());

        queue.push(Bytes::from_static(b"bye"));
        assert!(queue.mark_close_after_write());

        assert!(matches!(
            queue.drain(|b| Ok(b.len())),
            Drain::Complete {
                close_after_write: true,
                ..
            }
        ));
    }

    #[test]
    fn test_clear_discards_everything() {
        let queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"12345"));
        queue.push_handshake(Bytes::from_static(b"67"));

        assert_eq!(queue.clear(), 7);
        assert!(queue.is_empty());
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let queue = WriteQueue::new();
        assert_eq!(queue.push(Bytes::new()), 0);
        assert!(queue.is_empty());
    }
}
