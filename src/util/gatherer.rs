//! Input Gatherer
//!
//! The engine hands a handler every complete PDU in one piece, but it hands
//! over *partial* input too: when a line does not fit in the read buffer the
//! buffer is delivered with `matched = false` and then cleared. Handlers
//! that want the whole line anyway collect the pieces here until the matched
//! tail arrives.
//!
//! The gatherer is bounded. Once the limit is crossed it stops storing bytes
//! and remembers that it overflowed, so the handler can answer with its
//! protocol's "line too long" reply when the terminator finally shows up.

use bytes::{Bytes, BytesMut};

/// Accumulates input chunks up to a size limit.
///
/// # Example
///
/// ```
/// use netframe::util::InputGatherer;
///
/// let mut gatherer = InputGatherer::new(64, 1024);
/// gatherer.add(b"HELO ");
/// gatherer.add(b"example.com");
/// assert_eq!(gatherer.as_bytes(), b"HELO example.com");
/// assert!(!gatherer.overflowed());
/// ```
#[derive(Debug, Clone)]
pub struct InputGatherer {
    data: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl InputGatherer {
    /// Creates a gatherer with an initial capacity and a hard limit.
    pub fn new(initial_capacity: usize, limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(initial_capacity.min(limit)),
            limit,
            overflowed: false,
        }
    }

    /// Appends a chunk; bytes past the limit are dropped and flag overflow.
    pub fn add(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.data.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.data.clear();
            return;
        }
        self.data.extend_from_slice(chunk);
    }

    /// Removes `n` bytes from the end (e.g. a terminator).
    pub fn trim(&mut self, n: usize) {
        let keep = self.data.len().saturating_sub(n);
        self.data.truncate(keep);
    }

    /// Whether the limit was exceeded since the last [`clear`](Self::clear).
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Lossy ASCII/UTF-8 rendering, for line based protocols.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Takes the gathered bytes, leaving the gatherer empty and reset.
    pub fn take(&mut self) -> Bytes {
        self.overflowed = false;
        self.data.split().freeze()
    }

    /// Forgets everything gathered so far, including the overflow flag.
    pub fn clear(&mut self) {
        self.data.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gathers_chunks_in_order() {
        let mut gatherer = InputGatherer::new(4, 100);
        gatherer.add(b"abc");
        gatherer.add(b"def");
        assert_eq!(gatherer.as_bytes(), b"abcdef");
        assert_eq!(gatherer.len(), 6);
    }

    #[test]
    fn test_overflow_drops_everything_until_cleared() {
        let mut gatherer = InputGatherer::new(4, 8);
        gatherer.add(b"12345");
        gatherer.add(b"67890");
        assert!(gatherer.overflowed());
        assert!(gatherer.is_empty());

        gatherer.add(b"x");
        assert!(gatherer.is_empty());

        gatherer.clear();
        gatherer.add(b"ok");
        assert!(!gatherer.overflowed());
        assert_eq!(gatherer.as_bytes(), b"ok");
    }

    #[test]
    fn test_trim_and_take() {
        let mut gatherer = InputGatherer::new(16, 64);
        gatherer.add(b"QUIT\r\n");
        gatherer.trim(2);
        assert_eq!(gatherer.to_text(), "QUIT");

        let taken = gatherer.take();
        assert_eq!(&taken[..], b"QUIT");
        assert!(gatherer.is_empty());
    }

    #[test]
    fn test_trim_more_than_len() {
        let mut gatherer = InputGatherer::new(4, 64);
        gatherer.add(b"a");
        gatherer.trim(5);
        assert!(gatherer.is_empty());
    }
}
