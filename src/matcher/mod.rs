//! PDU Matchers
//!
//! TCP is a stream protocol: a single read may carry half a command, or three
//! commands and the start of a fourth. A [`Matcher`] is the piece that knows
//! where one application message (PDU) ends.
//!
//! ## How Matching Works
//!
//! The connection keeps unconsumed bytes in its read buffer and calls
//! [`Matcher::match_bytes`] with the bytes the matcher has not seen yet:
//!
//! ```text
//!  read buffer:  [ h e ] [ l o \r \n Q U ]
//!                 ^pdu    ^unscanned
//!
//!  match_bytes("lo\r\nQU") -> Some(4)     PDU = "helo\r\n", trimmed to "helo"
//!  match_bytes("QU")       -> None        progress kept, wait for more bytes
//! ```
//!
//! Matchers are stateful: progress carries across calls, so a terminator split
//! across two TCP segments is still found. Completing a match resets that
//! progress for the next PDU.
//!
//! ## Variants
//!
//! - [`SequenceMatcher`]: ends a PDU at an exact byte sequence (CRLF, or
//!   CRLF "." CRLF for dot-terminated blocks)
//! - [`CountingMatcher`]: ends a PDU after a fixed number of bytes
//! - [`AllMatcher`]: every read is one PDU, for raw byte delivery

pub mod all;
pub mod counting;
pub mod sequence;

pub use all::AllMatcher;
pub use counting::CountingMatcher;
pub use sequence::SequenceMatcher;

use std::fmt;

/// Carriage return.
pub const CR: u8 = b'\r';

/// Line feed.
pub const LF: u8 = b'\n';

/// The line terminator used by text protocols.
pub const CRLF: &[u8] = b"\r\n";

/// Locates the end of the next PDU in a byte stream.
pub trait Matcher: Send + fmt::Debug {
    /// Scans `input`, the bytes of the current PDU this matcher has not seen
    /// yet.
    ///
    /// Returns the offset into `input` just past the end of the PDU, or
    /// `None` when every byte of `input` was consumed without completing one.
    fn match_bytes(&mut self, input: &[u8]) -> Option<usize>;

    /// Number of trailing terminator bytes a matched PDU carries.
    fn trailing_trim_len(&self) -> usize {
        0
    }

    /// Strips the terminator from a matched PDU.
    fn trim<'a>(&self, pdu: &'a [u8]) -> &'a [u8] {
        let cut = self.trailing_trim_len().min(pdu.len());
        &pdu[..pdu.len() - cut]
    }

    /// Resets scan progress, e.g. when a new message framing begins.
    fn clear(&mut self);
}

impl<M: Matcher + ?Sized> Matcher for Box<M> {
    fn match_bytes(&mut self, input: &[u8]) -> Option<usize> {
        (**self).match_bytes(input)
    }

    fn trailing_trim_len(&self) -> usize {
        (**self).trailing_trim_len()
    }

    fn trim<'a>(&self, pdu: &'a [u8]) -> &'a [u8] {
        (**self).trim(pdu)
    }

    fn clear(&mut self) {
        (**self).clear()
    }
}
