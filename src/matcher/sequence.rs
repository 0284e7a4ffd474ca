//! Exact Byte-Sequence Matcher
//!
//! Ends a PDU at the first occurrence of a fixed terminator such as CRLF.
//!
//! ## Restart on Mismatch
//!
//! A naive scanner that only checks whether the current byte restarts the
//! terminator works for CRLF but misses matches for self-overlapping
//! terminators: scanning `"aab"` for `"ab"` fails at the second `a` unless
//! the scanner remembers that `"a"` is already a prefix of the pattern.
//!
//! This matcher keeps a prefix table (the Knuth-Morris-Pratt failure
//! function) so a mismatch falls back to the longest pattern prefix that is
//! also a suffix of what has been seen. Every byte is examined once no matter
//! how the stream is chunked.

use super::{Matcher, CRLF};

/// Dot-terminated block terminator: CRLF "." CRLF.
pub const DOT_CRLF: &[u8] = b"\r\n.\r\n";

/// Matches up to and including an exact byte sequence.
///
/// # Example
///
/// ```
/// use netframe::matcher::{Matcher, SequenceMatcher};
///
/// let mut matcher = SequenceMatcher::crlf();
/// assert_eq!(matcher.match_bytes(b"he"), None);
/// assert_eq!(matcher.match_bytes(b"lo\r\nnext"), Some(4));
/// assert_eq!(matcher.trim(b"helo\r\n"), b"helo");
/// ```
#[derive(Debug, Clone)]
pub struct SequenceMatcher {
    pattern: Box<[u8]>,
    /// `prefix[i]`: length of the longest proper prefix of `pattern[..=i]`
    /// that is also a suffix of it
    prefix: Box<[usize]>,
    /// Progress to start from after a match or a clear
    initial: usize,
    matched: usize,
}

impl SequenceMatcher {
    /// Creates a matcher for `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is empty.
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        Self::primed(pattern, 0)
    }

    /// Creates a matcher that starts every PDU as if the first `initial`
    /// bytes of the pattern had already been seen.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is empty or `initial` is not shorter than it.
    pub fn primed(pattern: impl Into<Vec<u8>>, initial: usize) -> Self {
        let pattern = pattern.into().into_boxed_slice();
        assert!(!pattern.is_empty(), "terminator must not be empty");
        assert!(initial < pattern.len(), "priming must leave bytes to match");

        let prefix = prefix_table(&pattern);
        Self {
            pattern,
            prefix,
            initial,
            matched: initial,
        }
    }

    /// Line matcher: PDUs end at CRLF.
    pub fn crlf() -> Self {
        Self::new(CRLF)
    }

    /// Block matcher: PDUs end at CRLF "." CRLF.
    ///
    /// The command line that announced the block already ended with CRLF, so
    /// the matcher starts primed with it and an empty block (`".\r\n"`)
    /// terminates immediately.
    pub fn dot_terminated() -> Self {
        Self::primed(DOT_CRLF, CRLF.len())
    }

    /// The terminator this matcher looks for.
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Number of terminator bytes matched so far.
    pub fn progress(&self) -> usize {
        self.matched
    }
}

impl Matcher for SequenceMatcher {
    fn match_bytes(&mut self, input: &[u8]) -> Option<usize> {
        for (i, &byte) in input.iter().enumerate() {
            while self.matched > 0 && self.pattern[self.matched] != byte {
                self.matched = self.prefix[self.matched - 1];
            }
            if self.pattern[self.matched] == byte {
                self.matched += 1;
            }
            if self.matched == self.pattern.len() {
                self.matched = self.initial;
                return Some(i + 1);
            }
        }
        None
    }

    fn trailing_trim_len(&self) -> usize {
        self.pattern.len()
    }

    fn clear(&mut self) {
        self.matched = self.initial;
    }
}

fn prefix_table(pattern: &[u8]) -> Box<[usize]> {
    let mut table = vec![0usize; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table.into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `stream` in the given chunk sizes and returns the absolute end
    /// offset of the first match.
    fn first_match(matcher: &mut SequenceMatcher, stream: &[u8], chunks: &[usize]) -> Option<usize> {
        let mut offset = 0;
        for &size in chunks {
            let end = (offset + size).min(stream.len());
            if let Some(n) = matcher.match_bytes(&stream[offset..end]) {
                return Some(offset + n);
            }
            offset = end;
        }
        matcher.match_bytes(&stream[offset..]).map(|n| offset + n)
    }

    #[test]
    fn test_crlf_single_chunk() {
        let mut matcher = SequenceMatcher::crlf();
        assert_eq!(matcher.match_bytes(b"helo\r\n"), Some(6));
    }

    #[test]
    fn test_crlf_split_between_cr_and_lf() {
        let mut matcher = SequenceMatcher::crlf();
        assert_eq!(matcher.match_bytes(b"helo\r"), None);
        assert_eq!(matcher.progress(), 1);
        assert_eq!(matcher.match_bytes(b"\n"), Some(1));
        assert_eq!(matcher.progress(), 0);
    }

    #[test]
    fn test_repeated_cr_restarts() {
        let mut matcher = SequenceMatcher::crlf();
        assert_eq!(matcher.match_bytes(b"a\r\r\r\n"), Some(5));
    }

    #[test]
    fn test_bare_lf_is_not_a_terminator() {
        let mut matcher = SequenceMatcher::crlf();
        assert_eq!(matcher.match_bytes(b"a\nb\n"), None);
        assert_eq!(matcher.progress(), 0);
    }

    #[test]
    fn test_successive_lines() {
        let mut matcher = SequenceMatcher::crlf();
        let data = b"one\r\ntwo\r\n";
        let first = matcher.match_bytes(data).unwrap();
        assert_eq!(&data[..first], b"one\r\n");
        let second = matcher.match_bytes(&data[first..]).unwrap();
        assert_eq!(&data[first..first + second], b"two\r\n");
    }

    #[test]
    fn test_self_overlapping_pattern() {
        // A restart-at-current-byte scanner misses this one
        let mut matcher = SequenceMatcher::new(&b"aab"[..]);
        assert_eq!(matcher.match_bytes(b"xaaab"), Some(5));

        let mut matcher = SequenceMatcher::new(&b"abab"[..]);
        assert_eq!(matcher.match_bytes(b"abaabab!"), Some(7));
    }

    #[test]
    fn test_terminator_position_any_chunking() {
        let pattern: &[u8] = b"\r\n.\r\n";
        let stream: &[u8] = b"line one\r\n.line two\r\n\r\n.\r\ntrailing";
        let expected = stream
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|p| p + pattern.len())
            .unwrap();

        for size in 1..=stream.len() {
            let mut matcher = SequenceMatcher::new(pattern);
            let chunks = vec![size; stream.len() / size + 1];
            let end = first_match(&mut matcher, stream, &chunks).unwrap();
            assert_eq!(end, expected, "chunk size {}", size);
            assert_eq!(&stream[end - pattern.len()..end], pattern);
        }
    }

    #[test]
    fn test_dot_terminated_empty_block() {
        let mut matcher = SequenceMatcher::dot_terminated();
        assert_eq!(matcher.match_bytes(b".\r\n"), Some(3));
        assert_eq!(matcher.trim(b".\r\n"), b"");
    }

    #[test]
    fn test_dot_terminated_block() {
        let mut matcher = SequenceMatcher::dot_terminated();
        let block = b"Subject: hi\r\n\r\nbody\r\n.\r\n";
        assert_eq!(matcher.match_bytes(block), Some(block.len()));
        assert_eq!(matcher.trim(block), b"Subject: hi\r\n\r\nbody");
    }

    #[test]
    fn test_dot_at_line_start_inside_block_is_not_terminator() {
        let mut matcher = SequenceMatcher::dot_terminated();
        assert_eq!(matcher.match_bytes(b"..stuffed\r\nmore"), None);
    }

    #[test]
    fn test_clear_resets_progress() {
        let mut matcher = SequenceMatcher::crlf();
        matcher.match_bytes(b"abc\r");
        matcher.clear();
        assert_eq!(matcher.match_bytes(b"\n"), None);
    }

    #[test]
    fn test_trim_short_pdu() {
        let matcher = SequenceMatcher::crlf();
        assert_eq!(matcher.trim(b"\n"), b"");
    }

    #[test]
    #[should_panic(expected = "terminator must not be empty")]
    fn test_empty_pattern_rejected() {
        let _ = SequenceMatcher::new(Vec::new());
    }
}
