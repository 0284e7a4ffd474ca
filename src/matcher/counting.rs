//! Fixed-Count Matcher
//!
//! Ends a PDU after exactly `target` bytes. Used for length-prefixed payloads
//! such as literals announced by a preceding command line.

use super::Matcher;

/// Matches a fixed number of bytes.
///
/// A target of zero completes immediately with an empty PDU.
///
/// # Example
///
/// ```
/// use netframe::matcher::{CountingMatcher, Matcher};
///
/// let mut matcher = CountingMatcher::new(5);
/// assert_eq!(matcher.match_bytes(b"ab"), None);
/// assert_eq!(matcher.match_bytes(b"cd"), None);
/// assert_eq!(matcher.match_bytes(b"eXYZ"), Some(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CountingMatcher {
    target: usize,
    matched: usize,
}

impl CountingMatcher {
    pub fn new(target: usize) -> Self {
        Self { target, matched: 0 }
    }

    /// Changes the target and starts counting from zero.
    pub fn set_target(&mut self, target: usize) {
        self.target = target;
        self.matched = 0;
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes still needed to complete the current PDU.
    pub fn remaining(&self) -> usize {
        self.target - self.matched
    }
}

impl Matcher for CountingMatcher {
    fn match_bytes(&mut self, input: &[u8]) -> Option<usize> {
        let needed = self.target - self.matched;
        if input.len() >= needed {
            self.matched = 0;
            Some(needed)
        } else {
            self.matched += input.len();
            None
        }
    }

    fn clear(&mut self) {
        self.matched = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_count_in_one_call() {
        let mut matcher = CountingMatcher::new(3);
        assert_eq!(matcher.match_bytes(b"abc"), Some(3));
        assert_eq!(matcher.remaining(), 3);
    }

    #[test]
    fn test_consumes_no_more_than_needed() {
        let mut matcher = CountingMatcher::new(3);
        assert_eq!(matcher.match_bytes(b"abcdef"), Some(3));
    }

    #[test]
    fn test_completes_on_target_byte_for_any_chunking() {
        let target = 7;
        let stream = [0x55u8; 7];

        for size in 1..=target {
            let mut matcher = CountingMatcher::new(target);
            let mut fed = 0;
            let mut completed_at = None;

            for chunk in stream.chunks(size) {
                match matcher.match_bytes(chunk) {
                    Some(n) => {
                        completed_at = Some(fed + n);
                        break;
                    }
                    None => fed += chunk.len(),
                }
                assert!(fed < target, "no completion before the target byte");
            }

            assert_eq!(completed_at, Some(target), "chunk size {}", size);
        }
    }

    #[test]
    fn test_two_two_one_segments() {
        let mut matcher = CountingMatcher::new(5);
        assert_eq!(matcher.match_bytes(b"12"), None);
        assert_eq!(matcher.match_bytes(b"34"), None);
        assert_eq!(matcher.remaining(), 1);
        assert_eq!(matcher.match_bytes(b"5"), Some(1));
    }

    #[test]
    fn test_zero_target() {
        let mut matcher = CountingMatcher::new(0);
        assert_eq!(matcher.match_bytes(b"anything"), Some(0));
    }

    #[test]
    fn test_set_target_and_clear() {
        let mut matcher = CountingMatcher::new(10);
        matcher.match_bytes(b"1234");
        assert_eq!(matcher.remaining(), 6);

        matcher.clear();
        assert_eq!(matcher.remaining(), 10);

        matcher.match_bytes(b"12");
        matcher.set_target(2);
        assert_eq!(matcher.target(), 2);
        assert_eq!(matcher.match_bytes(b"ab"), Some(2));
    }
}
