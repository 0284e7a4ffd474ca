//! Match-everything matcher.

use super::Matcher;

/// Treats every chunk of input as a complete PDU.
///
/// Used by handlers that want raw bytes with no framing, e.g. after the
/// protocol has been switched off or while proxying.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllMatcher;

impl AllMatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Matcher for AllMatcher {
    fn match_bytes(&mut self, input: &[u8]) -> Option<usize> {
        Some(input.len())
    }

    fn clear(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumes_whole_input() {
        let mut matcher = AllMatcher::new();
        assert_eq!(matcher.match_bytes(b"raw bytes"), Some(9));
        assert_eq!(matcher.trim(b"raw\r\n"), b"raw\r\n");
    }
}
