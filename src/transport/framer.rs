//! Newline framing over an accumulating byte buffer.
//!
//! A single socket read may deliver a partial line, exactly one line, or
//! several lines back to back. The framer keeps whatever follows the consumed
//! delimiter so the next call can return it without touching the socket.

// ============================================================================
// Imports
// ============================================================================

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Line delimiter.
pub const DELIMITER: u8 = b'\n';

// ============================================================================
// LineFramer
// ============================================================================

/// Accumulating line buffer.
///
/// # Invariant
///
/// After [`LineFramer::next_line`] returns a line, the buffer holds exactly
/// the bytes that followed its delimiter.
#[derive(Debug, Clone)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_bytes: usize,
}

impl LineFramer {
    /// Creates an empty framer that refuses lines longer than `max_line_bytes`.
    #[inline]
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
        }
    }

    /// Appends newly received bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if the buffer now exceeds the cap
    /// without containing a delimiter.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > self.max_line_bytes && !self.buffer.contains(&DELIMITER) {
            return Err(Error::message_too_large(self.max_line_bytes));
        }
        Ok(())
    }

    /// Removes and returns the first complete line, delimiter included.
    ///
    /// Returns `Ok(None)` if no delimiter has arrived yet. Only one line is
    /// consumed per call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if the first line exceeds the cap.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(position) = self.buffer.iter().position(|&b| b == DELIMITER) else {
            return Ok(None);
        };

        if position > self.max_line_bytes {
            return Err(Error::message_too_large(self.max_line_bytes));
        }

        let remainder = self.buffer.split_off(position + 1);
        let line = std::mem::replace(&mut self.buffer, remainder);
        Ok(Some(line))
    }

    /// Returns `true` if a complete line is already buffered.
    #[inline]
    #[must_use]
    pub fn has_line(&self) -> bool {
        self.buffer.contains(&DELIMITER)
    }

    /// Number of buffered bytes not yet returned.
    #[inline]
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discards all buffered bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_incomplete_then_complete() {
        let mut framer = LineFramer::new(1024);
        framer.push(b"{\"status\":").expect("push");
        assert_eq!(framer.next_line().expect("frame"), None);

        framer.push(b"\"Ok\"}\n").expect("push");
        assert_eq!(
            framer.next_line().expect("frame").as_deref(),
            Some(&b"{\"status\":\"Ok\"}\n"[..])
        );
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn test_two_lines_in_one_read() {
        let mut framer = LineFramer::new(1024);
        framer.push(b"first\nsecond\ntail").expect("push");

        assert_eq!(framer.next_line().expect("frame").as_deref(), Some(&b"first\n"[..]));
        assert_eq!(framer.buffered_len(), "second\ntail".len());
        assert!(framer.has_line());

        assert_eq!(framer.next_line().expect("frame").as_deref(), Some(&b"second\n"[..]));
        assert_eq!(framer.next_line().expect("frame"), None);
        assert_eq!(framer.buffered_len(), 4);
    }

    #[test]
    fn test_overflow_without_delimiter() {
        let mut framer = LineFramer::new(8);
        framer.push(b"12345678").expect("at cap is fine");
        let err = framer.push(b"9").unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { limit: 8 }));
    }

    #[test]
    fn test_oversized_line_with_delimiter() {
        let mut framer = LineFramer::new(4);
        framer.push(b"0123456789\n").expect("delimiter present");
        assert!(framer.next_line().is_err());
    }

    #[test]
    fn test_clear() {
        let mut framer = LineFramer::new(16);
        framer.push(b"partial").expect("push");
        framer.clear();
        assert_eq!(framer.buffered_len(), 0);
    }

    proptest! {
        #[test]
        fn prop_lines_reassemble_input(chunks in proptest::collection::vec(
            proptest::collection::vec(prop_oneof![Just(b'\n'), any::<u8>()], 0..64),
            0..16,
        )) {
            let mut framer = LineFramer::new(usize::MAX);
            let mut output = Vec::new();

            for chunk in &chunks {
                framer.push(chunk).expect("push");
                while let Some(line) = framer.next_line().expect("frame") {
                    prop_assert_eq!(line.last(), Some(&DELIMITER));
                    prop_assert!(!line[..line.len() - 1].contains(&DELIMITER));
                    output.extend_from_slice(&line);
                }
            }

            let input: Vec<u8> = chunks.concat();
            let complete = input
                .iter()
                .rposition(|&b| b == DELIMITER)
                .map_or(0, |position| position + 1);

            prop_assert_eq!(&output[..], &input[..complete]);
            prop_assert_eq!(framer.buffered_len(), input.len() - complete);
        }
    }
}
