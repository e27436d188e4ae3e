//! Line framing for inbound command bytes.
//!
//! POP3 commands are CRLF-terminated. A socket read can end in the middle of
//! a line, so the unterminated tail is carried over to the next read.

use bytes::{Buf, BytesMut};

/// Default buffer size for the carry-over.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Maximum line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Error returned when a line exceeds [`MAX_LINE_LENGTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong;

/// Per-connection carry-over buffer that yields complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Appends bytes from one socket read.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Takes the next complete line without its terminator.
    ///
    /// Lines end at LF; a CR immediately before it is stripped. Returns
    /// `Ok(None)` when only a partial line (or nothing) is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`LineTooLong`] when a line, terminated or not, exceeds
    /// [`MAX_LINE_LENGTH`]. The buffer is cleared.
    pub fn next_line(&mut self) -> Result<Option<String>, LineTooLong> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_LINE_LENGTH {
                self.buffer.clear();
                return Err(LineTooLong);
            }
            return Ok(None);
        };

        if pos > MAX_LINE_LENGTH {
            self.buffer.clear();
            return Err(LineTooLong);
        }

        let mut line = self.buffer.split_to(pos);
        self.buffer.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Number of buffered bytes not yet returned as a line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(buffer: &mut LineBuffer) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = buffer.next_line().unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_single_read_multiple_lines() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"USER alice\r\nPASS secret\r\nSTAT\r\n");
        assert_eq!(drain(&mut buffer), vec!["USER alice", "PASS secret", "STAT"]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"US");
        assert_eq!(buffer.next_line().unwrap(), None);
        buffer.extend(b"ER ali");
        assert_eq!(buffer.next_line().unwrap(), None);
        buffer.extend(b"ce\r");
        assert_eq!(buffer.next_line().unwrap(), None);
        buffer.extend(b"\nNO");
        assert_eq!(buffer.next_line().unwrap(), Some("USER alice".to_string()));
        assert_eq!(buffer.next_line().unwrap(), None);
        assert_eq!(buffer.pending(), 2);
    }

    #[test]
    fn test_bare_lf_accepted() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"NOOP\nQUIT\r\n");
        assert_eq!(drain(&mut buffer), vec!["NOOP", "QUIT"]);
    }

    #[test]
    fn test_unterminated_line_too_long() {
        let mut buffer = LineBuffer::new();
        buffer.extend(&vec![b'A'; MAX_LINE_LENGTH + 1]);
        assert_eq!(buffer.next_line(), Err(LineTooLong));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_terminated_line_too_long() {
        let mut buffer = LineBuffer::new();
        let mut data = vec![b'A'; MAX_LINE_LENGTH + 10];
        data.extend_from_slice(b"\r\n");
        buffer.extend(&data);
        assert_eq!(buffer.next_line(), Err(LineTooLong));
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_lines(
            lines in proptest::collection::vec("[A-Z]{1,4}( [a-z0-9]{1,8}){0,2}", 1..8),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let stream: Vec<u8> = lines
                .iter()
                .flat_map(|line| format!("{line}\r\n").into_bytes())
                .collect();

            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(stream.len())).collect();
            offsets.push(0);
            offsets.push(stream.len());
            offsets.sort_unstable();
            offsets.dedup();

            let mut buffer = LineBuffer::new();
            let mut seen = Vec::new();
            for window in offsets.windows(2) {
                buffer.extend(&stream[window[0]..window[1]]);
                seen.extend(drain(&mut buffer));
            }

            prop_assert_eq!(seen, lines);
            prop_assert_eq!(buffer.pending(), 0);
        }
    }
}
