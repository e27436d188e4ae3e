//! Message helpers for backend implementations.

/// Returns the header block, the separating blank line and at most `lines`
/// body lines of an RFC 5322 message.
///
/// A message without a blank line is all headers and has no body.
#[must_use]
pub fn top(content: &str, lines: u32) -> String {
    let mut out = String::with_capacity(content.len().min(4096));
    let mut rest = content.split_inclusive('\n');

    for line in rest.by_ref() {
        out.push_str(line);
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
    }

    for line in rest.take(lines as usize) {
        out.push_str(line);
    }

    out
}

/// Size of a message in octets as reported by STAT and LIST.
#[must_use]
pub fn octets(content: &str) -> u64 {
    content.len() as u64
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

    const MESSAGE: &str = "From: a@example.com\r\nSubject: hi\r\n\r\none\r\ntwo\r\nthree\r\n";

    #[test]
    fn test_top_limits_body() {
        assert_eq!(
            top(MESSAGE, 2),
            "From: a@example.com\r\nSubject: hi\r\n\r\none\r\ntwo\r\n"
        );
    }

    #[test]
    fn test_top_zero_lines_keeps_blank_separator() {
        assert_eq!(top(MESSAGE, 0), "From: a@example.com\r\nSubject: hi\r\n\r\n");
    }

    #[test]
    fn test_top_more_lines_than_body() {
        assert_eq!(top(MESSAGE, 100), MESSAGE);
    }

    #[test]
    fn test_top_headers_only() {
        assert_eq!(top("Subject: x\n", 5), "Subject: x\n");
    }

    #[test]
    fn test_top_bare_lf() {
        assert_eq!(top("A: b\n\nbody1\nbody2\n", 1), "A: b\n\nbody1\n");
    }
}
