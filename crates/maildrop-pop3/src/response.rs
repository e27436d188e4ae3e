//! POP3 response types.

/// Status indicator of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `+OK`
    Ok,
    /// `-ERR`
    Err,
}

impl Status {
    /// Returns the wire form of the indicator.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "+OK",
            Self::Err => "-ERR",
        }
    }
}

/// A response to one command.
///
/// Multi-line responses always start with `+OK`; their body is dot-stuffed
/// and terminated by a line containing a single `.` when serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status indicator.
    pub status: Status,
    /// Text after the indicator, may be empty.
    pub text: String,
    /// Body lines for multi-line responses.
    pub body: Option<Vec<String>>,
}

impl Response {
    /// Creates a single-line `+OK` response.
    #[must_use]
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            text: text.into(),
            body: None,
        }
    }

    /// Creates a single-line `-ERR` response.
    #[must_use]
    pub fn err(text: impl Into<String>) -> Self {
        Self {
            status: Status::Err,
            text: text.into(),
            body: None,
        }
    }

    /// Creates a multi-line `+OK` response from body lines.
    #[must_use]
    pub fn multi_line(text: impl Into<String>, body: Vec<String>) -> Self {
        Self {
            status: Status::Ok,
            text: text.into(),
            body: Some(body),
        }
    }

    /// Creates a multi-line `+OK` response carrying message content.
    ///
    /// Line endings in `content` are normalized to CRLF.
    #[must_use]
    pub fn content(text: impl Into<String>, content: &str) -> Self {
        if content.is_empty() {
            return Self::multi_line(text, Vec::new());
        }
        let mut body: Vec<String> = content
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
            .collect();
        // A trailing newline must not produce an extra empty line.
        if content.ends_with('\n') {
            body.pop();
        }
        Self::multi_line(text, body)
    }

    /// Serializes the response to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(self.status.as_str().as_bytes());
        if !self.text.is_empty() {
            buf.push(b' ');
            buf.extend_from_slice(self.text.as_bytes());
        }
        buf.extend_from_slice(b"\r\n");

        if let Some(body) = &self.body {
            for line in body {
                // Byte-stuff lines starting with '.'
                if line.starts_with('.') {
                    buf.push(b'.');
                }
                buf.extend_from_slice(line.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            buf.extend_from_slice(b".\r\n");
        }

        buf
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

    #[test]
    fn test_single_line() {
        assert_eq!(Response::ok("Logged in").serialize(), b"+OK Logged in\r\n");
        assert_eq!(
            Response::err("No such message").serialize(),
            b"-ERR No such message\r\n"
        );
        assert_eq!(Response::ok("").serialize(), b"+OK\r\n");
    }

    #[test]
    fn test_multi_line() {
        let response = Response::multi_line(
            "Scan listing follows",
            vec!["1 120".to_string(), "2 340".to_string()],
        );
        assert_eq!(
            response.serialize(),
            b"+OK Scan listing follows\r\n1 120\r\n2 340\r\n.\r\n"
        );
    }

    #[test]
    fn test_empty_multi_line() {
        let response = Response::multi_line("Scan listing follows", Vec::new());
        assert_eq!(response.serialize(), b"+OK Scan listing follows\r\n.\r\n");
    }

    #[test]
    fn test_content_dot_stuffing() {
        let response = Response::content("Message follows", "Subject: x\r\n\r\n.hidden\n..two\n");
        assert_eq!(
            response.serialize(),
            b"+OK Message follows\r\nSubject: x\r\n\r\n..hidden\r\n...two\r\n.\r\n"
        );
    }

    #[test]
    fn test_content_without_trailing_newline() {
        let response = Response::content("Message follows", "a\nb");
        assert_eq!(response.body, Some(vec!["a".to_string(), "b".to_string()]));
    }
}
