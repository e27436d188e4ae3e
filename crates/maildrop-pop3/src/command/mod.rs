//! POP3 command parsing.
//!
//! A command line is a case-insensitive verb followed by space-separated
//! arguments. Parsing never fails: an unrecognised verb is kept as text so
//! the interpreter can answer it in order with the other commands.

mod line;

pub use line::{LineBuffer, LineTooLong, MAX_LINE_LENGTH};

use std::fmt;

use crate::session::SessionState;

/// A known POP3 command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// USER - Name the maildrop
    User,
    /// PASS - Password for the named maildrop
    Pass,
    /// STAT - Message count and total size
    Stat,
    /// LIST - Scan listing
    List,
    /// RETR - Retrieve a message
    Retr,
    /// DELE - Mark a message deleted
    Dele,
    /// RSET - Clear deletion marks
    Rset,
    /// TOP - Headers and leading body lines
    Top,
    /// UIDL - Unique-id listing
    Uidl,
    /// NOOP - No operation
    Noop,
    /// CAPA - Capability list (RFC 2449)
    Capa,
    /// QUIT - End the session
    Quit,
}

impl Verb {
    /// Looks up a verb, ignoring case.
    #[must_use]
    pub fn parse(word: &str) -> Option<Self> {
        let verb = match word.to_ascii_uppercase().as_str() {
            "USER" => Self::User,
            "PASS" => Self::Pass,
            "STAT" => Self::Stat,
            "LIST" => Self::List,
            "RETR" => Self::Retr,
            "DELE" => Self::Dele,
            "RSET" => Self::Rset,
            "TOP" => Self::Top,
            "UIDL" => Self::Uidl,
            "NOOP" => Self::Noop,
            "CAPA" => Self::Capa,
            "QUIT" => Self::Quit,
            _ => return None,
        };
        Some(verb)
    }

    /// Returns the canonical verb text.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Pass => "PASS",
            Self::Stat => "STAT",
            Self::List => "LIST",
            Self::Retr => "RETR",
            Self::Dele => "DELE",
            Self::Rset => "RSET",
            Self::Top => "TOP",
            Self::Uidl => "UIDL",
            Self::Noop => "NOOP",
            Self::Capa => "CAPA",
            Self::Quit => "QUIT",
        }
    }

    /// Returns `true` if the verb may be issued in `state`.
    #[must_use]
    pub const fn is_legal_in(self, state: SessionState) -> bool {
        match self {
            Self::User | Self::Pass => matches!(state, SessionState::Authorization),
            Self::Stat
            | Self::List
            | Self::Retr
            | Self::Dele
            | Self::Rset
            | Self::Top
            | Self::Uidl => matches!(state, SessionState::Transaction),
            Self::Noop | Self::Capa | Self::Quit => !state.is_terminal(),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Verb text, uppercased.
    pub name: String,
    /// Recognised verb, `None` for unknown commands.
    pub verb: Option<Verb>,
    /// Space-separated arguments.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Splits a line (without terminator) into verb and arguments.
    ///
    /// Returns `None` for blank lines.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_ascii_whitespace();
        let name = words.next()?.to_ascii_uppercase();
        let verb = Verb::parse(&name);
        let args = words.map(str::to_string).collect();
        Some(Self { name, verb, args })
    }

    /// Returns the argument at `index`.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// A message number argument: 1-based and non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageNumber(u32);

impl MessageNumber {
    /// Creates a message number; `None` for zero.
    #[must_use]
    pub const fn new(n: u32) -> Option<Self> {
        if n == 0 { None } else { Some(Self(n)) }
    }

    /// Parses a decimal message number.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok().and_then(Self::new)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MessageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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
    fn test_parse_case_insensitive() {
        let cmd = CommandLine::parse("uSeR alice").unwrap();
        assert_eq!(cmd.name, "USER");
        assert_eq!(cmd.verb, Some(Verb::User));
        assert_eq!(cmd.args, vec!["alice"]);
    }

    #[test]
    fn test_parse_multiple_args() {
        let cmd = CommandLine::parse("TOP 3  10").unwrap();
        assert_eq!(cmd.verb, Some(Verb::Top));
        assert_eq!(cmd.arg(0), Some("3"));
        assert_eq!(cmd.arg(1), Some("10"));
        assert_eq!(cmd.arg(2), None);
    }

    #[test]
    fn test_parse_unknown_verb() {
        let cmd = CommandLine::parse("foo bar").unwrap();
        assert_eq!(cmd.name, "FOO");
        assert_eq!(cmd.verb, None);
    }

    #[test]
    fn test_parse_blank() {
        assert_eq!(CommandLine::parse(""), None);
        assert_eq!(CommandLine::parse("   "), None);
    }

    #[test]
    fn test_state_table() {
        use SessionState::{Authorization, Transaction, Update};

        for verb in [Verb::User, Verb::Pass] {
            assert!(verb.is_legal_in(Authorization));
            assert!(!verb.is_legal_in(Transaction));
        }
        for verb in [
            Verb::Stat,
            Verb::List,
            Verb::Retr,
            Verb::Dele,
            Verb::Rset,
            Verb::Top,
            Verb::Uidl,
        ] {
            assert!(!verb.is_legal_in(Authorization), "{verb}");
            assert!(verb.is_legal_in(Transaction), "{verb}");
        }
        for verb in [Verb::Noop, Verb::Capa, Verb::Quit] {
            assert!(verb.is_legal_in(Authorization));
            assert!(verb.is_legal_in(Transaction));
            assert!(!verb.is_legal_in(Update));
        }
    }

    #[test]
    fn test_message_number() {
        assert_eq!(MessageNumber::parse("7").map(MessageNumber::get), Some(7));
        assert_eq!(MessageNumber::parse("0"), None);
        assert_eq!(MessageNumber::parse("-1"), None);
        assert_eq!(MessageNumber::parse("+1"), None);
        assert_eq!(MessageNumber::parse("abc"), None);
        assert_eq!(MessageNumber::parse("99999999999"), None);
    }
}
