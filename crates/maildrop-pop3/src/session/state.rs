//! Session state types.
//!
//! This module defines the states a POP3 session moves through,
//! following RFC 1939 section 3.

use std::fmt;

/// Session state as defined by RFC 1939.
///
/// A POP3 session has three states and only ever moves forward:
/// - `Authorization`: Initial state, the client identifies itself
/// - `Transaction`: The client has logged in and works on the maildrop
/// - `Update`: QUIT was issued, pending deletions are committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SessionState {
    /// Waiting for credentials.
    ///
    /// In this state, only these commands are valid:
    /// - USER
    /// - PASS
    /// - CAPA
    /// - NOOP
    /// - QUIT
    #[default]
    Authorization,

    /// Logged in.
    ///
    /// In this state, these additional commands are valid:
    /// - STAT
    /// - LIST
    /// - RETR
    /// - DELE
    /// - RSET
    /// - TOP
    /// - UIDL
    Transaction,

    /// Committing deletions before sign-off.
    ///
    /// Terminal: no further commands are processed.
    Update,
}

impl SessionState {
    /// Returns the protocol name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authorization => "AUTHORIZATION",
            Self::Transaction => "TRANSACTION",
            Self::Update => "UPDATE",
        }
    }

    /// Returns `true` if `next` is the single state this one may advance to.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Authorization, Self::Transaction) | (Self::Transaction, Self::Update)
        )
    }

    /// Returns `true` if the client has logged in.
    #[must_use]
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Transaction | Self::Update)
    }

    /// Returns `true` if the session accepts no more commands.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Update)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
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
    fn test_session_state_default() {
        assert_eq!(SessionState::default(), SessionState::Authorization);
    }

    #[test]
    fn test_forward_transitions_only() {
        use SessionState::{Authorization, Transaction, Update};

        assert!(Authorization.can_advance_to(Transaction));
        assert!(Transaction.can_advance_to(Update));

        assert!(!Authorization.can_advance_to(Update));
        assert!(!Authorization.can_advance_to(Authorization));
        assert!(!Transaction.can_advance_to(Authorization));
        assert!(!Transaction.can_advance_to(Transaction));
        assert!(!Update.can_advance_to(Authorization));
        assert!(!Update.can_advance_to(Transaction));
        assert!(!Update.can_advance_to(Update));
    }

    #[test]
    fn test_is_authenticated() {
        assert!(!SessionState::Authorization.is_authenticated());
        assert!(SessionState::Transaction.is_authenticated());
        assert!(SessionState::Update.is_authenticated());
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::Authorization.to_string(), "AUTHORIZATION");
        assert_eq!(SessionState::Transaction.to_string(), "TRANSACTION");
        assert_eq!(SessionState::Update.to_string(), "UPDATE");
    }
}
