//! Per-connection session records.
//!
//! A [`Session`] is a plain value owned by the
//! [`SessionStore`](crate::store::SessionStore). Components read it with
//! `get`, change a local copy, and write it back with `set`.

mod id;
mod state;

use std::net::SocketAddr;

pub use id::{DEFAULT_ID_LENGTH, IdGenerator, MAX_ID_LENGTH, MIN_ID_LENGTH, SessionId};
pub use state::SessionState;

use crate::{Error, Result};

/// Record tracking one connection through the POP3 state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: SessionId,
    state: SessionState,
    user: Option<String>,
    secure: bool,
    remote_addr: Option<SocketAddr>,
    /// Reserved, no command selects a mailbox yet.
    pub selected_mailbox: Option<String>,
}

impl Session {
    /// Creates a session in the `Authorization` state.
    #[must_use]
    pub const fn new(id: SessionId, secure: bool, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            state: SessionState::Authorization,
            user: None,
            secure,
            remote_addr,
            selected_mailbox: None,
        }
    }

    /// Returns the session id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the user named by USER, if any.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns `true` if the transport is encrypted.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns the peer address.
    #[must_use]
    pub const fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Records the user name given by USER.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` once the session has left
    /// `Authorization`; the user is fixed from then on.
    pub fn set_user(&mut self, user: impl Into<String>) -> Result<()> {
        self.ensure_authorization()?;
        self.user = Some(user.into());
        Ok(())
    }

    /// Forgets the pending user after a failed PASS.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` outside `Authorization`.
    pub fn clear_user(&mut self) -> Result<()> {
        self.ensure_authorization()?;
        self.user = None;
        Ok(())
    }

    /// Moves the session to `next`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` for anything but
    /// `Authorization -> Transaction` and `Transaction -> Update`.
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    fn ensure_authorization(&self) -> Result<()> {
        if self.state == SessionState::Authorization {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.state,
                to: SessionState::Authorization,
            })
        }
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

    fn session() -> Session {
        Session::new(SessionId::new("abcdefgh"), false, None)
    }

    #[test]
    fn test_new_session() {
        let session = session();
        assert_eq!(session.state(), SessionState::Authorization);
        assert_eq!(session.user(), None);
        assert!(!session.is_secure());
        assert_eq!(session.selected_mailbox, None);
    }

    #[test]
    fn test_user_fixed_after_login() {
        let mut session = session();
        session.set_user("alice").unwrap();
        session.set_user("bob").unwrap();
        assert_eq!(session.user(), Some("bob"));

        session.advance(SessionState::Transaction).unwrap();
        assert!(session.set_user("mallory").is_err());
        assert!(session.clear_user().is_err());
        assert_eq!(session.user(), Some("bob"));
    }

    #[test]
    fn test_advance_rejects_backward_and_skips() {
        let mut session = session();
        assert!(matches!(
            session.advance(SessionState::Update),
            Err(Error::InvalidTransition { .. })
        ));

        session.advance(SessionState::Transaction).unwrap();
        session.advance(SessionState::Update).unwrap();

        assert!(session.advance(SessionState::Transaction).is_err());
        assert!(session.advance(SessionState::Authorization).is_err());
        assert_eq!(session.state(), SessionState::Update);
    }
}
