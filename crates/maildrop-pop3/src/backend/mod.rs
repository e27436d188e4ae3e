//! Delegation of mailbox semantics to an external backend.
//!
//! The interpreter never touches message data. For every command that needs
//! it, it sends one [`Delegation`] over a channel and waits for the typed
//! [`Completion`] inside the request to be resolved.
//!
//! ## Design
//!
//! Each [`Request`] variant carries a completion handle typed for that
//! command's result, so a backend cannot answer RETR with a scan listing.
//! Completing consumes the handle, which makes double completion impossible;
//! a handle dropped unresolved is observed as [`DelegationError::Abandoned`].
//! The bridge waits under a timeout, so a backend that never answers cannot
//! stall a connection forever.
//!
//! ## Example
//!
//! ```ignore
//! use maildrop_pop3::backend::{self, Request, AuthOutcome};
//!
//! let (bridge, mut delegations) = backend::channel(64, Duration::from_secs(30));
//!
//! tokio::spawn(async move {
//!     while let Some(delegation) = delegations.recv().await {
//!         match delegation.request {
//!             Request::Authenticate { credentials, reply } => {
//!                 reply.complete(AuthOutcome::Accepted);
//!             }
//!             other => other.fail("not supported"),
//!         }
//!     }
//! });
//! ```

mod bridge;
mod service;

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

pub use bridge::{BackendBridge, Delegations, channel};
pub use service::{BackendFailure, MailboxBackend, RequestContext, serve};

use crate::command::MessageNumber;
use crate::session::SessionId;

/// Correlation id of a delegation, unique per bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates an id, for backends testing without a bridge.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Why a delegation produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    /// The backend did not resolve the completion in time.
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    /// The completion handle was dropped without being resolved.
    #[error("backend dropped the request without answering")]
    Abandoned,

    /// Nobody is receiving delegations.
    #[error("backend is not running")]
    Unavailable,

    /// The backend reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// Single-use handle through which the backend answers a request.
pub struct Completion<T> {
    sender: oneshot::Sender<Result<T, String>>,
}

impl<T> Completion<T> {
    fn new(sender: oneshot::Sender<Result<T, String>>) -> Self {
        Self { sender }
    }

    /// Resolves the request with its result.
    pub fn complete(self, value: T) {
        if self.sender.send(Ok(value)).is_err() {
            tracing::debug!("completion delivered after the connection went away");
        }
    }

    /// Resolves the request with a failure the client will see as `-ERR`.
    pub fn fail(self, reason: impl Into<String>) {
        if self.sender.send(Err(reason.into())).is_err() {
            tracing::debug!("failure delivered after the connection went away");
        }
    }

    /// Returns `true` if the waiting connection is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

/// USER/PASS credentials. The password is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name from USER.
    pub user: String,
    /// Password from PASS.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials valid, the maildrop is locked for this session.
    Accepted,
    /// Credentials invalid.
    Rejected,
}

/// Message count and total size, the STAT result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Maildrop {
    /// Messages not marked deleted.
    pub count: usize,
    /// Their total size in octets.
    pub size: u64,
}

/// One scan listing line: message number and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanEntry {
    /// Message number.
    pub number: MessageNumber,
    /// Size in octets.
    pub size: u64,
}

/// One unique-id listing line: message number and its stable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidEntry {
    /// Message number.
    pub number: MessageNumber,
    /// Unique id, stable across sessions.
    pub uid: String,
}

/// Result of a deletion mark request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The message is now marked.
    Deleted,
    /// No such message, or it is already marked.
    NoSuchMessage,
}

/// Kind of a request, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Credential check.
    Authenticate,
    /// Count and size.
    Stat,
    /// Scan listing.
    List,
    /// Unique-id listing.
    Uidl,
    /// Full message.
    Retrieve,
    /// Headers and leading body lines.
    Top,
    /// Deletion mark.
    Delete,
    /// Clear deletion marks.
    Reset,
    /// Apply deletion marks at QUIT.
    Commit,
}

impl RequestKind {
    /// Returns the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::Stat => "stat",
            Self::List => "list",
            Self::Uidl => "uidl",
            Self::Retrieve => "retrieve",
            Self::Top => "top",
            Self::Delete => "delete",
            Self::Reset => "reset",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A semantic request, one variant per delegated operation.
#[derive(Debug)]
pub enum Request {
    /// Check USER/PASS credentials.
    Authenticate {
        /// Credentials to check.
        credentials: Credentials,
        /// Answer handle.
        reply: Completion<AuthOutcome>,
    },
    /// Count and total size of the maildrop.
    Stat {
        /// Answer handle.
        reply: Completion<Maildrop>,
    },
    /// Scan listing of all messages, or of one.
    ///
    /// An empty listing for a single message means it does not exist.
    List {
        /// Message to list, `None` for all.
        message: Option<MessageNumber>,
        /// Answer handle.
        reply: Completion<Vec<ScanEntry>>,
    },
    /// Unique-id listing of all messages, or of one.
    Uidl {
        /// Message to list, `None` for all.
        message: Option<MessageNumber>,
        /// Answer handle.
        reply: Completion<Vec<UidEntry>>,
    },
    /// Full content of a message. `None` if it does not exist.
    Retrieve {
        /// Message to fetch.
        message: MessageNumber,
        /// Answer handle.
        reply: Completion<Option<String>>,
    },
    /// Headers, blank line and the first `lines` body lines of a message.
    Top {
        /// Message to fetch.
        message: MessageNumber,
        /// Number of body lines.
        lines: u32,
        /// Answer handle.
        reply: Completion<Option<String>>,
    },
    /// Mark a message deleted.
    Delete {
        /// Message to mark.
        message: MessageNumber,
        /// Answer handle.
        reply: Completion<DeleteOutcome>,
    },
    /// Clear every deletion mark of the session.
    Reset {
        /// Answer handle.
        reply: Completion<()>,
    },
    /// Remove every marked message; the session is ending.
    Commit {
        /// Answer handle.
        reply: Completion<()>,
    },
}

impl Request {
    /// Returns the request kind.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::Authenticate { .. } => RequestKind::Authenticate,
            Self::Stat { .. } => RequestKind::Stat,
            Self::List { .. } => RequestKind::List,
            Self::Uidl { .. } => RequestKind::Uidl,
            Self::Retrieve { .. } => RequestKind::Retrieve,
            Self::Top { .. } => RequestKind::Top,
            Self::Delete { .. } => RequestKind::Delete,
            Self::Reset { .. } => RequestKind::Reset,
            Self::Commit { .. } => RequestKind::Commit,
        }
    }

    /// Fails the request whatever its kind.
    pub fn fail(self, reason: impl Into<String>) {
        match self {
            Self::Authenticate { reply, .. } => reply.fail(reason),
            Self::Stat { reply } => reply.fail(reason),
            Self::List { reply, .. } => reply.fail(reason),
            Self::Uidl { reply, .. } => reply.fail(reason),
            Self::Retrieve { reply, .. } | Self::Top { reply, .. } => reply.fail(reason),
            Self::Delete { reply, .. } => reply.fail(reason),
            Self::Reset { reply } | Self::Commit { reply } => reply.fail(reason),
        }
    }
}

/// A request addressed to the backend, with its correlation data.
#[derive(Debug)]
pub struct Delegation {
    /// Correlation id.
    pub id: RequestId,
    /// Session issuing the request.
    pub session: SessionId,
    /// User of the session, set once USER was accepted.
    pub user: Option<String>,
    /// The request itself.
    pub request: Request,
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

    #[tokio::test]
    async fn test_completion_delivers_once() {
        let (tx, rx) = oneshot::channel();
        let completion: Completion<u32> = Completion::new(tx);
        assert!(!completion.is_closed());
        completion.complete(7);
        assert_eq!(rx.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_completion_failure() {
        let (tx, rx) = oneshot::channel();
        let completion: Completion<()> = Completion::new(tx);
        completion.fail("mailbox locked");
        assert_eq!(rx.await.unwrap(), Err("mailbox locked".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_completion_is_observable() {
        let (tx, rx) = oneshot::channel::<Result<(), String>>();
        drop(Completion::new(tx));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_completion_after_receiver_gone() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let completion: Completion<u32> = Completion::new(tx);
        assert!(completion.is_closed());
        completion.complete(1);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            user: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_request_fail_any_kind() {
        let (tx, rx) = oneshot::channel();
        let request = Request::Top {
            message: MessageNumber::new(1).unwrap(),
            lines: 5,
            reply: Completion::new(tx),
        };
        assert_eq!(request.kind(), RequestKind::Top);
        request.fail("unsupported");
        assert_eq!(rx.await.unwrap(), Err("unsupported".to_string()));
    }
}
