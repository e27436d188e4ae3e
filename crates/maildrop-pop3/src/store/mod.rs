//! Session storage abstraction.
//!
//! The store is the only state shared between connections. It is a plain
//! key-value contract over [`SessionId`] -> [`Session`]; all protocol rules
//! live in the interpreter.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemorySessionStore;

use crate::session::{Session, SessionId};

/// Errors reported by a session store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed an operation.
    #[error("store operation failed: {0}")]
    Backend(String),
}

/// Async key-value store of session records.
///
/// Implementations must allow concurrent callers working on different keys
/// without blocking each other for longer than a single operation. No
/// cross-key atomicity is required.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Loads a session. `None` if no record exists.
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Inserts or replaces a session.
    async fn set(&self, id: &SessionId, session: Session) -> Result<(), StoreError>;

    /// Removes a session. Removing an absent id is a no-op.
    async fn destroy(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Returns all live sessions.
    ///
    /// Used by the listener to enforce the connection cap.
    async fn list(&self) -> Result<HashMap<SessionId, Session>, StoreError>;
}
