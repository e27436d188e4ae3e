//! Error types for the POP3 server.

use thiserror::Error;

use crate::backend::DelegationError;
use crate::session::{SessionId, SessionState};
use crate::store::StoreError;

/// Errors that can occur while running the server.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a socket or while reading TLS material.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid server configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session store failure.
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    /// A backend delegation did not complete.
    #[error("Backend error: {0}")]
    Delegation(#[from] DelegationError),

    /// No session record exists for a live connection.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Attempted a state change the session state machine forbids.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// Protocol violation by the client.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
