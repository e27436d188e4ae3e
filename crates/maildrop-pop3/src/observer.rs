//! Server notifications for the embedding application.
//!
//! Implement [`ServerObserver`] to be told about listener and connection
//! lifecycle, raw input and parsed commands. Every method has a no-op
//! default, so an observer only overrides what it cares about.
//!
//! # Example
//!
//! ```ignore
//! use maildrop_pop3::observer::ServerObserver;
//!
//! struct Audit;
//!
//! impl ServerObserver for Audit {
//!     fn on_command(&self, id: &SessionId, verb: &str, args: &[String]) {
//!         audit_log(id, verb, args.len());
//!     }
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Error;
use crate::session::SessionId;

/// Observer of server events.
///
/// Observers are shared by every connection task and called synchronously,
/// so they should return quickly.
pub trait ServerObserver: Send + Sync {
    /// The listener is bound and accepting.
    fn on_listening(&self, addr: SocketAddr) {
        let _ = addr;
    }

    /// A connection was admitted and greeted.
    fn on_connect(&self, id: &SessionId, remote: SocketAddr, secure: bool) {
        let _ = (id, remote, secure);
    }

    /// A connection was torn down.
    fn on_close(&self, id: &SessionId) {
        let _ = id;
    }

    /// Raw bytes arrived, before parsing.
    fn on_data(&self, id: &SessionId, data: &[u8]) {
        let _ = (id, data);
    }

    /// A connection hit its idle timeout. `on_close` follows.
    fn on_timeout(&self, id: &SessionId) {
        let _ = id;
    }

    /// A transport or backend error. `id` is `None` for listener errors.
    fn on_error(&self, id: Option<&SessionId>, error: &Error) {
        let _ = (id, error);
    }

    /// A command line was parsed.
    fn on_command(&self, id: &SessionId, verb: &str, args: &[String]) {
        let _ = (id, verb, args);
    }
}

/// Fan-out to any number of observers.
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn ServerObserver>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}

impl Observers {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer.
    pub fn register(&mut self, observer: Arc<dyn ServerObserver>) {
        self.observers.push(observer);
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Returns `true` if no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn listening(&self, addr: SocketAddr) {
        for observer in &self.observers {
            observer.on_listening(addr);
        }
    }

    pub(crate) fn connect(&self, id: &SessionId, remote: SocketAddr, secure: bool) {
        for observer in &self.observers {
            observer.on_connect(id, remote, secure);
        }
    }

    pub(crate) fn close(&self, id: &SessionId) {
        for observer in &self.observers {
            observer.on_close(id);
        }
    }

    pub(crate) fn data(&self, id: &SessionId, data: &[u8]) {
        for observer in &self.observers {
            observer.on_data(id, data);
        }
    }

    pub(crate) fn timeout(&self, id: &SessionId) {
        for observer in &self.observers {
            observer.on_timeout(id);
        }
    }

    pub(crate) fn error(&self, id: Option<&SessionId>, error: &Error) {
        for observer in &self.observers {
            observer.on_error(id, error);
        }
    }

    pub(crate) fn command(&self, id: &SessionId, verb: &str, args: &[String]) {
        for observer in &self.observers {
            observer.on_command(id, verb, args);
        }
    }
}

/// An observer that logs events using tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ServerObserver for LoggingObserver {
    fn on_listening(&self, addr: SocketAddr) {
        tracing::info!(%addr, "listening");
    }

    fn on_connect(&self, id: &SessionId, remote: SocketAddr, secure: bool) {
        tracing::info!(session = %id, %remote, secure, "connected");
    }

    fn on_close(&self, id: &SessionId) {
        tracing::info!(session = %id, "closed");
    }

    fn on_data(&self, id: &SessionId, data: &[u8]) {
        tracing::trace!(session = %id, bytes = data.len(), "data");
    }

    fn on_timeout(&self, id: &SessionId) {
        tracing::info!(session = %id, "idle timeout");
    }

    fn on_error(&self, id: Option<&SessionId>, error: &Error) {
        match id {
            Some(id) => tracing::warn!(session = %id, %error, "connection error"),
            None => tracing::warn!(%error, "listener error"),
        }
    }

    fn on_command(&self, id: &SessionId, verb: &str, args: &[String]) {
        // PASS arguments are credentials.
        let argc = args.len();
        tracing::debug!(session = %id, verb, argc, "command");
    }
}

/// An event recorded by [`CollectingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Listener bound.
    Listening(SocketAddr),
    /// Connection admitted.
    Connect {
        /// Session id.
        id: SessionId,
        /// Peer address.
        remote: SocketAddr,
        /// Encrypted transport.
        secure: bool,
    },
    /// Connection torn down.
    Close(SessionId),
    /// Raw input.
    Data(SessionId, Vec<u8>),
    /// Idle timeout fired.
    Timeout(SessionId),
    /// Error, rendered as text.
    Error(Option<SessionId>, String),
    /// Parsed command.
    Command {
        /// Session id.
        id: SessionId,
        /// Uppercased verb.
        verb: String,
        /// Arguments.
        args: Vec<String>,
    },
}

/// An observer that collects events for later inspection.
///
/// Useful for testing.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<ServerEvent>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the events seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<ServerEvent> {
        self.lock().clone()
    }

    /// Takes all collected events, leaving the observer empty.
    pub fn take(&self) -> Vec<ServerEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ServerEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: ServerEvent) {
        self.lock().push(event);
    }
}

impl ServerObserver for CollectingObserver {
    fn on_listening(&self, addr: SocketAddr) {
        self.push(ServerEvent::Listening(addr));
    }

    fn on_connect(&self, id: &SessionId, remote: SocketAddr, secure: bool) {
        self.push(ServerEvent::Connect {
            id: id.clone(),
            remote,
            secure,
        });
    }

    fn on_close(&self, id: &SessionId) {
        self.push(ServerEvent::Close(id.clone()));
    }

    fn on_data(&self, id: &SessionId, data: &[u8]) {
        self.push(ServerEvent::Data(id.clone(), data.to_vec()));
    }

    fn on_timeout(&self, id: &SessionId) {
        self.push(ServerEvent::Timeout(id.clone()));
    }

    fn on_error(&self, id: Option<&SessionId>, error: &Error) {
        self.push(ServerEvent::Error(id.cloned(), error.to_string()));
    }

    fn on_command(&self, id: &SessionId, verb: &str, args: &[String]) {
        self.push(ServerEvent::Command {
            id: id.clone(),
            verb: verb.to_string(),
            args: args.to_vec(),
        });
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
    fn test_fan_out_reaches_every_observer() {
        let first = Arc::new(CollectingObserver::new());
        let second = Arc::new(CollectingObserver::new());

        let mut observers = Observers::new();
        observers.register(first.clone());
        observers.register(second.clone());
        observers.register(Arc::new(LoggingObserver));
        assert_eq!(observers.len(), 3);

        let id = SessionId::new("abc");
        observers.command(&id, "LIST", &["1".to_string()]);
        observers.timeout(&id);
        observers.close(&id);

        let expected = vec![
            ServerEvent::Command {
                id: id.clone(),
                verb: "LIST".to_string(),
                args: vec!["1".to_string()],
            },
            ServerEvent::Timeout(id.clone()),
            ServerEvent::Close(id.clone()),
        ];
        assert_eq!(first.events(), expected);
        assert_eq!(second.take(), expected);
        assert!(second.events().is_empty());
    }

    #[test]
    fn test_default_methods_are_noops() {
        struct Silent;
        impl ServerObserver for Silent {}

        let mut observers = Observers::new();
        observers.register(Arc::new(Silent));
        observers.error(None, &Error::Protocol("bad".to_string()));
        observers.data(&SessionId::new("x"), b"NOOP\r\n");
    }
}
