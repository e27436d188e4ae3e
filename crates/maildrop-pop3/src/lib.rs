//! # maildrop-pop3
//!
//! An async POP3 server core implementing RFC 1939 and the RFC 2449 CAPA
//! extension.
//!
//! ## Features
//!
//! - **Strict session state machine**: AUTHORIZATION, TRANSACTION and UPDATE,
//!   forward-only, enforced before any command runs
//! - **Pipelining**: commands are answered strictly in order, however the
//!   client batches them
//! - **Backend delegation**: mailbox semantics live behind a typed
//!   request/completion channel, with a per-request timeout
//! - **TLS support**: implicit TLS (port 995) via rustls
//! - **Pluggable session store**: in-memory by default
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use maildrop_pop3::{Server, ServerConfig, backend};
//!
//! #[tokio::main]
//! async fn main() -> maildrop_pop3::Result<()> {
//!     let config = ServerConfig::builder().port(1110).build()?;
//!
//!     // Mailbox semantics come from a MailboxBackend implementation
//!     let (bridge, delegations) = backend::channel(64, config.backend_timeout());
//!     tokio::spawn(backend::serve(Arc::new(MyMailboxes::default()), delegations));
//!
//!     let handle = Server::new(config, bridge)?.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop().await
//! }
//! ```
//!
//! ## Session States
//!
//! ```text
//! ┌───────────────┐  PASS ok  ┌─────────────┐  QUIT  ┌────────┐
//! │ AUTHORIZATION │ ────────→ │ TRANSACTION │ ─────→ │ UPDATE │
//! └───────────────┘           └─────────────┘        └────────┘
//! ```
//!
//! ## Modules
//!
//! - [`backend`]: Delegation channel and the `MailboxBackend` trait
//! - [`command`]: Line framing and command parsing
//! - [`config`]: Validated server configuration
//! - [`connection`]: Per-connection driver and TLS streams
//! - [`interpreter`]: Command execution against the session state
//! - [`observer`]: Server event notifications
//! - [`server`]: Listener and accept loop
//! - [`session`]: Session records and states
//! - [`store`]: Session storage

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod command;
pub mod config;
pub mod connection;
mod error;
pub mod interpreter;
pub mod message;
pub mod observer;
pub mod response;
pub mod server;
pub mod session;
pub mod store;

pub use config::{ServerConfig, ServerConfigBuilder, TlsConfig};
pub use error::{Error, Result};
pub use observer::{CollectingObserver, LoggingObserver, ServerEvent, ServerObserver};
pub use response::{Response, Status};
pub use server::{Server, ServerHandle};
pub use session::{Session, SessionId, SessionState};
pub use store::{MemorySessionStore, SessionStore, StoreError};
