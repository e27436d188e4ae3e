//! POP3 listener.
//!
//! [`Server`] binds the listening socket and runs the accept loop on a
//! background task. Each admitted connection gets a session record and its
//! own task; [`ServerHandle::stop`] tells every connection to say goodbye and
//! waits for all of them.
//!
//! # Example
//!
//! ```ignore
//! use maildrop_pop3::{Server, ServerConfig, backend};
//!
//! let config = ServerConfig::builder().port(1110).build()?;
//! let (bridge, delegations) = backend::channel(64, config.backend_timeout());
//! tokio::spawn(backend::serve(Arc::new(my_backend), delegations));
//!
//! let handle = Server::new(config, bridge)?.start().await?;
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::backend::BackendBridge;
use crate::config::ServerConfig;
use crate::connection::{self, CloseReason, Shared, create_tls_acceptor, stopped};
use crate::interpreter::Capabilities;
use crate::observer::{Observers, ServerObserver};
use crate::session::{IdGenerator, Session, SessionId};
use crate::store::{MemorySessionStore, SessionStore};
use crate::{Error, Result};

/// A POP3 server that has not started listening yet.
pub struct Server {
    config: ServerConfig,
    bridge: BackendBridge,
    acceptor: Option<TlsAcceptor>,
    store: Arc<dyn SessionStore>,
    observers: Observers,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("tls", &self.acceptor.is_some())
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server, loading TLS material if configured.
    ///
    /// Sessions live in a [`MemorySessionStore`] unless another store is
    /// given with [`Server::with_store`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the certificate or key cannot be loaded.
    pub fn new(config: ServerConfig, bridge: BackendBridge) -> Result<Self> {
        let acceptor = config.tls().map(create_tls_acceptor).transpose()?;
        Ok(Self {
            config,
            bridge,
            acceptor,
            store: Arc::new(MemorySessionStore::new()),
            observers: Observers::new(),
        })
    }

    /// Replaces the session store.
    #[must_use]
    pub fn with_store(mut self, store: impl SessionStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Registers an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ServerObserver>) -> Self {
        self.observers.register(observer);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let local_addr = listener.local_addr()?;

        tracing::info!(
            addr = %local_addr,
            tls = self.acceptor.is_some(),
            max_connections = self.config.max_connections(),
            "POP3 server listening"
        );
        self.observers.listening(local_addr);

        let (shutdown, signal) = watch::channel(false);
        let accept_loop = AcceptLoop {
            listener,
            ids: IdGenerator::new(self.config.session_id_length()),
            max_connections: self.config.max_connections(),
            secure: self.acceptor.is_some() || self.config.force_secure(),
            shared: Arc::new(Shared {
                store: self.store,
                bridge: self.bridge,
                capabilities: Capabilities::from_config(&self.config),
                observers: self.observers,
                banner: self.config.banner().to_string(),
                idle_timeout: self.config.idle_timeout(),
                acceptor: self.acceptor,
            }),
            shutdown: signal,
        };

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task: tokio::spawn(accept_loop.run()),
        })
    }
}

/// Handle to a running server.
///
/// Dropping the handle leaves the server running detached.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every connection and waits for their tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop panicked.
    pub async fn stop(self) -> Result<()> {
        tracing::info!(addr = %self.local_addr, "stopping POP3 server");
        self.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

enum Accepted {
    Socket(std::io::Result<(TcpStream, SocketAddr)>),
    Finished(std::result::Result<CloseReason, JoinError>),
    Stop,
}

struct AcceptLoop {
    listener: TcpListener,
    ids: IdGenerator,
    max_connections: usize,
    secure: bool,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut connections = JoinSet::new();

        loop {
            let event = tokio::select! {
                () = stopped(&mut self.shutdown) => Accepted::Stop,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    Accepted::Finished(joined)
                }
                result = self.listener.accept() => Accepted::Socket(result),
            };

            match event {
                Accepted::Socket(Ok((tcp, remote))) => self.admit(&mut connections, tcp, remote).await,
                Accepted::Socket(Err(error)) => {
                    tracing::warn!(%error, "accept failed");
                    self.shared.observers.error(None, &Error::Io(error));
                }
                Accepted::Finished(joined) => log_join(joined),
                Accepted::Stop => break,
            }
        }

        drop(self.listener);
        tracing::debug!(remaining = connections.len(), "draining connections");
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
        tracing::info!("POP3 server stopped");
    }

    async fn admit(&self, connections: &mut JoinSet<CloseReason>, tcp: TcpStream, remote: SocketAddr) {
        match self.at_capacity().await {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(%remote, max = self.max_connections, "connection limit reached");
                tokio::spawn(connection::reject(
                    tcp,
                    self.shared.acceptor.clone(),
                    remote,
                    self.shared.idle_timeout,
                ));
                return;
            }
            Err(error) => {
                tracing::warn!(%remote, %error, "capacity check failed");
                self.shared.observers.error(None, &error);
                return;
            }
        }

        let id = match self.allocate(remote).await {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(%remote, %error, "failed to create session");
                self.shared.observers.error(None, &error);
                return;
            }
        };

        tracing::info!(session = %id, %remote, "connection accepted");
        connections.spawn(connection::serve_connection(
            Arc::clone(&self.shared),
            id,
            tcp,
            remote,
            self.secure,
            self.shutdown.clone(),
        ));
    }

    async fn at_capacity(&self) -> Result<bool> {
        if self.max_connections == 0 {
            return Ok(false);
        }
        let live = self.shared.store.list().await?.len();
        Ok(live >= self.max_connections)
    }

    /// Creates the session record under a fresh id.
    async fn allocate(&self, remote: SocketAddr) -> Result<SessionId> {
        loop {
            let id = self.ids.next();
            if self.shared.store.get(&id).await?.is_some() {
                tracing::debug!(session = %id, "session id collision, regenerating");
                continue;
            }
            let session = Session::new(id.clone(), self.secure, Some(remote));
            self.shared.store.set(&id, session).await?;
            return Ok(id);
        }
    }
}

fn log_join(joined: std::result::Result<CloseReason, JoinError>) {
    if let Err(error) = joined {
        tracing::error!(%error, "connection task failed");
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
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;
    use crate::backend::channel;
    use crate::observer::{CollectingObserver, ServerEvent};

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .host("127.0.0.1")
            .port(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_fails_on_missing_tls_files() {
        let config = ServerConfig::builder()
            .cert_path("/nonexistent/cert.pem")
            .key_path("/nonexistent/key.pem")
            .build()
            .unwrap();
        let (bridge, _delegations) = channel(1, Duration::from_secs(1));
        assert!(matches!(Server::new(config, bridge), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (bridge, _delegations) = channel(1, Duration::from_secs(1));
        let observer = Arc::new(CollectingObserver::new());
        let store = MemorySessionStore::new();

        let handle = Server::new(config(), bridge)
            .unwrap()
            .with_store(store.clone())
            .with_observer(observer.clone())
            .start()
            .await
            .unwrap();
        let addr = handle.local_addr();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "+OK POP3 server ready"
        );
        assert_eq!(store.len().await, 1);

        handle.stop().await.unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "-ERR POP3 server shutting down"
        );
        assert!(store.is_empty().await);

        let events = observer.events();
        assert_eq!(events.first(), Some(&ServerEvent::Listening(addr)));
        assert!(matches!(events.last(), Some(ServerEvent::Close(_))));
        let _ = write.shutdown().await;
    }
}
