//! Per-connection driver.
//!
//! Each admitted socket runs [`serve_connection`] on its own task: optional
//! TLS handshake, greeting, then a read loop feeding the
//! [`CommandInterpreter`] until the client quits, goes idle, errors out or
//! the server stops. Every path ends in the same teardown.

mod stream;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

pub use stream::{ServerStream, create_tls_acceptor};

use crate::Error;
use crate::backend::BackendBridge;
use crate::interpreter::{Capabilities, CommandInterpreter, Flow};
use crate::observer::Observers;
use crate::response::Response;
use crate::session::SessionId;
use crate::store::SessionStore;

/// Size of a single socket read.
const READ_BUFFER_SIZE: usize = 4096;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// QUIT, or a response that ends the session.
    Quit,
    /// The peer closed the socket.
    ClientClosed,
    /// No data within the idle timeout.
    IdleTimeout,
    /// The server is stopping.
    Shutdown,
    /// Transport, TLS or store failure.
    Error,
}

impl CloseReason {
    /// Returns the reason name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quit => "quit",
            Self::ClientClosed => "client closed",
            Self::IdleTimeout => "idle timeout",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a connection task needs from the server.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) bridge: BackendBridge,
    pub(crate) capabilities: Capabilities,
    pub(crate) observers: Observers,
    pub(crate) banner: String,
    pub(crate) idle_timeout: Duration,
    pub(crate) acceptor: Option<TlsAcceptor>,
}

enum Event {
    Read(std::io::Result<usize>),
    Idle,
    Stop,
}

/// Drives one admitted connection to completion.
///
/// The session record must already be in the store.
pub(crate) async fn serve_connection(
    shared: Arc<Shared>,
    id: SessionId,
    tcp: TcpStream,
    remote: SocketAddr,
    secure: bool,
    mut shutdown: watch::Receiver<bool>,
) -> CloseReason {
    let mut teardown = Teardown::new(id.clone(), Arc::clone(&shared.store), shared.observers.clone());

    let accepted = tokio::select! {
        result = handshake(tcp, shared.acceptor.as_ref(), shared.idle_timeout) => Some(result),
        () = stopped(&mut shutdown) => None,
    };
    let mut stream = match accepted {
        Some(Some(Ok(stream))) => stream,
        Some(Some(Err(error))) => {
            report(&shared.observers, &id, &error);
            teardown.release().await;
            return CloseReason::Error;
        }
        Some(None) => {
            tracing::debug!(session = %id, %remote, "no handshake within idle timeout");
            shared.observers.timeout(&id);
            teardown.release().await;
            return CloseReason::IdleTimeout;
        }
        None => {
            teardown.release().await;
            return CloseReason::Shutdown;
        }
    };

    tracing::debug!(session = %id, tls = stream.is_tls(), "transport ready");

    let greeting = Response::ok(shared.banner.as_str()).serialize();
    if let Err(error) = write_flush(&mut stream, &greeting).await {
        report(&shared.observers, &id, &Error::Io(error));
        teardown.run(&mut stream).await;
        return CloseReason::Error;
    }
    shared.observers.connect(&id, remote, secure);

    let mut interpreter = CommandInterpreter::new(
        id.clone(),
        Arc::clone(&shared.store),
        shared.bridge.clone(),
        shared.capabilities.clone(),
        shared.observers.clone(),
    );
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        let event = tokio::select! {
            () = stopped(&mut shutdown) => Event::Stop,
            event = read_event(&mut stream, &mut buf, shared.idle_timeout) => event,
        };

        let n = match event {
            Event::Read(Ok(0)) => break CloseReason::ClientClosed,
            Event::Read(Ok(n)) => n,
            Event::Read(Err(error)) => {
                report(&shared.observers, &id, &Error::Io(error));
                break CloseReason::Error;
            }
            Event::Idle => break CloseReason::IdleTimeout,
            Event::Stop => break CloseReason::Shutdown,
        };

        shared.observers.data(&id, &buf[..n]);

        let fed = tokio::select! {
            () = stopped(&mut shutdown) => None,
            result = interpreter.feed(&buf[..n], &mut stream) => Some(result),
        };

        match fed {
            Some(Ok(Flow::Continue)) => {}
            Some(Ok(Flow::Close)) => break CloseReason::Quit,
            Some(Err(error)) => {
                report(&shared.observers, &id, &error);
                break CloseReason::Error;
            }
            None => break CloseReason::Shutdown,
        }
    };

    match reason {
        CloseReason::IdleTimeout => {
            tracing::debug!(session = %id, timeout = ?shared.idle_timeout, "idle timeout");
            shared.observers.timeout(&id);
        }
        CloseReason::Shutdown if interpreter.mid_response() => {
            tracing::debug!(session = %id, "response cut short by shutdown, notice skipped");
        }
        CloseReason::Shutdown => {
            let notice = Response::err("POP3 server shutting down").serialize();
            let _ = write_flush(&mut stream, &notice).await;
        }
        _ => {}
    }

    teardown.run(&mut stream).await;
    tracing::info!(session = %id, %reason, "connection closed");
    reason
}

/// Answers a connection over the cap and closes it. No session is created.
pub(crate) async fn reject(
    tcp: TcpStream,
    acceptor: Option<TlsAcceptor>,
    remote: SocketAddr,
    idle: Duration,
) {
    let mut stream = match handshake(tcp, acceptor.as_ref(), idle).await {
        Some(Ok(stream)) => stream,
        Some(Err(error)) => {
            tracing::debug!(%remote, %error, "handshake failed on rejected connection");
            return;
        }
        None => {
            tracing::debug!(%remote, "rejected connection never completed its handshake");
            return;
        }
    };

    let line = Response::err("Too many connections").serialize();
    if let Err(error) = write_flush(&mut stream, &line).await {
        tracing::debug!(%remote, %error, "failed to send rejection");
    }
    let _ = stream.shutdown().await;
}

/// Accepts the transport, giving up after `idle` unless it is zero.
///
/// Returns `None` when the client stays silent for the whole interval.
async fn handshake(
    tcp: TcpStream,
    acceptor: Option<&TlsAcceptor>,
    idle: Duration,
) -> Option<crate::Result<ServerStream>> {
    if idle.is_zero() {
        return Some(ServerStream::accept(tcp, acceptor).await);
    }
    tokio::time::timeout(idle, ServerStream::accept(tcp, acceptor))
        .await
        .ok()
}

/// Resolves once `true` is published. Never resolves if the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn read_event<S>(stream: &mut S, buf: &mut [u8], idle: Duration) -> Event
where
    S: AsyncRead + Unpin,
{
    if idle.is_zero() {
        return Event::Read(stream.read(buf).await);
    }
    match tokio::time::timeout(idle, stream.read(buf)).await {
        Ok(result) => Event::Read(result),
        Err(_) => Event::Idle,
    }
}

async fn write_flush<S>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await
}

fn report(observers: &Observers, id: &SessionId, error: &Error) {
    tracing::warn!(session = %id, %error, "connection error");
    observers.error(Some(id), error);
}

/// Releases a connection's resources exactly once.
struct Teardown {
    id: SessionId,
    store: Arc<dyn SessionStore>,
    observers: Observers,
    done: bool,
}

impl Teardown {
    fn new(id: SessionId, store: Arc<dyn SessionStore>, observers: Observers) -> Self {
        Self {
            id,
            store,
            observers,
            done: false,
        }
    }

    /// Destroys the session, shuts the socket down and publishes `close`.
    async fn run<S>(&mut self, stream: &mut S)
    where
        S: AsyncWrite + Unpin,
    {
        if self.done {
            return;
        }
        self.done = true;

        self.destroy().await;
        if let Err(error) = stream.shutdown().await {
            tracing::debug!(session = %self.id, %error, "socket shutdown failed");
        }
        self.observers.close(&self.id);
    }

    /// Like [`Teardown::run`] for a socket that is already gone.
    async fn release(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        self.destroy().await;
        self.observers.close(&self.id);
    }

    async fn destroy(&self) {
        if let Err(error) = self.store.destroy(&self.id).await {
            tracing::warn!(session = %self.id, %error, "failed to destroy session");
            self.observers.error(Some(&self.id), &Error::Store(error));
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
    use crate::observer::{CollectingObserver, ServerEvent};
    use crate::session::Session;
    use crate::store::MemorySessionStore;

    async fn teardown_fixture() -> (Teardown, MemorySessionStore, Arc<CollectingObserver>) {
        let store = MemorySessionStore::new();
        let id = SessionId::new("teardown");
        store
            .set(&id, Session::new(id.clone(), false, None))
            .await
            .unwrap();

        let observer = Arc::new(CollectingObserver::new());
        let mut observers = Observers::new();
        observers.register(observer.clone());

        let teardown = Teardown::new(id, Arc::new(store.clone()), observers);
        (teardown, store, observer)
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (mut teardown, store, observer) = teardown_fixture().await;
        let mut socket = Vec::new();

        teardown.run(&mut socket).await;
        teardown.run(&mut socket).await;
        teardown.release().await;

        assert!(store.is_empty().await);
        assert_eq!(
            observer.events(),
            vec![ServerEvent::Close(SessionId::new("teardown"))]
        );
    }

    #[tokio::test]
    async fn test_release_without_socket() {
        let (mut teardown, store, observer) = teardown_fixture().await;
        teardown.release().await;
        assert!(store.is_empty().await);
        assert_eq!(observer.events().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        stopped(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_pending_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx)).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_event_idle() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buf = [0u8; 16];
        let event = read_event(&mut server, &mut buf, Duration::from_secs(5)).await;
        assert!(matches!(event, Event::Idle));
    }

    #[tokio::test]
    async fn test_read_event_data() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"NOOP\r\n").await.unwrap();
        let mut buf = [0u8; 16];
        let event = read_event(&mut server, &mut buf, Duration::ZERO).await;
        assert!(matches!(event, Event::Read(Ok(6))));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::IdleTimeout.to_string(), "idle timeout");
    }
}
