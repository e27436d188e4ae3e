//! End-to-end tests over real TCP connections.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::redundant_clone,
    clippy::similar_names,
    missing_docs
)]

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maildrop_pop3::backend::{
    self, AuthOutcome, BackendFailure, Credentials, DeleteOutcome, MailboxBackend, Maildrop,
    RequestContext, ScanEntry, UidEntry,
};
use maildrop_pop3::command::MessageNumber;
use maildrop_pop3::{
    CollectingObserver, MemorySessionStore, Server, ServerConfig, ServerConfigBuilder,
    ServerEvent, ServerHandle, Session, SessionId, SessionStore,
};
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

const MESSAGES: [(u32, u64, &str); 2] = [
    (1, 120, "Subject: first\r\n\r\nHello\r\n"),
    (2, 340, "Subject: second\r\n\r\n.leading dot\r\n"),
];

/// Two-message mailbox for `alice` / `secret`.
#[derive(Default)]
struct TestMailbox {
    requests: AtomicUsize,
    marks: Mutex<HashMap<SessionId, BTreeSet<u32>>>,
    committed: Mutex<Vec<u32>>,
}

impl TestMailbox {
    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn committed(&self) -> Vec<u32> {
        self.committed.lock().unwrap().clone()
    }

    fn is_marked(&self, ctx: &RequestContext, n: u32) -> bool {
        self.marks
            .lock()
            .unwrap()
            .get(&ctx.session)
            .is_some_and(|marks| marks.contains(&n))
    }

    fn visible(&self, ctx: &RequestContext) -> Vec<(u32, u64, &'static str)> {
        MESSAGES
            .iter()
            .copied()
            .filter(|(n, _, _)| !self.is_marked(ctx, *n))
            .collect()
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailboxBackend for TestMailbox {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, BackendFailure> {
        self.count();
        Ok(
            if credentials.user == "alice" && credentials.password == "secret" {
                AuthOutcome::Accepted
            } else {
                AuthOutcome::Rejected
            },
        )
    }

    async fn stat(&self, ctx: &RequestContext) -> Result<Maildrop, BackendFailure> {
        self.count();
        let visible = self.visible(ctx);
        Ok(Maildrop {
            count: visible.len(),
            size: visible.iter().map(|(_, size, _)| size).sum(),
        })
    }

    async fn list(
        &self,
        ctx: &RequestContext,
        message: Option<MessageNumber>,
    ) -> Result<Vec<ScanEntry>, BackendFailure> {
        self.count();
        Ok(self
            .visible(ctx)
            .into_iter()
            .filter(|(n, _, _)| message.is_none_or(|m| m.get() == *n))
            .filter_map(|(n, size, _)| Some(ScanEntry { number: MessageNumber::new(n)?, size }))
            .collect())
    }

    async fn uidl(
        &self,
        ctx: &RequestContext,
        message: Option<MessageNumber>,
    ) -> Result<Vec<UidEntry>, BackendFailure> {
        self.count();
        Ok(self
            .visible(ctx)
            .into_iter()
            .filter(|(n, _, _)| message.is_none_or(|m| m.get() == *n))
            .filter_map(|(n, _, _)| {
                Some(UidEntry {
                    number: MessageNumber::new(n)?,
                    uid: format!("uid-{n}"),
                })
            })
            .collect())
    }

    async fn retrieve(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
    ) -> Result<Option<String>, BackendFailure> {
        self.count();
        Ok(self
            .visible(ctx)
            .into_iter()
            .find(|(n, _, _)| *n == message.get())
            .map(|(_, _, content)| content.to_string()))
    }

    async fn top(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
        lines: u32,
    ) -> Result<Option<String>, BackendFailure> {
        Ok(self
            .retrieve(ctx, message)
            .await?
            .map(|content| maildrop_pop3::message::top(&content, lines)))
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
    ) -> Result<DeleteOutcome, BackendFailure> {
        self.count();
        let n = message.get();
        if !MESSAGES.iter().any(|(id, _, _)| *id == n) || self.is_marked(ctx, n) {
            return Ok(DeleteOutcome::NoSuchMessage);
        }
        self.marks
            .lock()
            .unwrap()
            .entry(ctx.session.clone())
            .or_default()
            .insert(n);
        Ok(DeleteOutcome::Deleted)
    }

    async fn reset(&self, ctx: &RequestContext) -> Result<(), BackendFailure> {
        self.count();
        self.marks.lock().unwrap().remove(&ctx.session);
        Ok(())
    }

    async fn commit(&self, ctx: &RequestContext) -> Result<(), BackendFailure> {
        self.count();
        let marks = self.marks.lock().unwrap().remove(&ctx.session);
        self.committed
            .lock()
            .unwrap()
            .extend(marks.unwrap_or_default());
        Ok(())
    }
}

struct TestServer {
    handle: ServerHandle,
    store: MemorySessionStore,
    mailbox: Arc<TestMailbox>,
    observer: Arc<CollectingObserver>,
}

impl TestServer {
    async fn start(builder: ServerConfigBuilder) -> Self {
        let config = builder.host("127.0.0.1").port(0).build().unwrap();
        let (bridge, delegations) = backend::channel(16, config.backend_timeout());
        let mailbox = Arc::new(TestMailbox::default());
        tokio::spawn(backend::serve(Arc::clone(&mailbox), delegations));

        let store = MemorySessionStore::new();
        let observer = Arc::new(CollectingObserver::new());
        let handle = Server::new(config, bridge)
            .unwrap()
            .with_store(store.clone())
            .with_observer(observer.clone())
            .start()
            .await
            .unwrap();

        Self {
            handle,
            store,
            mailbox,
            observer,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    async fn wait_for_sessions(&self, expected: usize) {
        tokio::time::timeout(IO_TIMEOUT, async {
            while self.store.len().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count never reached expected value");
    }
}

/// Self-signed `localhost` certificate written to a temporary directory.
struct TestCert {
    _dir: tempfile::TempDir,
    cert_path: PathBuf,
    key_path: PathBuf,
    der: CertificateDer<'static>,
}

impl TestCert {
    fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        Self {
            der: certified.cert.der().clone(),
            _dir: dir,
            cert_path,
            key_path,
        }
    }

    fn builder(&self) -> ServerConfigBuilder {
        ServerConfig::builder()
            .cert_path(self.cert_path.clone())
            .key_path(self.key_path.clone())
    }

    fn connector(&self) -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.der.clone()).unwrap();
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

struct Client<S = TcpStream> {
    lines: Lines<BufReader<ReadHalf<S>>>,
    write: WriteHalf<S>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self::over(TcpStream::connect(addr).await.unwrap())
    }

    /// Connects and checks the greeting.
    async fn greeted(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        client.expect_greeting().await;
        client
    }
}

impl Client<TlsStream<TcpStream>> {
    async fn tls(addr: SocketAddr, cert: &TestCert) -> Self {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let domain = ServerName::try_from("localhost").unwrap();
        let stream = tokio::time::timeout(IO_TIMEOUT, cert.connector().connect(domain, tcp))
            .await
            .expect("TLS handshake timed out")
            .unwrap();
        Self::over(stream)
    }

    async fn tls_greeted(addr: SocketAddr, cert: &TestCert) -> Self {
        let mut client = Self::tls(addr, cert).await;
        client.expect_greeting().await;
        client
    }
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    fn over(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn expect_greeting(&mut self) {
        assert_eq!(self.line().await.as_deref(), Some("+OK POP3 server ready"));
    }

    async fn line(&mut self) -> Option<String> {
        tokio::time::timeout(IO_TIMEOUT, self.lines.next_line())
            .await
            .expect("no response from server")
            .unwrap_or(None)
    }

    async fn send(&mut self, raw: &str) {
        self.write.write_all(raw.as_bytes()).await.unwrap();
        self.write.flush().await.unwrap();
    }

    async fn command(&mut self, command: &str) -> String {
        self.send(&format!("{command}\r\n")).await;
        self.line().await.expect("connection closed")
    }

    /// Reads a multi-line body up to and excluding the terminating dot.
    async fn body(&mut self) -> Vec<String> {
        let mut body = Vec::new();
        loop {
            let line = self.line().await.expect("connection closed in body");
            if line == "." {
                return body;
            }
            body.push(line);
        }
    }

    async fn login(&mut self) {
        assert_eq!(
            self.command("USER alice").await,
            "+OK User name accepted, password please"
        );
        assert_eq!(self.command("PASS secret").await, "+OK Logged in");
    }

    async fn assert_closed(&mut self) {
        assert_eq!(self.line().await, None);
    }
}

#[tokio::test]
async fn login_flow() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;
    client.login().await;

    assert_eq!(client.command("STAT").await, "+OK 2 460");
    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn list_and_single_listing() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;
    client.login().await;

    assert_eq!(client.command("LIST").await, "+OK Scan listing follows");
    assert_eq!(client.body().await, vec!["1 120", "2 340"]);
    assert_eq!(client.command("LIST 5").await, "-ERR No such message");
    assert_eq!(client.command("LIST 2").await, "+OK 2 340");

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn retr_uidl_and_top() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;
    client.login().await;

    assert_eq!(client.command("RETR 2").await, "+OK Message follows");
    assert_eq!(
        client.body().await,
        vec!["Subject: second", "", "..leading dot"]
    );

    assert_eq!(client.command("UIDL").await, "+OK Unique-ID listing follows");
    assert_eq!(client.body().await, vec!["1 uid-1", "2 uid-2"]);

    assert_eq!(client.command("TOP 1 0").await, "+OK Top of message follows");
    assert_eq!(client.body().await, vec!["Subject: first", ""]);

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn quit_commits_and_removes_session() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;
    client.login().await;

    assert_eq!(client.command("DELE 1").await, "+OK Message deleted");
    assert_eq!(client.command("DELE 1").await, "-ERR No such message");
    assert_eq!(client.command("STAT").await, "+OK 1 340");
    assert_eq!(client.command("QUIT").await, "+OK POP3 server signing off");
    client.assert_closed().await;

    assert_eq!(server.mailbox.committed(), vec![1]);
    server.wait_for_sessions(0).await;
    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn rset_clears_marks_before_quit() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;
    client.login().await;

    assert_eq!(client.command("DELE 2").await, "+OK Message deleted");
    assert_eq!(client.command("RSET").await, "+OK Deletion marks cleared");
    assert_eq!(client.command("QUIT").await, "+OK POP3 server signing off");
    client.assert_closed().await;

    assert!(server.mailbox.committed().is_empty());
    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_command_keeps_session() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;

    assert_eq!(client.command("FOO").await, "-ERR Command not recognized");
    assert_eq!(client.command("NOOP").await, "+OK");

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn transaction_commands_need_login() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;

    for command in ["STAT", "LIST", "RETR 1", "DELE 1", "RSET", "TOP 1 1", "UIDL"] {
        assert_eq!(
            client.command(command).await,
            "-ERR Command not valid in current state",
            "{command}"
        );
    }
    assert_eq!(server.mailbox.requests(), 0);

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn capa_lists_capabilities() {
    let server =
        TestServer::start(ServerConfig::builder().implementation("maildrop-test")).await;
    let mut client = Client::greeted(server.addr()).await;

    assert_eq!(client.command("CAPA").await, "+OK Capability list follows");
    assert_eq!(
        client.body().await,
        vec![
            "USER",
            "PIPELINING",
            "TOP",
            "UIDL",
            "RESP-CODES",
            "IMPLEMENTATION maildrop-test"
        ]
    );

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn connection_cap_rejects_and_releases() {
    let server = TestServer::start(ServerConfig::builder().max_connections(1)).await;
    let mut first = Client::greeted(server.addr()).await;

    let mut second = Client::connect(server.addr()).await;
    assert_eq!(
        second.line().await.as_deref(),
        Some("-ERR Too many connections")
    );
    second.assert_closed().await;
    assert_eq!(server.store.len().await, 1);

    assert_eq!(first.command("QUIT").await, "+OK POP3 server signing off");
    first.assert_closed().await;
    server.wait_for_sessions(0).await;

    let mut third = Client::greeted(server.addr()).await;
    assert_eq!(third.command("NOOP").await, "+OK");

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn idle_connection_times_out() {
    let server = TestServer::start(
        ServerConfig::builder().idle_timeout(Duration::from_millis(200)),
    )
    .await;
    let mut client = Client::greeted(server.addr()).await;

    client.assert_closed().await;
    server.wait_for_sessions(0).await;

    let events = server.observer.events();
    let timeout = events
        .iter()
        .position(|e| matches!(e, ServerEvent::Timeout(_)))
        .expect("no timeout event");
    let close = events
        .iter()
        .position(|e| matches!(e, ServerEvent::Close(_)))
        .expect("no close event");
    assert!(timeout < close);

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn pipelined_commands_answered_in_order() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;

    client
        .send("USER alice\r\nPASS secret\r\nSTAT\r\nLIST 1\r\nFOO\r\nNOOP\r\n")
        .await;

    let mut responses = Vec::new();
    for _ in 0..6 {
        responses.push(client.line().await.unwrap());
    }
    assert_eq!(
        responses,
        vec![
            "+OK User name accepted, password please",
            "+OK Logged in",
            "+OK 2 460",
            "+OK 1 120",
            "-ERR Command not recognized",
            "+OK",
        ]
    );

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn commands_split_across_reads() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut client = Client::greeted(server.addr()).await;

    client.send("US").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send("ER alice\r").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send("\nNO").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.send("OP\r\n").await;

    assert_eq!(
        client.line().await.as_deref(),
        Some("+OK User name accepted, password please")
    );
    assert_eq!(client.line().await.as_deref(), Some("+OK"));

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn unresponsive_backend_closes_connection() {
    let config = ServerConfig::builder()
        .host("127.0.0.1")
        .port(0)
        .backend_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    // Delegations are queued but never answered.
    let (bridge, _delegations) = backend::channel(16, config.backend_timeout());
    let store = MemorySessionStore::new();
    let handle = Server::new(config, bridge)
        .unwrap()
        .with_store(store.clone())
        .start()
        .await
        .unwrap();

    let mut client = Client::greeted(handle.local_addr()).await;
    assert_eq!(
        client.command("USER alice").await,
        "+OK User name accepted, password please"
    );
    assert_eq!(client.command("PASS secret").await, "-ERR Backend unavailable");
    client.assert_closed().await;

    handle.stop().await.unwrap();
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn stop_notifies_every_connection() {
    let server = TestServer::start(ServerConfig::builder()).await;
    let mut first = Client::greeted(server.addr()).await;
    let mut second = Client::greeted(server.addr()).await;
    second.login().await;
    server.wait_for_sessions(2).await;

    server.handle.stop().await.unwrap();

    for client in [&mut first, &mut second] {
        assert_eq!(
            client.line().await.as_deref(),
            Some("-ERR POP3 server shutting down")
        );
        client.assert_closed().await;
    }
    assert!(server.store.is_empty().await);
}

#[tokio::test]
async fn tls_sessions_are_secure() {
    let cert = TestCert::generate();
    let server = TestServer::start(cert.builder()).await;
    let mut client = Client::tls_greeted(server.addr(), &cert).await;
    client.login().await;
    assert_eq!(client.command("STAT").await, "+OK 2 460");

    let sessions = server.store.list().await.unwrap();
    let session = sessions.values().next().expect("no session record");
    assert!(session.is_secure());
    assert!(session.remote_addr().is_some_and(|addr| addr.ip().is_loopback()));

    assert_eq!(client.command("QUIT").await, "+OK POP3 server signing off");
    client.assert_closed().await;
    server.wait_for_sessions(0).await;

    assert!(
        server
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::Connect { secure: true, .. }))
    );
    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn tls_capa_advertises_stls() {
    let cert = TestCert::generate();
    let server = TestServer::start(cert.builder().implementation("maildrop-test")).await;
    let mut client = Client::tls_greeted(server.addr(), &cert).await;

    assert_eq!(client.command("CAPA").await, "+OK Capability list follows");
    assert!(client.body().await.contains(&"STLS".to_string()));

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn silent_tls_client_times_out() {
    let cert = TestCert::generate();
    let server = TestServer::start(
        cert.builder()
            .idle_timeout(Duration::from_millis(200))
            .max_connections(1),
    )
    .await;

    // Never sends a ClientHello.
    let _silent = TcpStream::connect(server.addr()).await.unwrap();
    server.wait_for_sessions(1).await;
    server.wait_for_sessions(0).await;
    assert!(
        server
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::Timeout(_)))
    );

    let mut client = Client::tls_greeted(server.addr(), &cert).await;
    assert_eq!(client.command("NOOP").await, "+OK");

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn tls_connection_cap_rejects() {
    let cert = TestCert::generate();
    let server = TestServer::start(cert.builder().max_connections(1)).await;
    let _first = Client::tls_greeted(server.addr(), &cert).await;

    let mut second = Client::tls(server.addr(), &cert).await;
    assert_eq!(
        second.line().await.as_deref(),
        Some("-ERR Too many connections")
    );
    second.assert_closed().await;
    assert_eq!(server.store.len().await, 1);

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn client_ca_accepts_anonymous_clients() {
    let cert = TestCert::generate();
    let server = TestServer::start(cert.builder().ca_path(cert.cert_path.clone())).await;
    let mut client = Client::tls_greeted(server.addr(), &cert).await;
    client.login().await;

    server.handle.stop().await.unwrap();
}

#[tokio::test]
async fn force_secure_marks_plain_sessions() {
    let server = TestServer::start(ServerConfig::builder().force_secure(true)).await;
    let mut client = Client::greeted(server.addr()).await;
    assert_eq!(client.command("NOOP").await, "+OK");

    let sessions = server.store.list().await.unwrap();
    assert!(sessions.values().all(Session::is_secure));
    assert!(
        server
            .observer
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::Connect { secure: true, .. }))
    );

    server.handle.stop().await.unwrap();
}
