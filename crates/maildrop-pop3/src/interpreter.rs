//! POP3 command interpreter.
//!
//! One [`CommandInterpreter`] drives one connection. It frames inbound bytes
//! into lines, checks each command against the session state, delegates
//! mailbox work to the backend and writes exactly one response per command,
//! in order.
//!
//! The interpreter keeps no protocol state of its own: the session record is
//! loaded from the [`SessionStore`] for every command and written back after
//! every change.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::backend::{AuthOutcome, BackendBridge, DelegationError, DeleteOutcome};
use crate::command::{CommandLine, LineBuffer, LineTooLong, MAX_LINE_LENGTH, MessageNumber, Verb};
use crate::config::ServerConfig;
use crate::observer::Observers;
use crate::response::Response;
use crate::session::{Session, SessionId, SessionState};
use crate::store::SessionStore;
use crate::{Error, Result};

/// What the connection should do after a [`CommandInterpreter::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// The last response was final; tear the connection down.
    Close,
}

/// Capabilities announced by CAPA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Advertise STLS.
    pub stls: bool,
    /// Name for the `IMPLEMENTATION` line.
    pub implementation: String,
}

impl Capabilities {
    /// Derives the capability set from the server configuration.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            stls: config.tls().is_some(),
            implementation: config.implementation().to_string(),
        }
    }

    fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = ["USER", "PIPELINING", "TOP", "UIDL", "RESP-CODES"]
            .into_iter()
            .map(str::to_string)
            .collect();
        if self.stls {
            lines.push("STLS".to_string());
        }
        lines.push(format!("IMPLEMENTATION {}", self.implementation));
        lines
    }
}

/// A response and whether it ends the connection.
#[derive(Debug)]
struct Reply {
    response: Response,
    close: bool,
}

impl Reply {
    const fn keep(response: Response) -> Self {
        Self {
            response,
            close: false,
        }
    }

    const fn close(response: Response) -> Self {
        Self {
            response,
            close: true,
        }
    }
}

/// Per-connection command interpreter.
pub struct CommandInterpreter {
    id: SessionId,
    store: Arc<dyn SessionStore>,
    bridge: BackendBridge,
    capabilities: Capabilities,
    observers: Observers,
    lines: LineBuffer,
    writing: bool,
}

impl std::fmt::Debug for CommandInterpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInterpreter")
            .field("id", &self.id)
            .field("pending", &self.lines.pending())
            .finish_non_exhaustive()
    }
}

impl CommandInterpreter {
    /// Creates an interpreter for the session `id`.
    #[must_use]
    pub fn new(
        id: SessionId,
        store: Arc<dyn SessionStore>,
        bridge: BackendBridge,
        capabilities: Capabilities,
        observers: Observers,
    ) -> Self {
        Self {
            id,
            store,
            bridge,
            capabilities,
            observers,
            lines: LineBuffer::new(),
            writing: false,
        }
    }

    /// Returns the session id.
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns true while a response is partially written.
    ///
    /// Stays set if [`CommandInterpreter::feed`] is dropped mid-write, so
    /// the caller knows the client holds an unterminated frame.
    #[must_use]
    pub const fn mid_response(&self) -> bool {
        self.writing
    }

    /// Processes one chunk of inbound bytes.
    ///
    /// Every complete line is executed and answered before the next one is
    /// looked at. An incomplete tail is kept for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` or the session store fails.
    pub async fn feed<W>(&mut self, data: &[u8], out: &mut W) -> Result<Flow>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.lines.extend(data);

        loop {
            let line = match self.lines.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(Flow::Continue),
                Err(LineTooLong) => {
                    tracing::warn!(session = %self.id, "line too long");
                    self.observers.error(
                        Some(&self.id),
                        &Error::Protocol(format!("line exceeds {MAX_LINE_LENGTH} bytes")),
                    );
                    self.respond(out, &Response::err("Line too long")).await?;
                    return Ok(Flow::Close);
                }
            };

            let Some(command) = CommandLine::parse(&line) else {
                continue;
            };

            self.observers
                .command(&self.id, &command.name, &command.args);

            let reply = self.execute(&command).await?;
            self.respond(out, &reply.response).await?;

            if reply.close {
                return Ok(Flow::Close);
            }
        }
    }

    async fn respond<W>(&mut self, out: &mut W, response: &Response) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.writing = true;
        out.write_all(&response.serialize()).await?;
        out.flush().await?;
        self.writing = false;
        Ok(())
    }

    async fn execute(&self, command: &CommandLine) -> Result<Reply> {
        let Some(session) = self.store.get(&self.id).await? else {
            tracing::warn!(session = %self.id, "no session record for live connection");
            self.observers
                .error(Some(&self.id), &Error::SessionNotFound(self.id.clone()));
            return Ok(Reply::close(Response::err("Invalid session state")));
        };

        let Some(verb) = command.verb else {
            tracing::debug!(session = %self.id, verb = %command.name, "unknown command");
            return Ok(Reply::keep(Response::err("Command not recognized")));
        };

        if !verb.is_legal_in(session.state()) {
            tracing::debug!(session = %self.id, %verb, state = %session.state(), "command not valid in state");
            return Ok(Reply::keep(Response::err(
                "Command not valid in current state",
            )));
        }

        tracing::debug!(session = %self.id, %verb, "executing");

        match self.dispatch(verb, command, session).await {
            Ok(reply) => Ok(reply),
            Err(Error::Delegation(error)) => Ok(self.backend_error(error)),
            Err(error) => Err(error),
        }
    }

    async fn dispatch(&self, verb: Verb, command: &CommandLine, session: Session) -> Result<Reply> {
        match verb {
            Verb::User => self.user(command, session).await,
            Verb::Pass => self.pass(command, session).await,
            Verb::Stat => self.stat(&session).await,
            Verb::List => self.list(command, &session).await,
            Verb::Retr => self.retr(command, &session).await,
            Verb::Dele => self.dele(command, &session).await,
            Verb::Rset => self.rset(&session).await,
            Verb::Top => self.top(command, &session).await,
            Verb::Uidl => self.uidl(command, &session).await,
            Verb::Noop => Ok(Reply::keep(Response::ok(""))),
            Verb::Capa => Ok(Reply::keep(Response::multi_line(
                "Capability list follows",
                self.capabilities.lines(),
            ))),
            Verb::Quit => self.quit(session).await,
        }
    }

    fn backend_error(&self, error: DelegationError) -> Reply {
        match error {
            DelegationError::Failed(reason) => Reply::keep(Response::err(reason)),
            error => {
                tracing::warn!(session = %self.id, %error, "backend unavailable");
                self.observers
                    .error(Some(&self.id), &Error::Delegation(error));
                Reply::close(Response::err("Backend unavailable"))
            }
        }
    }

    async fn user(&self, command: &CommandLine, mut session: Session) -> Result<Reply> {
        let Some(name) = command.arg(0) else {
            return Ok(Reply::keep(Response::err("Missing user name")));
        };

        session.set_user(name)?;
        self.store.set(&self.id, session).await?;
        Ok(Reply::keep(Response::ok(
            "User name accepted, password please",
        )))
    }

    async fn pass(&self, command: &CommandLine, mut session: Session) -> Result<Reply> {
        let Some(user) = session.user().map(str::to_string) else {
            return Ok(Reply::keep(Response::err("USER required first")));
        };
        let password = command.args.join(" ");
        let remote = session.remote_addr();

        match self.bridge.authenticate(&session, &user, &password).await? {
            AuthOutcome::Accepted => {
                session.advance(SessionState::Transaction)?;
                self.store.set(&self.id, session).await?;
                tracing::info!(session = %self.id, %user, ?remote, "logged in");
                Ok(Reply::keep(Response::ok("Logged in")))
            }
            AuthOutcome::Rejected => {
                session.clear_user()?;
                self.store.set(&self.id, session).await?;
                tracing::info!(session = %self.id, %user, ?remote, "authentication failed");
                Ok(Reply::keep(Response::err("Authentication failed")))
            }
        }
    }

    async fn stat(&self, session: &Session) -> Result<Reply> {
        let maildrop = self.bridge.stat(session).await?;
        Ok(Reply::keep(Response::ok(format!(
            "{} {}",
            maildrop.count, maildrop.size
        ))))
    }

    async fn list(&self, command: &CommandLine, session: &Session) -> Result<Reply> {
        if command.arg(0).is_none() {
            let entries = self.bridge.list(session, None).await?;
            let body = entries
                .iter()
                .map(|entry| format!("{} {}", entry.number, entry.size))
                .collect();
            return Ok(Reply::keep(Response::multi_line("Scan listing follows", body)));
        }

        let message = match message_arg(command, 0) {
            Ok(message) => message,
            Err(response) => return Ok(Reply::keep(response)),
        };

        let entries = self.bridge.list(session, Some(message)).await?;
        Ok(Reply::keep(
            entries
                .iter()
                .find(|entry| entry.number == message)
                .map_or_else(no_such_message, |entry| {
                    Response::ok(format!("{} {}", entry.number, entry.size))
                }),
        ))
    }

    async fn uidl(&self, command: &CommandLine, session: &Session) -> Result<Reply> {
        if command.arg(0).is_none() {
            let entries = self.bridge.uidl(session, None).await?;
            let body = entries
                .iter()
                .map(|entry| format!("{} {}", entry.number, entry.uid))
                .collect();
            return Ok(Reply::keep(Response::multi_line(
                "Unique-ID listing follows",
                body,
            )));
        }

        let message = match message_arg(command, 0) {
            Ok(message) => message,
            Err(response) => return Ok(Reply::keep(response)),
        };

        let entries = self.bridge.uidl(session, Some(message)).await?;
        Ok(Reply::keep(
            entries
                .iter()
                .find(|entry| entry.number == message)
                .map_or_else(no_such_message, |entry| {
                    Response::ok(format!("{} {}", entry.number, entry.uid))
                }),
        ))
    }

    async fn retr(&self, command: &CommandLine, session: &Session) -> Result<Reply> {
        let message = match message_arg(command, 0) {
            Ok(message) => message,
            Err(response) => return Ok(Reply::keep(response)),
        };

        let content = self.bridge.retrieve(session, message).await?;
        Ok(Reply::keep(content.map_or_else(no_such_message, |content| {
            Response::content("Message follows", &content)
        })))
    }

    async fn top(&self, command: &CommandLine, session: &Session) -> Result<Reply> {
        let message = match message_arg(command, 0) {
            Ok(message) => message,
            Err(response) => return Ok(Reply::keep(response)),
        };
        let Some(lines) = command.arg(1) else {
            return Ok(Reply::keep(Response::err("Missing line count")));
        };
        let Some(lines) = parse_line_count(lines) else {
            return Ok(Reply::keep(Response::err("Invalid line count")));
        };

        let content = self.bridge.top(session, message, lines).await?;
        Ok(Reply::keep(content.map_or_else(no_such_message, |content| {
            Response::content("Top of message follows", &content)
        })))
    }

    async fn dele(&self, command: &CommandLine, session: &Session) -> Result<Reply> {
        let message = match message_arg(command, 0) {
            Ok(message) => message,
            Err(response) => return Ok(Reply::keep(response)),
        };

        Ok(Reply::keep(match self.bridge.delete(session, message).await? {
            DeleteOutcome::Deleted => Response::ok("Message deleted"),
            DeleteOutcome::NoSuchMessage => no_such_message(),
        }))
    }

    async fn rset(&self, session: &Session) -> Result<Reply> {
        self.bridge.reset(session).await?;
        Ok(Reply::keep(Response::ok("Deletion marks cleared")))
    }

    async fn quit(&self, mut session: Session) -> Result<Reply> {
        if session.state() != SessionState::Transaction {
            return Ok(Reply::close(Response::ok("POP3 server signing off")));
        }

        session.advance(SessionState::Update)?;
        self.store.set(&self.id, session.clone()).await?;

        match self.bridge.commit(&session).await {
            Ok(()) => Ok(Reply::close(Response::ok("POP3 server signing off"))),
            Err(DelegationError::Failed(reason)) => {
                tracing::warn!(session = %self.id, %reason, "commit failed");
                Ok(Reply::close(Response::err(
                    "Some deleted messages not removed",
                )))
            }
            Err(error) => Err(error.into()),
        }
    }
}

fn message_arg(command: &CommandLine, index: usize) -> std::result::Result<MessageNumber, Response> {
    let arg = command
        .arg(index)
        .ok_or_else(|| Response::err("Missing message number"))?;
    MessageNumber::parse(arg).ok_or_else(|| Response::err("Invalid message number"))
}

fn parse_line_count(text: &str) -> Option<u32> {
    if text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse().ok()
    } else {
        None
    }
}

fn no_such_message() -> Response {
    Response::err("No such message")
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
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::backend::{
        Delegations, Maildrop, Request, RequestKind, ScanEntry, UidEntry, channel,
    };
    use crate::observer::{CollectingObserver, ServerEvent};
    use crate::store::MemorySessionStore;

    const MESSAGE: &str = "Subject: hello\r\n\r\nline one\r\n.dot line\r\nline three\r\n";

    type RequestLog = Arc<Mutex<Vec<RequestKind>>>;

    fn number(n: u32) -> MessageNumber {
        MessageNumber::new(n).unwrap()
    }

    async fn scripted_backend(mut delegations: Delegations, log: RequestLog) {
        while let Some(delegation) = delegations.recv().await {
            log.lock().unwrap().push(delegation.request.kind());
            match delegation.request {
                Request::Authenticate { credentials, reply } => {
                    reply.complete(if credentials.password == "secret" {
                        AuthOutcome::Accepted
                    } else {
                        AuthOutcome::Rejected
                    });
                }
                Request::Stat { reply } => reply.complete(Maildrop { count: 2, size: 460 }),
                Request::List { message, reply } => {
                    let all = vec![
                        ScanEntry { number: number(1), size: 120 },
                        ScanEntry { number: number(2), size: 340 },
                    ];
                    reply.complete(
                        all.into_iter()
                            .filter(|e| message.is_none_or(|m| m == e.number))
                            .collect(),
                    );
                }
                Request::Uidl { message, reply } => {
                    let all = vec![
                        UidEntry { number: number(1), uid: "uid-one".to_string() },
                        UidEntry { number: number(2), uid: "uid-two".to_string() },
                    ];
                    reply.complete(
                        all.into_iter()
                            .filter(|e| message.is_none_or(|m| m == e.number))
                            .collect(),
                    );
                }
                Request::Retrieve { message, reply } => match message.get() {
                    1 => reply.complete(Some(MESSAGE.to_string())),
                    7 => reply.fail("message quarantined"),
                    _ => reply.complete(None),
                },
                Request::Top {
                    message,
                    lines,
                    reply,
                } => reply.complete((message.get() == 1).then(|| crate::message::top(MESSAGE, lines))),
                Request::Delete { message, reply } => reply.complete(if message.get() <= 2 {
                    DeleteOutcome::Deleted
                } else {
                    DeleteOutcome::NoSuchMessage
                }),
                Request::Reset { reply } => reply.complete(()),
                Request::Commit { reply } => reply.complete(()),
            }
        }
    }

    struct Harness {
        interpreter: CommandInterpreter,
        store: MemorySessionStore,
        requests: RequestLog,
        observer: Arc<CollectingObserver>,
    }

    impl Harness {
        async fn new() -> Self {
            let (bridge, delegations) = channel(8, Duration::from_secs(5));
            let requests = RequestLog::default();
            tokio::spawn(scripted_backend(delegations, Arc::clone(&requests)));
            Self::with_bridge(bridge, requests).await
        }

        async fn with_bridge(bridge: BackendBridge, requests: RequestLog) -> Self {
            let store = MemorySessionStore::new();
            let id = SessionId::new("interp-test");
            store
                .set(&id, Session::new(id.clone(), false, None))
                .await
                .unwrap();

            let observer = Arc::new(CollectingObserver::new());
            let mut observers = Observers::new();
            observers.register(observer.clone());

            let capabilities = Capabilities {
                stls: false,
                implementation: "maildrop-test".to_string(),
            };
            let interpreter = CommandInterpreter::new(
                id,
                Arc::new(store.clone()),
                bridge,
                capabilities,
                observers,
            );

            Self {
                interpreter,
                store,
                requests,
                observer,
            }
        }

        async fn send(&mut self, input: &str) -> (String, Flow) {
            let mut out = Vec::new();
            let flow = self
                .interpreter
                .feed(input.as_bytes(), &mut out)
                .await
                .unwrap();
            (String::from_utf8(out).unwrap(), flow)
        }

        async fn login(&mut self) {
            let (out, _) = self.send("USER alice\r\nPASS secret\r\n").await;
            assert_eq!(
                out,
                "+OK User name accepted, password please\r\n+OK Logged in\r\n"
            );
            self.requests.lock().unwrap().clear();
        }

        async fn session(&self) -> Option<Session> {
            self.store.get(self.interpreter.id()).await.unwrap()
        }

        fn requests(&self) -> Vec<RequestKind> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_login_flow() {
        let mut h = Harness::new().await;
        h.login().await;

        let session = h.session().await.unwrap();
        assert_eq!(session.state(), SessionState::Transaction);
        assert_eq!(session.user(), Some("alice"));
    }

    #[tokio::test]
    async fn test_failed_password_requires_user_again() {
        let mut h = Harness::new().await;

        let (out, flow) = h.send("USER alice\r\nPASS wrong\r\nPASS secret\r\n").await;
        assert_eq!(
            out,
            "+OK User name accepted, password please\r\n\
             -ERR Authentication failed\r\n\
             -ERR USER required first\r\n"
        );
        assert_eq!(flow, Flow::Continue);
        assert_eq!(h.requests(), vec![RequestKind::Authenticate]);
        assert_eq!(h.session().await.unwrap().user(), None);
    }

    #[tokio::test]
    async fn test_missing_user_name() {
        let mut h = Harness::new().await;
        let (out, _) = h.send("USER\r\n").await;
        assert_eq!(out, "-ERR Missing user name\r\n");
    }

    #[tokio::test]
    async fn test_transaction_commands_rejected_before_login() {
        let mut h = Harness::new().await;

        let (out, flow) = h.send("STAT\r\nLIST\r\nRETR 1\r\nDELE 1\r\n").await;
        assert_eq!(out, "-ERR Command not valid in current state\r\n".repeat(4));
        assert_eq!(flow, Flow::Continue);
        assert!(h.requests().is_empty());
    }

    #[tokio::test]
    async fn test_user_rejected_after_login() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("USER bob\r\nPASS secret\r\n").await;
        assert_eq!(out, "-ERR Command not valid in current state\r\n".repeat(2));
        assert_eq!(h.session().await.unwrap().user(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut h = Harness::new().await;
        let (out, flow) = h.send("FOO\r\n").await;
        assert_eq!(out, "-ERR Command not recognized\r\n");
        assert_eq!(flow, Flow::Continue);

        let events = h.observer.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::Command { verb, .. } if verb == "FOO"
        )));
    }

    #[tokio::test]
    async fn test_stat_and_list() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("STAT\r\nLIST\r\nLIST 2\r\nLIST 5\r\n").await;
        assert_eq!(
            out,
            "+OK 2 460\r\n\
             +OK Scan listing follows\r\n1 120\r\n2 340\r\n.\r\n\
             +OK 2 340\r\n\
             -ERR No such message\r\n"
        );
        assert_eq!(
            h.requests(),
            vec![
                RequestKind::Stat,
                RequestKind::List,
                RequestKind::List,
                RequestKind::List
            ]
        );
    }

    #[tokio::test]
    async fn test_uidl() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("UIDL\r\nUIDL 1\r\nUIDL 3\r\n").await;
        assert_eq!(
            out,
            "+OK Unique-ID listing follows\r\n1 uid-one\r\n2 uid-two\r\n.\r\n\
             +OK 1 uid-one\r\n\
             -ERR No such message\r\n"
        );
    }

    #[tokio::test]
    async fn test_retr_dot_stuffs_content() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("RETR 1\r\nRETR 3\r\n").await;
        assert_eq!(
            out,
            "+OK Message follows\r\n\
             Subject: hello\r\n\r\nline one\r\n..dot line\r\nline three\r\n.\r\n\
             -ERR No such message\r\n"
        );
    }

    #[tokio::test]
    async fn test_top() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("TOP 1 1\r\nTOP 1\r\nTOP 1 x\r\n").await;
        assert_eq!(
            out,
            "+OK Top of message follows\r\nSubject: hello\r\n\r\nline one\r\n.\r\n\
             -ERR Missing line count\r\n\
             -ERR Invalid line count\r\n"
        );
        assert_eq!(h.requests(), vec![RequestKind::Top]);
    }

    #[tokio::test]
    async fn test_message_number_errors_skip_backend() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("RETR\r\nDELE 0\r\nRETR abc\r\n").await;
        assert_eq!(
            out,
            "-ERR Missing message number\r\n\
             -ERR Invalid message number\r\n\
             -ERR Invalid message number\r\n"
        );
        assert!(h.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dele_and_rset() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, _) = h.send("DELE 1\r\nDELE 9\r\nRSET\r\n").await;
        assert_eq!(
            out,
            "+OK Message deleted\r\n-ERR No such message\r\n+OK Deletion marks cleared\r\n"
        );
        assert_eq!(
            h.session().await.unwrap().state(),
            SessionState::Transaction
        );
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_session() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, flow) = h.send("RETR 7\r\nNOOP\r\n").await;
        assert_eq!(out, "-ERR message quarantined\r\n+OK\r\n");
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test]
    async fn test_capa() {
        let mut h = Harness::new().await;
        let (out, _) = h.send("CAPA\r\n").await;
        assert_eq!(
            out,
            "+OK Capability list follows\r\n\
             USER\r\nPIPELINING\r\nTOP\r\nUIDL\r\nRESP-CODES\r\n\
             IMPLEMENTATION maildrop-test\r\n.\r\n"
        );
    }

    #[test]
    fn test_capabilities_stls() {
        let capabilities = Capabilities {
            stls: true,
            implementation: "x".to_string(),
        };
        assert!(capabilities.lines().contains(&"STLS".to_string()));
    }

    #[tokio::test]
    async fn test_quit_from_authorization_skips_commit() {
        let mut h = Harness::new().await;
        let (out, flow) = h.send("QUIT\r\nNOOP\r\n").await;
        assert_eq!(out, "+OK POP3 server signing off\r\n");
        assert_eq!(flow, Flow::Close);
        assert!(h.requests().is_empty());
    }

    #[tokio::test]
    async fn test_quit_commits_before_sign_off() {
        let mut h = Harness::new().await;
        h.login().await;

        let (out, flow) = h.send("DELE 1\r\nQUIT\r\n").await;
        assert_eq!(out, "+OK Message deleted\r\n+OK POP3 server signing off\r\n");
        assert_eq!(flow, Flow::Close);
        assert_eq!(h.requests(), vec![RequestKind::Delete, RequestKind::Commit]);
        assert_eq!(h.session().await.unwrap().state(), SessionState::Update);
    }

    #[tokio::test]
    async fn test_commit_failure_still_closes() {
        let (bridge, mut delegations) = channel(8, Duration::from_secs(5));
        tokio::spawn(async move {
            while let Some(delegation) = delegations.recv().await {
                match delegation.request {
                    Request::Authenticate { reply, .. } => reply.complete(AuthOutcome::Accepted),
                    other => other.fail("disk full"),
                }
            }
        });
        let mut h = Harness::with_bridge(bridge, RequestLog::default()).await;
        h.login().await;

        let (out, flow) = h.send("QUIT\r\n").await;
        assert_eq!(out, "-ERR Some deleted messages not removed\r\n");
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn test_missing_session_record_closes() {
        let mut h = Harness::new().await;
        h.store.destroy(h.interpreter.id()).await.unwrap();

        let (out, flow) = h.send("NOOP\r\nNOOP\r\n").await;
        assert_eq!(out, "-ERR Invalid session state\r\n");
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn test_partial_lines_carry_over() {
        let mut h = Harness::new().await;

        let (out, flow) = h.send("NO").await;
        assert_eq!(out, "");
        assert_eq!(flow, Flow::Continue);

        let (out, _) = h.send("OP\r\n\r\nNOOP\n").await;
        assert_eq!(out, "+OK\r\n+OK\r\n");
    }

    #[tokio::test]
    async fn test_line_too_long_closes() {
        let mut h = Harness::new().await;
        let long = "A".repeat(crate::command::MAX_LINE_LENGTH + 10);
        let (out, flow) = h.send(&long).await;
        assert_eq!(out, "-ERR Line too long\r\n");
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn test_dropped_write_leaves_response_open() {
        let mut h = Harness::new().await;
        let (_client, mut server) = tokio::io::duplex(4);
        assert!(!h.interpreter.mid_response());

        let fed = tokio::time::timeout(
            Duration::from_millis(50),
            h.interpreter.feed(b"CAPA\r\n", &mut server),
        )
        .await;
        assert!(fed.is_err());
        assert!(h.interpreter.mid_response());

        let (out, _) = h.send("NOOP\r\n").await;
        assert_eq!(out, "+OK\r\n");
        assert!(!h.interpreter.mid_response());
    }

    #[tokio::test]
    async fn test_pipelined_responses_written_in_order() {
        let mut h = Harness::new().await;
        let mut mock = tokio_test::io::Builder::new()
            .write(b"+OK User name accepted, password please\r\n")
            .write(b"+OK Logged in\r\n")
            .write(b"+OK 2 460\r\n")
            .write(b"+OK\r\n")
            .build();

        let flow = h
            .interpreter
            .feed(b"USER alice\r\nPASS secret\r\nSTAT\r\nNOOP\r\n", &mut mock)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout_closes() {
        let (bridge, delegations) = channel(8, Duration::from_secs(2));
        let mut h = Harness::with_bridge(bridge, RequestLog::default()).await;

        let (out, flow) = h.send("USER alice\r\nPASS secret\r\n").await;
        assert_eq!(
            out,
            "+OK User name accepted, password please\r\n-ERR Backend unavailable\r\n"
        );
        assert_eq!(flow, Flow::Close);
        assert!(h.observer.events().iter().any(|e| matches!(e, ServerEvent::Error(Some(_), _))));
        drop(delegations);
    }
}
