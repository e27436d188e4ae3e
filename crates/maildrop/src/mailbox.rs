//! Mailboxes loaded from a JSON fixture.
//!
//! Each authenticated session works on a snapshot of its user's messages, so
//! message numbers stay stable for the whole session. Deletion marks live in
//! the snapshot and are applied to the shared account on commit.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use maildrop_pop3::backend::{
    AuthOutcome, BackendFailure, Credentials, DeleteOutcome, MailboxBackend, Maildrop,
    RequestContext, ScanEntry, UidEntry,
};
use maildrop_pop3::command::MessageNumber;
use maildrop_pop3::message::octets;
use maildrop_pop3::{ServerObserver, SessionId};
use serde::Deserialize;

/// Fixture file layout.
#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    pub users: Vec<UserFixture>,
}

/// One account in the fixture.
#[derive(Debug, Clone, Deserialize)]
pub struct UserFixture {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

/// A message with its unique id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoredMessage {
    pub uid: String,
    pub content: String,
}

#[derive(Debug)]
struct Account {
    password: String,
    messages: Vec<StoredMessage>,
}

/// Per-session snapshot.
#[derive(Debug)]
struct View {
    user: String,
    messages: Vec<StoredMessage>,
    deleted: BTreeSet<usize>,
}

impl View {
    fn index(&self, message: MessageNumber) -> Option<usize> {
        let index = usize::try_from(message.get()).ok()?.checked_sub(1)?;
        (index < self.messages.len() && !self.deleted.contains(&index)).then_some(index)
    }

    fn visible(&self) -> impl Iterator<Item = (MessageNumber, &StoredMessage)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.deleted.contains(index))
            .filter_map(|(index, stored)| {
                let number = MessageNumber::new(u32::try_from(index + 1).ok()?)?;
                Some((number, stored))
            })
    }

    fn selected(
        &self,
        message: Option<MessageNumber>,
    ) -> Vec<(MessageNumber, &StoredMessage)> {
        match message {
            Some(message) => self
                .index(message)
                .map(|index| (message, &self.messages[index]))
                .into_iter()
                .collect(),
            None => self.visible().collect(),
        }
    }
}

/// In-memory mailbox backend.
#[derive(Debug)]
pub struct MemoryMailbox {
    accounts: Mutex<HashMap<String, Account>>,
    views: Mutex<HashMap<SessionId, View>>,
}

impl MemoryMailbox {
    /// Builds the backend from fixture data.
    #[must_use]
    pub fn new(fixture: Fixture) -> Self {
        let accounts = fixture
            .users
            .into_iter()
            .map(|user| {
                (
                    user.name,
                    Account {
                        password: user.password,
                        messages: user.messages,
                    },
                )
            })
            .collect();

        Self {
            accounts: Mutex::new(accounts),
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Reads a fixture file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mailbox '{}'", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&text)
            .with_context(|| format!("invalid mailbox fixture '{}'", path.display()))?;
        Ok(Self::new(fixture))
    }

    /// Number of accounts.
    pub fn accounts(&self) -> usize {
        lock(&self.accounts).len()
    }

    /// Number of messages currently stored for `user`.
    #[cfg(test)]
    pub fn message_count(&self, user: &str) -> Option<usize> {
        lock(&self.accounts)
            .get(user)
            .map(|account| account.messages.len())
    }

    fn with_view<T>(
        &self,
        ctx: &RequestContext,
        f: impl FnOnce(&mut View) -> T,
    ) -> Result<T, BackendFailure> {
        lock(&self.views)
            .get_mut(&ctx.session)
            .map(f)
            .ok_or_else(|| BackendFailure::new("Session not authenticated"))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl MailboxBackend for MemoryMailbox {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, BackendFailure> {
        let messages = match lock(&self.accounts).get(&credentials.user) {
            Some(account) if account.password == credentials.password => account.messages.clone(),
            _ => return Ok(AuthOutcome::Rejected),
        };

        tracing::debug!(session = %ctx.session, user = %credentials.user, messages = messages.len(), "maildrop opened");
        lock(&self.views).insert(
            ctx.session.clone(),
            View {
                user: credentials.user.clone(),
                messages,
                deleted: BTreeSet::new(),
            },
        );
        Ok(AuthOutcome::Accepted)
    }

    async fn stat(&self, ctx: &RequestContext) -> Result<Maildrop, BackendFailure> {
        self.with_view(ctx, |view| {
            view.visible().fold(Maildrop::default(), |acc, (_, stored)| Maildrop {
                count: acc.count + 1,
                size: acc.size + octets(&stored.content),
            })
        })
    }

    async fn list(
        &self,
        ctx: &RequestContext,
        message: Option<MessageNumber>,
    ) -> Result<Vec<ScanEntry>, BackendFailure> {
        self.with_view(ctx, |view| {
            view.selected(message)
                .into_iter()
                .map(|(number, stored)| ScanEntry {
                    number,
                    size: octets(&stored.content),
                })
                .collect()
        })
    }

    async fn uidl(
        &self,
        ctx: &RequestContext,
        message: Option<MessageNumber>,
    ) -> Result<Vec<UidEntry>, BackendFailure> {
        self.with_view(ctx, |view| {
            view.selected(message)
                .into_iter()
                .map(|(number, stored)| UidEntry {
                    number,
                    uid: stored.uid.clone(),
                })
                .collect()
        })
    }

    async fn retrieve(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
    ) -> Result<Option<String>, BackendFailure> {
        self.with_view(ctx, |view| {
            view.index(message)
                .map(|index| view.messages[index].content.clone())
        })
    }

    async fn top(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
        lines: u32,
    ) -> Result<Option<String>, BackendFailure> {
        self.with_view(ctx, |view| {
            view.index(message)
                .map(|index| maildrop_pop3::message::top(&view.messages[index].content, lines))
        })
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
    ) -> Result<DeleteOutcome, BackendFailure> {
        self.with_view(ctx, |view| match view.index(message) {
            Some(index) => {
                view.deleted.insert(index);
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NoSuchMessage,
        })
    }

    async fn reset(&self, ctx: &RequestContext) -> Result<(), BackendFailure> {
        self.with_view(ctx, |view| view.deleted.clear())
    }

    async fn commit(&self, ctx: &RequestContext) -> Result<(), BackendFailure> {
        let view = lock(&self.views)
            .remove(&ctx.session)
            .ok_or_else(|| BackendFailure::new("Session not authenticated"))?;

        let removed: BTreeSet<&str> = view
            .deleted
            .iter()
            .map(|&index| view.messages[index].uid.as_str())
            .collect();
        if removed.is_empty() {
            return Ok(());
        }

        let mut accounts = lock(&self.accounts);
        let account = accounts
            .get_mut(&view.user)
            .ok_or_else(|| BackendFailure::new("Maildrop no longer exists"))?;
        account
            .messages
            .retain(|stored| !removed.contains(stored.uid.as_str()));

        tracing::info!(session = %ctx.session, user = %view.user, removed = removed.len(), "deleted messages removed");
        Ok(())
    }
}

/// Drops the snapshot of sessions that end without QUIT.
impl ServerObserver for MemoryMailbox {
    fn on_close(&self, id: &SessionId) {
        if lock(&self.views).remove(id).is_some() {
            tracing::debug!(session = %id, "discarded uncommitted maildrop view");
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
    use maildrop_pop3::backend::RequestId;

    use super::*;

    const FIXTURE: &str = r#"{
        "users": [
            {
                "name": "alice",
                "password": "secret",
                "messages": [
                    { "uid": "a1", "content": "Subject: one\r\n\r\nfirst\r\n" },
                    { "uid": "a2", "content": "Subject: two\r\n\r\nsecond\r\nmore\r\n" }
                ]
            },
            { "name": "bob", "password": "hunter2" }
        ]
    }"#;

    fn mailbox() -> MemoryMailbox {
        MemoryMailbox::new(serde_json::from_str(FIXTURE).unwrap())
    }

    fn ctx(session: &str) -> RequestContext {
        RequestContext {
            id: RequestId::new(1),
            session: SessionId::new(session),
            user: Some("alice".to_string()),
        }
    }

    fn number(n: u32) -> MessageNumber {
        MessageNumber::new(n).unwrap()
    }

    async fn login(mailbox: &MemoryMailbox, ctx: &RequestContext) {
        let credentials = Credentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(
            mailbox.authenticate(ctx, &credentials).await.unwrap(),
            AuthOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_authenticate() {
        let mailbox = mailbox();
        let ctx = ctx("s1");
        let wrong = Credentials {
            user: "alice".to_string(),
            password: "nope".to_string(),
        };
        assert_eq!(
            mailbox.authenticate(&ctx, &wrong).await.unwrap(),
            AuthOutcome::Rejected
        );
        assert!(mailbox.stat(&ctx).await.is_err());

        login(&mailbox, &ctx).await;
        let stat = mailbox.stat(&ctx).await.unwrap();
        assert_eq!(stat.count, 2);
        assert_eq!(stat.size, 23 + 30);
    }

    #[tokio::test]
    async fn test_listing_and_retrieval() {
        let mailbox = mailbox();
        let ctx = ctx("s1");
        login(&mailbox, &ctx).await;

        let list = mailbox.list(&ctx, None).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].number, number(2));

        assert!(mailbox.list(&ctx, Some(number(3))).await.unwrap().is_empty());

        let uids = mailbox.uidl(&ctx, Some(number(2))).await.unwrap();
        assert_eq!(uids[0].uid, "a2");

        let top = mailbox.top(&ctx, number(2), 1).await.unwrap().unwrap();
        assert_eq!(top, "Subject: two\r\n\r\nsecond\r\n");
        assert_eq!(mailbox.retrieve(&ctx, number(9)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deletion_is_session_scoped_until_commit() {
        let mailbox = mailbox();
        let first = ctx("s1");
        let second = ctx("s2");
        login(&mailbox, &first).await;
        login(&mailbox, &second).await;

        assert_eq!(
            mailbox.delete(&first, number(1)).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            mailbox.delete(&first, number(1)).await.unwrap(),
            DeleteOutcome::NoSuchMessage
        );
        assert_eq!(mailbox.retrieve(&first, number(1)).await.unwrap(), None);
        assert_eq!(mailbox.stat(&second).await.unwrap().count, 2);

        // Numbers stay stable after a deletion mark.
        let list = mailbox.list(&first, None).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].number, number(2));

        mailbox.commit(&first).await.unwrap();
        assert_eq!(mailbox.message_count("alice"), Some(1));
    }

    #[tokio::test]
    async fn test_reset_clears_marks() {
        let mailbox = mailbox();
        let ctx = ctx("s1");
        login(&mailbox, &ctx).await;

        mailbox.delete(&ctx, number(2)).await.unwrap();
        mailbox.reset(&ctx).await.unwrap();
        mailbox.commit(&ctx).await.unwrap();
        assert_eq!(mailbox.message_count("alice"), Some(2));
    }

    #[tokio::test]
    async fn test_close_discards_view() {
        let mailbox = mailbox();
        let ctx = ctx("s1");
        login(&mailbox, &ctx).await;
        mailbox.delete(&ctx, number(1)).await.unwrap();

        mailbox.on_close(&ctx.session);
        assert!(mailbox.stat(&ctx).await.is_err());
        assert_eq!(mailbox.message_count("alice"), Some(2));
    }

    #[test]
    fn test_load_sample_fixture() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/mailbox.json");
        let mailbox = MemoryMailbox::load(&path).unwrap();
        assert!(mailbox.accounts() > 0);
    }
}
