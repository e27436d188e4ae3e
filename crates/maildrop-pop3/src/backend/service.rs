//! Trait-based backend adapter.
//!
//! Implement [`MailboxBackend`] and hand it to [`serve`] instead of matching
//! on [`Request`] variants by hand.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::{
    AuthOutcome, Credentials, Delegation, Delegations, DeleteOutcome, Maildrop, Request,
    RequestId, ScanEntry, UidEntry,
};
use crate::command::MessageNumber;
use crate::session::SessionId;

/// A failure the client sees as `-ERR <reason>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendFailure(pub String);

impl BackendFailure {
    /// Creates a failure with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Correlation id.
    pub id: RequestId,
    /// Session issuing the request.
    pub session: SessionId,
    /// User of the session. Always set once the session has logged in.
    pub user: Option<String>,
}

/// Mailbox semantics delegated by the server.
///
/// Deletion marks are scoped to `ctx.session`; they only take effect in
/// [`MailboxBackend::commit`].
#[async_trait]
pub trait MailboxBackend: Send + Sync + 'static {
    /// Checks credentials.
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        credentials: &Credentials,
    ) -> Result<AuthOutcome, BackendFailure>;

    /// Count and size of messages not marked deleted.
    async fn stat(&self, ctx: &RequestContext) -> Result<Maildrop, BackendFailure>;

    /// Scan listing; a single-message listing is empty if the message does
    /// not exist.
    async fn list(
        &self,
        ctx: &RequestContext,
        message: Option<MessageNumber>,
    ) -> Result<Vec<ScanEntry>, BackendFailure>;

    /// Unique-id listing, same conventions as [`MailboxBackend::list`].
    async fn uidl(
        &self,
        ctx: &RequestContext,
        message: Option<MessageNumber>,
    ) -> Result<Vec<UidEntry>, BackendFailure>;

    /// Full message content.
    async fn retrieve(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
    ) -> Result<Option<String>, BackendFailure>;

    /// Headers and first `lines` body lines, see [`crate::message::top`].
    async fn top(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
        lines: u32,
    ) -> Result<Option<String>, BackendFailure>;

    /// Marks a message deleted.
    async fn delete(
        &self,
        ctx: &RequestContext,
        message: MessageNumber,
    ) -> Result<DeleteOutcome, BackendFailure>;

    /// Clears the session's deletion marks.
    async fn reset(&self, ctx: &RequestContext) -> Result<(), BackendFailure>;

    /// Removes the session's marked messages.
    async fn commit(&self, ctx: &RequestContext) -> Result<(), BackendFailure>;
}

/// Answers delegations with `backend` until every bridge is dropped.
///
/// Each delegation runs on its own task, so a slow request on one connection
/// does not hold up the others.
pub async fn serve<B: MailboxBackend>(backend: Arc<B>, mut delegations: Delegations) {
    while let Some(delegation) = delegations.recv().await {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { dispatch(backend.as_ref(), delegation).await });
    }
    tracing::debug!("delegation channel closed");
}

async fn dispatch<B: MailboxBackend>(backend: &B, delegation: Delegation) {
    let ctx = RequestContext {
        id: delegation.id,
        session: delegation.session,
        user: delegation.user,
    };

    match delegation.request {
        Request::Authenticate { credentials, reply } => {
            match backend.authenticate(&ctx, &credentials).await {
                Ok(outcome) => reply.complete(outcome),
                Err(failure) => reply.fail(failure.0),
            }
        }
        Request::Stat { reply } => match backend.stat(&ctx).await {
            Ok(maildrop) => reply.complete(maildrop),
            Err(failure) => reply.fail(failure.0),
        },
        Request::List { message, reply } => match backend.list(&ctx, message).await {
            Ok(entries) => reply.complete(entries),
            Err(failure) => reply.fail(failure.0),
        },
        Request::Uidl { message, reply } => match backend.uidl(&ctx, message).await {
            Ok(entries) => reply.complete(entries),
            Err(failure) => reply.fail(failure.0),
        },
        Request::Retrieve { message, reply } => match backend.retrieve(&ctx, message).await {
            Ok(content) => reply.complete(content),
            Err(failure) => reply.fail(failure.0),
        },
        Request::Top {
            message,
            lines,
            reply,
        } => match backend.top(&ctx, message, lines).await {
            Ok(content) => reply.complete(content),
            Err(failure) => reply.fail(failure.0),
        },
        Request::Delete { message, reply } => match backend.delete(&ctx, message).await {
            Ok(outcome) => reply.complete(outcome),
            Err(failure) => reply.fail(failure.0),
        },
        Request::Reset { reply } => match backend.reset(&ctx).await {
            Ok(()) => reply.complete(()),
            Err(failure) => reply.fail(failure.0),
        },
        Request::Commit { reply } => match backend.commit(&ctx).await {
            Ok(()) => reply.complete(()),
            Err(failure) => reply.fail(failure.0),
        },
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

    use super::*;
    use crate::backend::{DelegationError, channel};
    use crate::session::Session;

    struct Fixed;

    #[async_trait]
    impl MailboxBackend for Fixed {
        async fn authenticate(
            &self,
            _ctx: &RequestContext,
            credentials: &Credentials,
        ) -> Result<AuthOutcome, BackendFailure> {
            Ok(if credentials.password == "right" {
                AuthOutcome::Accepted
            } else {
                AuthOutcome::Rejected
            })
        }

        async fn stat(&self, _ctx: &RequestContext) -> Result<Maildrop, BackendFailure> {
            Ok(Maildrop { count: 1, size: 10 })
        }

        async fn list(
            &self,
            _ctx: &RequestContext,
            _message: Option<MessageNumber>,
        ) -> Result<Vec<ScanEntry>, BackendFailure> {
            Ok(vec![ScanEntry {
                number: MessageNumber::new(1).unwrap(),
                size: 10,
            }])
        }

        async fn uidl(
            &self,
            _ctx: &RequestContext,
            _message: Option<MessageNumber>,
        ) -> Result<Vec<UidEntry>, BackendFailure> {
            Ok(Vec::new())
        }

        async fn retrieve(
            &self,
            _ctx: &RequestContext,
            _message: MessageNumber,
        ) -> Result<Option<String>, BackendFailure> {
            Err(BackendFailure::new("maildrop locked"))
        }

        async fn top(
            &self,
            _ctx: &RequestContext,
            _message: MessageNumber,
            _lines: u32,
        ) -> Result<Option<String>, BackendFailure> {
            Ok(None)
        }

        async fn delete(
            &self,
            _ctx: &RequestContext,
            _message: MessageNumber,
        ) -> Result<DeleteOutcome, BackendFailure> {
            Ok(DeleteOutcome::Deleted)
        }

        async fn reset(&self, _ctx: &RequestContext) -> Result<(), BackendFailure> {
            Ok(())
        }

        async fn commit(&self, ctx: &RequestContext) -> Result<(), BackendFailure> {
            assert_eq!(ctx.user.as_deref(), Some("alice"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_serve_dispatches_by_kind() {
        let (bridge, delegations) = channel(8, Duration::from_secs(5));
        tokio::spawn(serve(Arc::new(Fixed), delegations));

        let mut session = Session::new(SessionId::new("svc"), false, None);
        session.set_user("alice").unwrap();

        assert_eq!(
            bridge.authenticate(&session, "alice", "right").await,
            Ok(AuthOutcome::Accepted)
        );
        assert_eq!(
            bridge.authenticate(&session, "alice", "wrong").await,
            Ok(AuthOutcome::Rejected)
        );
        assert_eq!(bridge.stat(&session).await, Ok(Maildrop { count: 1, size: 10 }));
        assert_eq!(bridge.list(&session, None).await.unwrap().len(), 1);
        assert_eq!(
            bridge.retrieve(&session, MessageNumber::new(1).unwrap()).await,
            Err(DelegationError::Failed("maildrop locked".to_string()))
        );
        assert_eq!(bridge.commit(&session).await, Ok(()));
    }
}
