//! Channel between connections and the backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::{
    AuthOutcome, Completion, Credentials, DelegationError, Delegation, DeleteOutcome, Maildrop,
    Request, RequestId, ScanEntry, UidEntry,
};
use crate::command::MessageNumber;
use crate::session::Session;

/// Creates a bridge and the receiving end the backend consumes.
///
/// `capacity` bounds the number of queued delegations; `timeout` bounds
/// every round trip, queueing included.
#[must_use]
pub fn channel(capacity: usize, timeout: Duration) -> (BackendBridge, Delegations) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let bridge = BackendBridge {
        sender,
        timeout,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    (bridge, Delegations { receiver })
}

/// Sending side of the delegation channel, shared by all connections.
#[derive(Debug, Clone)]
pub struct BackendBridge {
    sender: mpsc::Sender<Delegation>,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl BackendBridge {
    /// Sends one request and waits for its completion.
    ///
    /// `build` receives the completion handle and wraps it into the
    /// request variant matching `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`DelegationError`] if the backend is gone, times out,
    /// drops the handle, or reports a failure.
    pub async fn delegate<T>(
        &self,
        session: &Session,
        build: impl FnOnce(Completion<T>) -> Request,
    ) -> Result<T, DelegationError> {
        let (sender, receiver) = oneshot::channel();
        let request = build(Completion::new(sender));
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = request.kind();

        tracing::debug!(session = %session.id(), request = %id, %kind, "delegating");

        let delegation = Delegation {
            id,
            session: session.id().clone(),
            user: session.user().map(str::to_string),
            request,
        };

        let exchange = async {
            self.sender
                .send(delegation)
                .await
                .map_err(|_| DelegationError::Unavailable)?;
            match receiver.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(reason)) => Err(DelegationError::Failed(reason)),
                Err(_) => Err(DelegationError::Abandoned),
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(session = %session.id(), request = %id, %kind, "backend timed out");
                Err(DelegationError::Timeout(self.timeout))
            }
        }
    }

    /// Checks USER/PASS credentials.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn authenticate(
        &self,
        session: &Session,
        user: &str,
        password: &str,
    ) -> Result<AuthOutcome, DelegationError> {
        let credentials = Credentials {
            user: user.to_string(),
            password: password.to_string(),
        };
        self.delegate(session, |reply| Request::Authenticate { credentials, reply })
            .await
    }

    /// Queries message count and total size.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn stat(&self, session: &Session) -> Result<Maildrop, DelegationError> {
        self.delegate(session, |reply| Request::Stat { reply }).await
    }

    /// Requests a scan listing.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn list(
        &self,
        session: &Session,
        message: Option<MessageNumber>,
    ) -> Result<Vec<ScanEntry>, DelegationError> {
        self.delegate(session, |reply| Request::List { message, reply })
            .await
    }

    /// Requests a unique-id listing.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn uidl(
        &self,
        session: &Session,
        message: Option<MessageNumber>,
    ) -> Result<Vec<UidEntry>, DelegationError> {
        self.delegate(session, |reply| Request::Uidl { message, reply })
            .await
    }

    /// Fetches full message content.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn retrieve(
        &self,
        session: &Session,
        message: MessageNumber,
    ) -> Result<Option<String>, DelegationError> {
        self.delegate(session, |reply| Request::Retrieve { message, reply })
            .await
    }

    /// Fetches headers and the first `lines` body lines.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn top(
        &self,
        session: &Session,
        message: MessageNumber,
        lines: u32,
    ) -> Result<Option<String>, DelegationError> {
        self.delegate(session, |reply| Request::Top {
            message,
            lines,
            reply,
        })
        .await
    }

    /// Marks a message deleted.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn delete(
        &self,
        session: &Session,
        message: MessageNumber,
    ) -> Result<DeleteOutcome, DelegationError> {
        self.delegate(session, |reply| Request::Delete { message, reply })
            .await
    }

    /// Clears all deletion marks.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn reset(&self, session: &Session) -> Result<(), DelegationError> {
        self.delegate(session, |reply| Request::Reset { reply }).await
    }

    /// Commits deletion marks at the end of the session.
    ///
    /// # Errors
    ///
    /// See [`BackendBridge::delegate`].
    pub async fn commit(&self, session: &Session) -> Result<(), DelegationError> {
        self.delegate(session, |reply| Request::Commit { reply }).await
    }
}

/// Receiving side of the delegation channel.
#[derive(Debug)]
pub struct Delegations {
    receiver: mpsc::Receiver<Delegation>,
}

impl Delegations {
    /// Waits for the next delegation. `None` once every bridge is dropped.
    pub async fn recv(&mut self) -> Option<Delegation> {
        self.receiver.recv().await
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
    use crate::session::SessionId;

    fn session() -> Session {
        let mut session = Session::new(SessionId::new("bridge-test"), false, None);
        session.set_user("alice").unwrap();
        session
    }

    #[tokio::test]
    async fn test_round_trip_carries_correlation() {
        let (bridge, mut delegations) = channel(4, Duration::from_secs(5));

        let backend = tokio::spawn(async move {
            let delegation = delegations.recv().await.unwrap();
            assert_eq!(delegation.session.as_str(), "bridge-test");
            assert_eq!(delegation.user.as_deref(), Some("alice"));
            let id = delegation.id;
            match delegation.request {
                Request::Stat { reply } => reply.complete(Maildrop { count: 2, size: 460 }),
                other => panic!("unexpected {:?}", other.kind()),
            }
            id
        });

        let stat = bridge.stat(&session()).await.unwrap();
        assert_eq!(stat, Maildrop { count: 2, size: 460 });
        assert_eq!(backend.await.unwrap().get(), 1);
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let (bridge, mut delegations) = channel(4, Duration::from_secs(5));
        let backend = tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(delegation) = delegations.recv().await {
                ids.push(delegation.id);
                delegation.request.fail("nope");
            }
            ids
        });

        let session = session();
        for _ in 0..3 {
            assert_eq!(
                bridge.reset(&session).await,
                Err(DelegationError::Failed("nope".to_string()))
            );
        }
        drop(bridge);

        let ids = backend.await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_backend_never_answers() {
        let (bridge, mut delegations) = channel(4, Duration::from_secs(2));
        let backend = tokio::spawn(async move {
            // Keep the handle alive without answering.
            let delegation = delegations.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(delegation);
        });

        let result = bridge.commit(&session()).await;
        assert_eq!(result, Err(DelegationError::Timeout(Duration::from_secs(2))));
        backend.abort();
    }

    #[tokio::test]
    async fn test_abandoned_completion() {
        let (bridge, mut delegations) = channel(4, Duration::from_secs(5));
        tokio::spawn(async move {
            let delegation = delegations.recv().await.unwrap();
            drop(delegation);
        });

        let result = bridge.retrieve(&session(), MessageNumber::new(1).unwrap()).await;
        assert_eq!(result, Err(DelegationError::Abandoned));
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let (bridge, delegations) = channel(4, Duration::from_secs(5));
        drop(delegations);
        assert_eq!(
            bridge.stat(&session()).await,
            Err(DelegationError::Unavailable)
        );
    }
}
