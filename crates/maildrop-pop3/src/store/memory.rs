use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionStore, StoreError};
use crate::session::{Session, SessionId};

/// In-process session store, the server default.
///
/// Clones share the same map. Every operation holds the lock for a single
/// map access and never across an await point of the caller.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Returns `true` if no session is stored.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn set(&self, id: &SessionId, session: Session) -> Result<(), StoreError> {
        self.inner.write().await.insert(id.clone(), session);
        Ok(())
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), StoreError> {
        self.inner.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<SessionId, Session>, StoreError> {
        Ok(self.inner.read().await.clone())
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
    use crate::session::SessionState;

    fn session(id: &str) -> (SessionId, Session) {
        let id = SessionId::new(id);
        (id.clone(), Session::new(id, false, None))
    }

    #[tokio::test]
    async fn test_set_get_destroy() {
        let store = MemorySessionStore::new();
        let (id, session) = session("one");

        assert_eq!(store.get(&id).await.unwrap(), None);
        store.set(&id, session.clone()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(session));

        store.destroy(&id).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_destroy_absent_is_noop() {
        let store = MemorySessionStore::new();
        let (id, session) = session("one");
        store.set(&id, session).await.unwrap();

        store.destroy(&id).await.unwrap();
        store.destroy(&id).await.unwrap();
        store.destroy(&SessionId::new("never")).await.unwrap();
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_set_replaces() {
        let store = MemorySessionStore::new();
        let (id, mut session) = session("one");
        store.set(&id, session.clone()).await.unwrap();

        session.set_user("alice").unwrap();
        session.advance(SessionState::Transaction).unwrap();
        store.set(&id, session).await.unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.state(), SessionState::Transaction);
        assert_eq!(loaded.user(), Some("alice"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_keys() {
        let store = MemorySessionStore::new();
        let mut tasks = Vec::new();

        for n in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let (id, mut session) = session(&format!("session-{n}"));
                store.set(&id, session.clone()).await.unwrap();
                session.set_user(format!("user-{n}")).unwrap();
                store.set(&id, session).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 64);
        for (id, session) in all {
            let n = id.as_str().trim_start_matches("session-");
            assert_eq!(session.user(), Some(format!("user-{n}").as_str()));
        }
    }
}
