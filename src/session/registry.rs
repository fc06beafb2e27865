//! Session registry
//!
//! One independent session per (user, bot) pair, owned by the host process.
//! No ambient globals: everything goes through create/lookup/remove here.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::SessionHandle;

/// Key identifying one logical session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub bot_id: String,
}

impl SessionKey {
    pub fn new(user_id: &str, bot_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            bot_id: bot_id.to_string(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.bot_id)
    }
}

/// Registry of live sessions. Sessions share no mutable state besides
/// persistence; the map only hands out control handles.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; refuses to replace a live one for the same key
    pub async fn insert(&self, key: SessionKey, handle: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            warn!(session = %key, "Session already registered, refusing duplicate");
            return false;
        }
        info!(session = %key, "Session registered");
        sessions.insert(key, handle);
        true
    }

    pub async fn lookup(&self, key: &SessionKey) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Remove and return the handle so the caller can stop it
    pub async fn remove(&self, key: &SessionKey) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.write().await.remove(key);
        if removed.is_some() {
            info!(session = %key, "Session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("user-1", "bot-a");
        let handle = Arc::new(SessionHandle::detached());

        assert!(registry.insert(key.clone(), handle).await);
        assert!(registry.lookup(&key).await.is_some());
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(&key).await.is_some());
        assert!(registry.lookup(&key).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_key_refused() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("user-1", "bot-a");
        assert!(
            registry
                .insert(key.clone(), Arc::new(SessionHandle::detached()))
                .await
        );
        assert!(
            !registry
                .insert(key.clone(), Arc::new(SessionHandle::detached()))
                .await
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_same_user_different_bots_are_independent() {
        let registry = SessionRegistry::new();
        assert!(
            registry
                .insert(
                    SessionKey::new("user-1", "bot-a"),
                    Arc::new(SessionHandle::detached())
                )
                .await
        );
        assert!(
            registry
                .insert(
                    SessionKey::new("user-1", "bot-b"),
                    Arc::new(SessionHandle::detached())
                )
                .await
        );
        assert_eq!(registry.len().await, 2);
    }
}
