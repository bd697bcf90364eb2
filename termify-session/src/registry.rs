use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Map from session id to session.
///
/// Lookups share a read lock; inserts and removals are serialized. Sessions
/// are handed out as `Arc`s, so operations on one session never hold the map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Register a new session. On conflict the existing entry is returned and
    /// nothing changes.
    pub async fn insert(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session.id()) {
            return Err(Arc::clone(existing));
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Remove `id`, but only if it still maps to `session`.
    pub async fn remove_if_same(&self, id: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Empty the map, returning everything that was in it.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }
}
