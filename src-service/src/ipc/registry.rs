//! Connected session registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use sotto_common::security::peer_verify::PeerCred;
use tokio::sync::Mutex;

use crate::daemon::SessionId;

/// One connected client.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: PeerCred,
    pub connected_at: Instant,
}

/// Tracks connected sessions and hands out their ids.
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a newly verified connection, returning its session id.
    pub async fn register(&self, peer: PeerCred) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = SessionInfo {
            id,
            peer,
            connected_at: Instant::now(),
        };
        self.sessions.lock().await.insert(id, info);
        id
    }

    /// Remove a session. Removal is idempotent.
    pub async fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.lock().await.remove(&id)
    }

    /// Number of currently connected sessions.
    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerCred {
        PeerCred {
            uid: 1000,
            pid: Some(42),
        }
    }

    #[tokio::test]
    async fn test_register_assigns_increasing_ids() {
        let registry = SessionRegistry::new();
        let a = registry.register(peer()).await;
        let b = registry.register(peer()).await;
        assert!(b > a);
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.register(peer()).await;

        let removed = registry.remove(id).await;
        assert_eq!(removed.map(|info| info.id), Some(id));

        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.count().await, 0);
    }
}
