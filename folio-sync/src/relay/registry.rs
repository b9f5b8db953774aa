//! Process-local fan-out registry: document id → bound sessions.
//!
//! Each document gets its own broadcast channel so that frames are isolated
//! between documents. Every bound session holds a receiver buffering up to
//! `capacity` encoded frames; lagging sessions drop the oldest ones.
//! Registries of different relay processes are kept consistent only through
//! the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub frames_sent: u64,
    pub documents: usize,
    pub sessions: usize,
}

/// Sessions bound to one document.
struct SessionGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// connection id → user id
    sessions: HashMap<Uuid, Uuid>,
}

impl SessionGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: HashMap::new(),
        }
    }
}

pub struct SessionRegistry {
    groups: RwLock<HashMap<Uuid, SessionGroup>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Bind a connection to a document. Returns the receiver the
    /// connection forwards frames from.
    pub async fn register(
        &self,
        document: Uuid,
        connection: Uuid,
        user: Uuid,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(document)
            .or_insert_with(|| SessionGroup::new(self.capacity));
        group.sessions.insert(connection, user);
        group.sender.subscribe()
    }

    /// Unbind a connection. The document entry is dropped with its last session.
    pub async fn unregister(&self, document: Uuid, connection: Uuid) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get_mut(&document) else {
            return false;
        };
        let removed = group.sessions.remove(&connection).is_some();
        if group.sessions.is_empty() {
            groups.remove(&document);
            log::debug!("Dropped session group for document {document}");
        }
        removed
    }

    /// Send an encoded frame to every session bound to `document`, sender
    /// included. Returns the number of receivers reached.
    pub async fn broadcast(&self, document: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let groups = self.groups.read().await;
        let Some(group) = groups.get(&document) else {
            return 0;
        };
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        group.sender.send(frame).unwrap_or(0)
    }

    pub async fn session_count(&self, document: Uuid) -> usize {
        self.groups
            .read()
            .await
            .get(&document)
            .map_or(0, |group| group.sessions.len())
    }

    pub async fn stats(&self) -> RegistryStats {
        let groups = self.groups.read().await;
        RegistryStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            documents: groups.len(),
            sessions: groups.values().map(|group| group.sessions.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_bound_session() {
        let registry = SessionRegistry::new(16);
        let doc = Uuid::new_v4();
        let mut a = registry.register(doc, Uuid::new_v4(), Uuid::new_v4()).await;
        let mut b = registry.register(doc, Uuid::new_v4(), Uuid::new_v4()).await;

        assert_eq!(registry.broadcast(doc, Arc::new(vec![3, 1])).await, 2);
        assert_eq!(*a.recv().await.unwrap(), vec![3, 1]);
        assert_eq!(*b.recv().await.unwrap(), vec![3, 1]);
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let registry = SessionRegistry::new(16);
        let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx = registry.register(d1, Uuid::new_v4(), Uuid::new_v4()).await;
        registry.register(d2, Uuid::new_v4(), Uuid::new_v4()).await;

        registry.broadcast(d2, Arc::new(vec![1])).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.broadcast(Uuid::new_v4(), Arc::new(vec![1])).await, 0);
    }

    #[tokio::test]
    async fn test_last_unregister_drops_group() {
        let registry = SessionRegistry::new(16);
        let doc = Uuid::new_v4();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let user = Uuid::new_v4();
        registry.register(doc, c1, user).await;
        registry.register(doc, c2, user).await;
        assert_eq!(registry.session_count(doc).await, 2);

        assert!(registry.unregister(doc, c1).await);
        let stats = registry.stats().await;
        assert_eq!((stats.documents, stats.sessions), (1, 1));
        assert!(registry.unregister(doc, c2).await);
        assert!(!registry.unregister(doc, c2).await);

        let stats = registry.stats().await;
        assert_eq!((stats.documents, stats.sessions), (0, 0));
    }
}
