//! Publish/subscribe bus connecting relay replicas and downstream consumers.
//!
//! Topics are tokio broadcast channels created on first use. Every
//! subscriber gets an independent receiver buffering up to `capacity`
//! messages; lagging subscribers drop the oldest messages.
//!
//! [`Bus`] is the seam a cross-process transport plugs into; [`LocalBus`]
//! is the in-process default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

/// Topic carrying [`crate::protocol::BusEnvelope`]s between relay processes.
pub const RELAY_TOPIC: &str = "sync:relay";

#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub messages_published: u64,
    pub topics: usize,
}

/// Topic-based publish/subscribe.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish to every current subscriber of `topic`. Returns the number
    /// of local subscribers reached.
    async fn publish(&self, topic: &str, message: Vec<u8>) -> usize;

    /// Receive every message published to `topic` from now on.
    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Vec<u8>>>;

    async fn stats(&self) -> BusStats;
}

pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>>,
    capacity: usize,
    published: AtomicU64,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
            published: AtomicU64::new(0),
        }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Arc<Vec<u8>>> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                return sender.clone();
            }
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> usize {
        let sender = self.sender(topic).await;
        self.published.fetch_add(1, Ordering::Relaxed);
        sender.send(Arc::new(message)).unwrap_or(0)
    }

    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender(topic).await.subscribe()
    }

    async fn stats(&self) -> BusStats {
        BusStats {
            messages_published: self.published.load(Ordering::Relaxed),
            topics: self.topics.read().await.len(),
        }
    }
}
