//! Low-latency ephemeral key/value store.
//!
//! Holds the update buffer, one-time auth tokens and document leases. Keys
//! hold either a value with an optional expiry or a set of binary members.
//! Sets remember first-insertion order so that draining a buffer yields
//! edits in the order they arrived.
//!
//! [`EphemeralKv`] is the seam a shared network store plugs into;
//! [`EphemeralStore`] is the in-process default.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct OrderedSet {
    next_seq: u64,
    index: HashMap<Vec<u8>, u64>,
    order: BTreeMap<u64, Vec<u8>>,
}

impl OrderedSet {
    fn insert(&mut self, member: Vec<u8>) -> bool {
        if self.index.contains_key(&member) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(member.clone(), seq);
        self.order.insert(seq, member);
        true
    }

    fn remove(&mut self, member: &[u8]) -> bool {
        match self.index.remove(member) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    sets: HashMap<String, OrderedSet>,
}

impl Inner {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        if self.values.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn purge_expired(&mut self, now: Instant) {
        self.values.retain(|_, entry| entry.is_live(now));
    }
}

/// Key/value operations the buffer, token exchange and document lock rely on.
///
/// Every operation on a single key is atomic.
#[async_trait]
pub trait EphemeralKv: Send + Sync {
    /// Add a member. Returns false if it was already present.
    async fn set_add(&self, key: &str, member: Vec<u8>) -> bool;

    /// All members in first-insertion order.
    async fn set_members(&self, key: &str) -> Vec<Vec<u8>>;

    /// Remove exactly the given members. Returns how many were present.
    async fn set_remove(&self, key: &str, members: &[Vec<u8>]) -> usize;

    async fn set_card(&self, key: &str) -> usize;

    /// Keys of non-empty sets starting with `prefix`, sorted.
    async fn set_keys(&self, prefix: &str) -> Vec<String>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Atomic get-and-delete.
    async fn get_del(&self, key: &str) -> Option<Vec<u8>>;

    /// Set `key` only if it holds no live value.
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool;

    /// Extend the expiry of `key` if it still holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> bool;

    /// Delete `key` if it still holds `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> bool;

    /// Wait until some key is released through `delete_if_eq`, or `timeout`
    /// elapses, whichever comes first. Implementations without release
    /// notifications may simply sleep.
    async fn wait_for_release(&self, timeout: Duration);
}

/// In-process ephemeral store shared by the relay, buffer and lock.
///
/// Expired values are dropped when read and swept on every write of a new
/// value, so unredeemed tokens do not accumulate.
#[derive(Default)]
pub struct EphemeralStore {
    inner: Mutex<Inner>,
    released: Notify,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralKv for EphemeralStore {
    // ─── Sets ─────────────────────────────────────────────────────────

    async fn set_add(&self, key: &str, member: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().await;
        inner.sets.entry(key.to_string()).or_default().insert(member)
    }

    async fn set_members(&self, key: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner
            .sets
            .get(key)
            .map(|set| set.order.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn set_remove(&self, key: &str, members: &[Vec<u8>]) -> usize {
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sets.get_mut(key) else {
            return 0;
        };
        let removed = members.iter().filter(|m| set.remove(m)).count();
        if set.len() == 0 {
            inner.sets.remove(key);
        }
        removed
    }

    async fn set_card(&self, key: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.sets.get(key).map_or(0, OrderedSet::len)
    }

    async fn set_keys(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut keys: Vec<String> = inner
            .sets
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    // ─── Values ───────────────────────────────────────────────────────

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.purge_expired(now);
        let expires_at = ttl.map(|ttl| now + ttl);
        inner
            .values
            .insert(key.to_string(), Entry { value, expires_at });
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        inner
            .live_value(key, Instant::now())
            .map(|entry| entry.value.clone())
    }

    async fn get_del(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.live_value(key, now)?;
        inner.values.remove(key).map(|entry| entry.value)
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.purge_expired(now);
        if inner.values.contains_key(key) {
            return false;
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(now + ttl),
            },
        );
        true
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if !inner
            .live_value(key, now)
            .is_some_and(|entry| entry.value == expected)
        {
            return false;
        }
        if let Some(entry) = inner.values.get_mut(key) {
            entry.expires_at = Some(now + ttl);
        }
        true
    }

    /// Wakes anyone in `wait_for_release`.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if !inner
            .live_value(key, now)
            .is_some_and(|entry| entry.value == expected)
        {
            return false;
        }
        inner.values.remove(key);
        drop(inner);
        self.released.notify_waiters();
        true
    }

    async fn wait_for_release(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.released.notified()).await;
    }
}
