//! Document-scoped exclusive lease.
//!
//! The collector and compactor of one document share a single lease key.
//! A held lease is renewed in the background; if a renewal finds the lease
//! gone, the guard's cancellation token fires so the holder can abort
//! before committing anything.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ephemeral::EphemeralKv;

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration
    pub lease: Duration,
    /// How often a held lease is extended
    pub renew_interval: Duration,
    /// How long `acquire` waits before giving up
    pub acquire_timeout: Duration,
    /// Polling fallback while waiting for a release
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out acquiring lock for document {0}")]
    Timeout(Uuid),
    #[error("cancelled while acquiring lock for document {0}")]
    Cancelled(Uuid),
}

fn lock_key(document: Uuid) -> String {
    format!("lock:document:{document}")
}

pub struct DocumentLock {
    store: Arc<dyn EphemeralKv>,
    config: LockConfig,
}

impl DocumentLock {
    pub fn new(store: Arc<dyn EphemeralKv>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Wait for the lease, up to the configured timeout or until `cancel` fires.
    pub async fn acquire(
        &self,
        document: Uuid,
        cancel: &CancellationToken,
    ) -> Result<LockGuard, LockError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            if let Some(guard) = self.try_acquire(document).await {
                return Ok(guard);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout(document));
            }
            let wait = self.config.retry_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled(document)),
                _ = self.store.wait_for_release(wait) => {}
            }
        }
    }

    /// Take the lease if nobody holds it.
    pub async fn try_acquire(&self, document: Uuid) -> Option<LockGuard> {
        let key = lock_key(document);
        let token = Uuid::new_v4().as_bytes().to_vec();
        if !self
            .store
            .set_nx(&key, token.clone(), self.config.lease)
            .await
        {
            return None;
        }

        log::debug!("Acquired lock for document {document}");
        let lost = CancellationToken::new();
        let renewal = tokio::spawn(renew(
            self.store.clone(),
            key.clone(),
            token.clone(),
            self.config.clone(),
            lost.clone(),
        ));
        Some(LockGuard {
            document,
            key,
            token,
            store: self.store.clone(),
            lost,
            renewal,
        })
    }
}

async fn renew(
    store: Arc<dyn EphemeralKv>,
    key: String,
    token: Vec<u8>,
    config: LockConfig,
    lost: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = lost.cancelled() => return,
            _ = tokio::time::sleep(config.renew_interval) => {}
        }
        if !store.expire_if_eq(&key, &token, config.lease).await {
            log::warn!("Lease {key} lost before renewal, cancelling holder");
            lost.cancel();
            return;
        }
    }
}

/// A held lease. Release it explicitly; dropping only stops renewal and
/// leaves the lease to expire.
pub struct LockGuard {
    document: Uuid,
    key: String,
    token: Vec<u8>,
    store: Arc<dyn EphemeralKv>,
    lost: CancellationToken,
    renewal: JoinHandle<()>,
}

impl LockGuard {
    /// Fires when the lease could not be renewed.
    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Release the lease if we still own it.
    pub async fn release(self) -> bool {
        self.renewal.abort();
        let released = self.store.delete_if_eq(&self.key, &self.token).await;
        if released {
            log::debug!("Released lock for document {}", self.document);
        } else {
            log::warn!("Lock for document {} expired before release", self.document);
        }
        released
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
