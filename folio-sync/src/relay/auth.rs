//! Connection authentication and the document permission seam.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ephemeral::EphemeralKv;

const TOKEN_PREFIX: &str = "auth:token:";
const TOKEN_LEN: usize = 32;

/// Single-use tokens exchanged for a user identity on ESTABLISH.
pub struct TokenExchange {
    store: Arc<dyn EphemeralKv>,
    ttl: Duration,
}

impl TokenExchange {
    pub fn new(store: Arc<dyn EphemeralKv>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mint a token for `user`, valid once within the configured TTL.
    pub async fn issue(&self, user: Uuid) -> String {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        self.store
            .put(
                &format!("{TOKEN_PREFIX}{token}"),
                user.as_bytes().to_vec(),
                Some(self.ttl),
            )
            .await;
        token
    }

    /// Resolve and consume a token.
    pub async fn redeem(&self, token: &str) -> Option<Uuid> {
        if token.is_empty() {
            return None;
        }
        let value = self.store.get_del(&format!("{TOKEN_PREFIX}{token}")).await?;
        Uuid::from_slice(&value).ok()
    }
}

/// External authorization collaborator consulted before a session binds.
#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn can_edit(&self, user: Uuid, document: Uuid) -> bool;
}

pub struct AllowAll;

#[async_trait]
impl PermissionCheck for AllowAll {
    async fn can_edit(&self, _user: Uuid, _document: Uuid) -> bool {
        true
    }
}

/// Explicit per-document grants.
#[derive(Default)]
pub struct StaticPermissions {
    grants: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, user: Uuid, document: Uuid) {
        self.grants.write().await.entry(document).or_default().insert(user);
    }

    pub async fn revoke(&self, user: Uuid, document: Uuid) {
        if let Some(users) = self.grants.write().await.get_mut(&document) {
            users.remove(&user);
        }
    }
}

#[async_trait]
impl PermissionCheck for StaticPermissions {
    async fn can_edit(&self, user: Uuid, document: Uuid) -> bool {
        self.grants
            .read()
            .await
            .get(&document)
            .is_some_and(|users| users.contains(&user))
    }
}
