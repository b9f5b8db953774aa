//! Update buffer: per-document set of pending client edits.
//!
//! Producers append without coordination; the collector drains, merges and
//! then removes exactly the members it drained, so edits appended between
//! drain and remove survive for the next run.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::ephemeral::EphemeralKv;

const KEY_PREFIX: &str = "sync:updates:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer member too short ({0} bytes)")]
    MalformedMember(usize),
}

/// A raw CRDT delta tagged with the user who produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingEdit {
    pub contributor: Uuid,
    pub payload: Vec<u8>,
}

impl PendingEdit {
    pub fn new(contributor: Uuid, payload: Vec<u8>) -> Self {
        Self {
            contributor,
            payload,
        }
    }

    /// Set member: 16-byte contributor id followed by the payload.
    fn to_member(&self) -> Vec<u8> {
        let mut member = Vec::with_capacity(16 + self.payload.len());
        member.extend_from_slice(self.contributor.as_bytes());
        member.extend_from_slice(&self.payload);
        member
    }

    fn from_member(member: &[u8]) -> Result<Self, BufferError> {
        if member.len() < 16 {
            return Err(BufferError::MalformedMember(member.len()));
        }
        let (id, payload) = member.split_at(16);
        let contributor = Uuid::from_slice(id).map_err(|_| BufferError::MalformedMember(member.len()))?;
        Ok(Self::new(contributor, payload.to_vec()))
    }
}

fn buffer_key(document: Uuid) -> String {
    format!("{KEY_PREFIX}{document}")
}

pub struct UpdateBuffer {
    store: Arc<dyn EphemeralKv>,
}

impl UpdateBuffer {
    pub fn new(store: Arc<dyn EphemeralKv>) -> Self {
        Self { store }
    }

    /// Buffer an edit. Returns false if the identical edit is already pending.
    pub async fn append(&self, document: Uuid, contributor: Uuid, payload: Vec<u8>) -> bool {
        let edit = PendingEdit::new(contributor, payload);
        self.store.set_add(&buffer_key(document), edit.to_member()).await
    }

    /// List pending edits in arrival order without removing them.
    ///
    /// Members that cannot be decoded are dropped from the buffer.
    pub async fn drain(&self, document: Uuid) -> Vec<PendingEdit> {
        let key = buffer_key(document);
        let mut edits = Vec::new();
        let mut malformed = Vec::new();

        for member in self.store.set_members(&key).await {
            match PendingEdit::from_member(&member) {
                Ok(edit) => edits.push(edit),
                Err(e) => {
                    log::warn!("Dropping buffered edit for document {document}: {e}");
                    malformed.push(member);
                }
            }
        }

        if !malformed.is_empty() {
            self.store.set_remove(&key, &malformed).await;
        }
        edits
    }

    /// Remove exactly `edits`. Returns how many were still pending.
    pub async fn remove(&self, document: Uuid, edits: &[PendingEdit]) -> usize {
        let members: Vec<Vec<u8>> = edits.iter().map(PendingEdit::to_member).collect();
        self.store.set_remove(&buffer_key(document), &members).await
    }

    pub async fn count(&self, document: Uuid) -> usize {
        self.store.set_card(&buffer_key(document)).await
    }

    /// Documents with at least one pending edit.
    pub async fn pending_documents(&self) -> Vec<Uuid> {
        self.store
            .set_keys(KEY_PREFIX)
            .await
            .iter()
            .filter_map(|key| Uuid::parse_str(&key[KEY_PREFIX.len()..]).ok())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::EphemeralStore;

    fn buffer() -> UpdateBuffer {
        UpdateBuffer::new(Arc::new(EphemeralStore::new()))
    }

    #[tokio::test]
    async fn test_append_suppresses_duplicates() {
        let buffer = buffer();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(buffer.append(doc, user, vec![1, 2, 3]).await);
        assert!(!buffer.append(doc, user, vec![1, 2, 3]).await);
        // same bytes from another contributor are a distinct edit
        assert!(buffer.append(doc, Uuid::new_v4(), vec![1, 2, 3]).await);
        assert_eq!(buffer.count(doc).await, 2);
    }

    #[tokio::test]
    async fn test_drain_does_not_remove() {
        let buffer = buffer();
        let doc = Uuid::new_v4();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        buffer.append(doc, u1, vec![1]).await;
        buffer.append(doc, u2, vec![2]).await;

        let edits = buffer.drain(doc).await;
        assert_eq!(edits, vec![PendingEdit::new(u1, vec![1]), PendingEdit::new(u2, vec![2])]);
        assert_eq!(buffer.count(doc).await, 2);
    }

    #[tokio::test]
    async fn test_remove_keeps_edits_appended_after_drain() {
        let buffer = buffer();
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();

        buffer.append(doc, user, vec![1]).await;
        let first = buffer.drain(doc).await;
        buffer.append(doc, user, vec![2]).await;

        assert_eq!(buffer.remove(doc, &first).await, 1);
        assert_eq!(buffer.drain(doc).await, vec![PendingEdit::new(user, vec![2])]);
    }

    #[tokio::test]
    async fn test_edit_appended_during_drain_survives_remove() {
        let store = Arc::new(test_support::AppendAfterDrain::new(Arc::new(EphemeralStore::new())));
        let buffer = UpdateBuffer::new(store.clone());
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        buffer.append(doc, user, vec![1]).await;
        store.arm(doc, PendingEdit::new(user, vec![2])).await;

        let drained = buffer.drain(doc).await;
        assert_eq!(drained, vec![PendingEdit::new(user, vec![1])]);
        assert_eq!(buffer.remove(doc, &drained).await, 1);
        assert_eq!(buffer.drain(doc).await, vec![PendingEdit::new(user, vec![2])]);
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let buffer = buffer();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        buffer.append(a, Uuid::new_v4(), vec![1]).await;

        assert_eq!(buffer.count(b).await, 0);
        assert!(buffer.drain(b).await.is_empty());
        assert_eq!(buffer.pending_documents().await, vec![a]);
    }

    #[tokio::test]
    async fn test_malformed_members_are_dropped() {
        let store = Arc::new(EphemeralStore::new());
        let buffer = UpdateBuffer::new(store.clone());
        let doc = Uuid::new_v4();
        store.set_add(&buffer_key(doc), vec![1, 2, 3]).await;
        buffer.append(doc, Uuid::new_v4(), vec![7]).await;

        assert_eq!(buffer.drain(doc).await.len(), 1);
        assert_eq!(buffer.count(doc).await, 1);
    }
}
