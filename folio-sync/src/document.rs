//! CRDT document store.
//!
//! Wraps a single `yrs::Doc` and exposes the operations the collector and
//! compactor need: merge, diff, snapshot, reconstruction from a snapshot and
//! lineage reconciliation. Pure logic, no I/O.
//!
//! Every document is created with garbage collection disabled so that deleted
//! content survives long enough to be materialised from an older snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use yrs::undo::UndoManager;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encode, Encoder, EncoderV1};
use yrs::{Doc, Options, ReadTxn, Snapshot, StateVector, Transact, Update};

/// Root `Text` holding a post body.
pub const ROOT_BODY: &str = "body";
/// Root `Map` holding rendered attributes (title, subtitle, ...).
pub const ROOT_ATTRS: &str = "attrs";
/// Root `Map` holding canvas shapes keyed by shape id.
pub const ROOT_SHAPES: &str = "shapes";

/// Transaction origin used while replaying a missing delta that is undone
/// right afterwards.
pub const SNAPSHOT_ORIGIN: &str = "snapshot";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("failed to apply update: {0}")]
    ApplyFailed(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("cannot reconstruct snapshot: {0}")]
    Reconstruction(String),
}

/// Canonical persisted form of a document: the full update log and its
/// version summary, both lib0 v1 encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtState {
    pub update: Vec<u8>,
    pub vector: Vec<u8>,
}

impl CrdtState {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty()
    }

    pub fn len(&self) -> usize {
        self.update.len()
    }
}

/// Frontier over a document's content. Two tokens compare equal iff they
/// describe the same inserted and deleted content.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotToken(Snapshot);

impl SnapshotToken {
    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        Snapshot::decode_v1(bytes)
            .map(SnapshotToken)
            .map_err(|e| DocumentError::MalformedSnapshot(e.to_string()))
    }
}

fn decode_update(bytes: &[u8]) -> Result<Update, DocumentError> {
    Update::decode_v1(bytes).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))
}

fn decode_vector(bytes: &[u8]) -> Result<StateVector, DocumentError> {
    if bytes.is_empty() {
        return Ok(StateVector::default());
    }
    StateVector::decode_v1(bytes).map_err(|e| DocumentError::MalformedStateVector(e.to_string()))
}

/// A single collaborative document.
pub struct SyncDocument {
    doc: Doc,
}

impl Default for SyncDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDocument {
    pub fn new() -> Self {
        let options = Options {
            skip_gc: true,
            ..Options::default()
        };
        Self {
            doc: Doc::with_options(options),
        }
    }

    /// Load a document from an encoded update. Empty bytes yield an empty document.
    pub fn from_update(update: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        document.merge(update)?;
        Ok(document)
    }

    pub fn from_state(state: &CrdtState) -> Result<Self, DocumentError> {
        Self::from_update(&state.update)
    }

    /// Merge one delta. Replaying an already merged delta is a no-op.
    pub fn merge(&self, delta: &[u8]) -> Result<(), DocumentError> {
        self.merge_all(std::iter::once(delta))
    }

    /// Merge several deltas as one combined change.
    ///
    /// Every delta is decoded before any is applied, so a malformed delta
    /// leaves the document untouched.
    pub fn merge_all<'a, I>(&self, deltas: I) -> Result<(), DocumentError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let updates = deltas
            .into_iter()
            .filter(|delta| !delta.is_empty())
            .map(decode_update)
            .collect::<Result<Vec<_>, _>>()?;
        if updates.is_empty() {
            return Ok(());
        }

        let mut txn = self.doc.transact_mut();
        for update in updates {
            txn.apply_update(update)
                .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SnapshotToken {
        SnapshotToken(self.doc.transact().snapshot())
    }

    /// Encoded state vector (version summary).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full document as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn to_state(&self) -> CrdtState {
        let txn = self.doc.transact();
        CrdtState {
            update: txn.encode_state_as_update_v1(&StateVector::default()),
            vector: txn.state_vector().encode_v1(),
        }
    }

    /// Minimal delta a peer at `remote_vector` needs to catch up.
    /// An empty vector means the peer has nothing.
    pub fn diff_since(&self, remote_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = decode_vector(remote_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    /// Materialise the document exactly as it was at `token`.
    pub fn reconstruct(&self, token: &SnapshotToken) -> Result<SyncDocument, DocumentError> {
        let mut encoder = EncoderV1::new();
        self.doc
            .transact()
            .encode_state_from_snapshot(&token.0, &mut encoder)
            .map_err(|e| DocumentError::Reconstruction(e.to_string()))?;
        Self::from_update(&encoder.to_vec())
    }

    /// Bring this document to the content of `target`, keeping this
    /// document's version lineage.
    ///
    /// Whatever this document has that `target` lacks is replayed onto
    /// `target` under [`SNAPSHOT_ORIGIN`] and immediately undone; what is
    /// left of `target` beyond our state vector is merged back here.
    pub fn reconcile_with(&self, target: SyncDocument) -> Result<(), DocumentError> {
        let working_vector = self.doc.transact().state_vector();
        let target_vector = target.doc.transact().state_vector();
        let missing = self.doc.transact().encode_diff_v1(&target_vector);

        let mut undo = target.undo_manager();
        {
            let mut txn = target.doc.transact_mut_with(SNAPSHOT_ORIGIN);
            txn.apply_update(decode_update(&missing)?)
                .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
        }
        while undo.undo_blocking() {}
        drop(undo);

        let revert = target.doc.transact().encode_diff_v1(&working_vector);
        self.merge(&revert)
    }

    /// Undo every change made since `token`.
    pub fn revert_to(&self, token: &SnapshotToken) -> Result<(), DocumentError> {
        let past = self.reconstruct(token)?;
        self.reconcile_with(past)
    }

    fn undo_manager(&self) -> UndoManager<()> {
        let body = self.doc.get_or_insert_text(ROOT_BODY);
        let attrs = self.doc.get_or_insert_map(ROOT_ATTRS);
        let shapes = self.doc.get_or_insert_map(ROOT_SHAPES);

        let mut undo = UndoManager::<()>::new(&self.doc, &body);
        undo.expand_scope(&attrs);
        undo.expand_scope(&shapes);
        undo.include_origin(SNAPSHOT_ORIGIN);
        undo
    }

    pub(crate) fn doc(&self) -> &Doc {
        &self.doc
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use yrs::{Map, Text, WriteTxn};

    /// Build a delta that inserts `text` into the body of `base` at `index`.
    pub fn insert_text(base: &SyncDocument, index: u32, text: &str) -> Vec<u8> {
        let doc = base.doc();
        let mut txn = doc.transact_mut();
        let body = txn.get_or_insert_text(ROOT_BODY);
        body.insert(&mut txn, index, text);
        txn.encode_update_v1()
    }

    pub fn remove_text(base: &SyncDocument, index: u32, len: u32) -> Vec<u8> {
        let doc = base.doc();
        let mut txn = doc.transact_mut();
        let body = txn.get_or_insert_text(ROOT_BODY);
        body.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    pub fn set_attr(base: &SyncDocument, key: &str, value: &str) -> Vec<u8> {
        let doc = base.doc();
        let mut txn = doc.transact_mut();
        let attrs = txn.get_or_insert_map(ROOT_ATTRS);
        attrs.insert(&mut txn, key, value);
        txn.encode_update_v1()
    }

    pub fn body(document: &SyncDocument) -> String {
        crate::view::plain_text(document)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_empty_update_is_empty_document() {
        let doc = SyncDocument::from_update(&[]).unwrap();
        assert_eq!(body(&doc), "");
        assert_eq!(doc.snapshot(), SyncDocument::new().snapshot());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let author = SyncDocument::new();
        let delta = insert_text(&author, 0, "hello");

        let doc = SyncDocument::new();
        doc.merge(&delta).unwrap();
        let once = doc.snapshot();
        doc.merge(&delta).unwrap();

        assert_eq!(doc.snapshot(), once);
        assert_eq!(body(&doc), "hello");
    }

    #[test]
    fn test_malformed_delta_leaves_document_untouched() {
        let author = SyncDocument::new();
        let good = insert_text(&author, 0, "abc");
        let bad = vec![0xFFu8, 0xFF, 0xFF];
        let doc = SyncDocument::new();

        let err = doc.merge_all([good.as_slice(), bad.as_slice()]);
        assert!(matches!(err, Err(DocumentError::MalformedUpdate(_))));
        assert_eq!(body(&doc), "");
    }

    #[test]
    fn test_snapshot_changes_only_on_content_change() {
        let author = SyncDocument::new();
        let doc = SyncDocument::new();
        let before = doc.snapshot();

        doc.merge(&insert_text(&author, 0, "x")).unwrap();
        assert_ne!(before, doc.snapshot());

        let again = doc.snapshot();
        doc.merge(&[]).unwrap();
        assert_eq!(again, doc.snapshot());
    }

    #[test]
    fn test_snapshot_token_encoding() {
        let author = SyncDocument::new();
        let doc = SyncDocument::new();
        doc.merge(&insert_text(&author, 0, "token")).unwrap();

        let token = doc.snapshot();
        let decoded = SnapshotToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
        assert!(SnapshotToken::decode(&[0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_diff_since_brings_peer_up_to_date() {
        let author = SyncDocument::new();
        insert_text(&author, 0, "shared ");
        let peer = SyncDocument::from_update(&author.encode_state()).unwrap();
        insert_text(&author, 7, "history");

        let diff = author.diff_since(&peer.state_vector()).unwrap();
        peer.merge(&diff).unwrap();
        assert_eq!(body(&peer), "shared history");

        let full = author.diff_since(&[]).unwrap();
        assert_eq!(body(&SyncDocument::from_update(&full).unwrap()), "shared history");
    }

    #[test]
    fn test_reconstruct_past_state() {
        let doc = SyncDocument::new();
        insert_text(&doc, 0, "first");
        let early = doc.snapshot();
        insert_text(&doc, 5, " second");
        remove_text(&doc, 0, 5);

        let past = doc.reconstruct(&early).unwrap();
        assert_eq!(body(&past), "first");
        assert_eq!(body(&doc), " second");
    }

    #[test]
    fn test_reconcile_forward() {
        let origin = SyncDocument::new();
        insert_text(&origin, 0, "abc");
        let early = origin.snapshot();
        insert_text(&origin, 3, "def");
        let late = origin.snapshot();

        let working = origin.reconstruct(&early).unwrap();
        working.reconcile_with(origin.reconstruct(&late).unwrap()).unwrap();
        assert_eq!(body(&working), "abcdef");
    }

    #[test]
    fn test_revert_to_undoes_later_changes() {
        let doc = SyncDocument::new();
        insert_text(&doc, 0, "keep");
        set_attr(&doc, "title", "Draft");
        let checkpoint = doc.snapshot();
        insert_text(&doc, 4, " and drop");
        remove_text(&doc, 0, 2);

        doc.revert_to(&checkpoint).unwrap();
        assert_eq!(body(&doc), "keep");
    }

    #[test]
    fn test_crdt_state_roundtrip() {
        let doc = SyncDocument::new();
        insert_text(&doc, 0, "persisted");
        let state = doc.to_state();
        assert!(!state.is_empty());

        let loaded = SyncDocument::from_state(&state).unwrap();
        assert_eq!(body(&loaded), "persisted");
        assert_eq!(loaded.state_vector(), state.vector);
    }
}
