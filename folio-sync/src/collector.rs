//! Sync collector: folds a document's buffered edits into its canonical
//! state and snapshot history.
//!
//! One run per document at a time, serialized by [`DocumentLock`]. A run
//! groups pending edits by contributor (first-seen order), merges each group
//! and records a snapshot whenever a group changed the observable content.
//! Everything a run writes is committed as one batch; edits appended during
//! the run stay buffered and are reported through
//! [`CollectOutcome::has_more`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::{PendingEdit, UpdateBuffer};
use crate::document::{DocumentError, SyncDocument};
use crate::lock::{DocumentLock, LockError, LockGuard};
use crate::notify::{notify_all, DownstreamEvent, Notifier};
use crate::storage::{
    CharacterCount, CollectionCommit, DocumentRecord, DocumentStore, NewSnapshot, StoreError,
};
use crate::view::{self, DocumentKind};

const COUNT_BUCKET_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("collection of document {0} cancelled")]
    Cancelled(Uuid),
}

/// Result of one collector run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectOutcome {
    /// Edits drained and removed from the buffer
    pub merged_edits: usize,
    pub snapshots_created: usize,
    /// Edits arrived during the run; another run is needed
    pub has_more: bool,
}

pub struct Collector {
    store: Arc<DocumentStore>,
    buffer: Arc<UpdateBuffer>,
    lock: Arc<DocumentLock>,
    notifier: Arc<dyn Notifier>,
}

impl Collector {
    pub fn new(
        store: Arc<DocumentStore>,
        buffer: Arc<UpdateBuffer>,
        lock: Arc<DocumentLock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            buffer,
            lock,
            notifier,
        }
    }

    pub async fn collect(
        &self,
        document: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CollectOutcome, CollectError> {
        self.collect_at(document, Utc::now(), cancel).await
    }

    /// Run the collector as if the current time were `now`.
    pub async fn collect_at(
        &self,
        document: Uuid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CollectOutcome, CollectError> {
        if self.buffer.count(document).await == 0 {
            log::trace!("Nothing pending for document {document}");
            return Ok(CollectOutcome::default());
        }

        let guard = self.lock.acquire(document, cancel).await?;
        let result = self.run_locked(document, now, cancel, &guard).await;
        guard.release().await;

        let (outcome, kind) = result?;
        if outcome.snapshots_created > 0 {
            notify_all(
                self.notifier.as_ref(),
                DownstreamEvent::after_collection(document, kind),
            )
            .await;
        }
        log::info!(
            "Collected document {document}: {} edits, {} snapshots{}",
            outcome.merged_edits,
            outcome.snapshots_created,
            if outcome.has_more { ", more pending" } else { "" }
        );
        Ok(outcome)
    }

    async fn run_locked(
        &self,
        document: Uuid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        guard: &LockGuard,
    ) -> Result<(CollectOutcome, DocumentKind), CollectError> {
        let edits = self.buffer.drain(document).await;
        checkpoint(document, cancel, guard)?;

        let record = self.store.load_document(document)?;
        if edits.is_empty() {
            return Ok((CollectOutcome::default(), record.kind));
        }

        let last = self.store.last_snapshot_at(document)?;
        let now_ms = now.timestamp_millis();
        let stamp_ms = last.map_or(now_ms, |last| now_ms.max(last + 1));

        let pass = merge_pass(&record, &edits, stamp_ms, cancel, guard)?;
        let snapshots_created = pass.snapshots.len();

        checkpoint(document, cancel, guard)?;
        let view = (snapshots_created > 0).then(|| {
            let updated_at = DateTime::from_timestamp_millis(stamp_ms).unwrap_or(now);
            view::render(&pass.document, record.kind, updated_at)
        });
        self.store.commit_collection(CollectionCommit {
            document_id: document,
            state: pass.document.to_state(),
            snapshots: pass.snapshots,
            character_counts: pass.character_counts,
            view,
            committed_at_ms: stamp_ms,
        })?;

        self.buffer.remove(document, &edits).await;
        let has_more = self.buffer.count(document).await > 0;

        Ok((
            CollectOutcome {
                merged_edits: edits.len(),
                snapshots_created,
                has_more,
            },
            record.kind,
        ))
    }
}

fn checkpoint(
    document: Uuid,
    cancel: &CancellationToken,
    guard: &LockGuard,
) -> Result<(), CollectError> {
    if cancel.is_cancelled() || guard.is_lost() {
        log::warn!("Collection of document {document} aborted before commit");
        return Err(CollectError::Cancelled(document));
    }
    Ok(())
}

struct MergePass {
    document: SyncDocument,
    snapshots: Vec<NewSnapshot>,
    character_counts: Vec<CharacterCount>,
}

/// Contributors with their edits, in the order each contributor first appears.
fn group_by_contributor(edits: &[PendingEdit]) -> Vec<(Uuid, Vec<&[u8]>)> {
    let mut groups: Vec<(Uuid, Vec<&[u8]>)> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    for edit in edits {
        let slot = *index.entry(edit.contributor).or_insert_with(|| {
            groups.push((edit.contributor, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(edit.payload.as_slice());
    }
    groups
}

fn merge_pass(
    record: &DocumentRecord,
    edits: &[PendingEdit],
    stamp_ms: i64,
    cancel: &CancellationToken,
    guard: &LockGuard,
) -> Result<MergePass, CollectError> {
    let document = SyncDocument::from_state(&record.state)?;
    let track_characters = record.kind == DocumentKind::Post;
    let bucket_ms = stamp_ms.div_euclid(COUNT_BUCKET_MS) * COUNT_BUCKET_MS;

    let mut snapshots = Vec::new();
    let mut character_counts = Vec::new();
    let mut text = if track_characters {
        view::plain_text(&document)
    } else {
        String::new()
    };

    for (contributor, payloads) in group_by_contributor(edits) {
        let before = document.snapshot();
        if let Err(e) = document.merge_all(payloads.iter().copied()) {
            log::warn!(
                "Combined merge for contributor {contributor} on document {} failed ({e}), merging edits individually",
                record.id
            );
            for payload in &payloads {
                if let Err(e) = document.merge(payload) {
                    log::warn!("Discarding undecodable edit from {contributor}: {e}");
                }
            }
        }
        let after = document.snapshot();

        if before != after {
            snapshots.push(NewSnapshot {
                created_at_ms: stamp_ms,
                order: snapshots.len() as u32,
                token: after.encode(),
                contributors: vec![contributor],
            });

            if track_characters {
                let next = view::plain_text(&document);
                let delta = view::character_delta(&text, &next);
                if !delta.is_empty() {
                    character_counts.push(CharacterCount {
                        contributor,
                        bucket_ms,
                        additions: delta.additions,
                        deletions: delta.deletions,
                    });
                }
                text = next;
            }
        }

        checkpoint(record.id, cancel, guard)?;
    }

    Ok(MergePass {
        document,
        snapshots,
        character_counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::test_support::AppendAfterDrain;
    use crate::document::test_support::*;
    use crate::document::{CrdtState, SnapshotToken};
    use crate::ephemeral::EphemeralStore;
    use crate::lock::LockConfig;
    use crate::notify::NotifyError;
    use crate::storage::StoreConfig;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DownstreamEvent>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, event: DownstreamEvent) -> Result<(), NotifyError> {
            self.0.lock().await.push(event);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<DocumentStore>,
        buffer: Arc<UpdateBuffer>,
        ephemeral: Arc<EphemeralStore>,
        events: Arc<Recorder>,
        collector: Collector,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let ephemeral = Arc::new(EphemeralStore::new());
        let buffer = Arc::new(UpdateBuffer::new(ephemeral.clone()));
        let lock = Arc::new(DocumentLock::new(ephemeral.clone(), LockConfig::default()));
        let events = Arc::new(Recorder::default());
        let collector = Collector::new(store.clone(), buffer.clone(), lock, events.clone());
        Fixture {
            _dir: dir,
            store,
            buffer,
            ephemeral,
            events,
            collector,
        }
    }

    fn create(store: &DocumentStore, kind: DocumentKind) -> Uuid {
        let id = Uuid::new_v4();
        store.create_document(id, kind, CrdtState::default(), 0).unwrap();
        id
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn test_nothing_pending_is_noop() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        let outcome = fx.collector.collect(doc, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, CollectOutcome::default());
        assert!(fx.store.list_snapshots(doc).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_per_contributor_in_first_seen_order() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

        let author = SyncDocument::new();
        let first = insert_text(&author, 0, "hello");
        let second = insert_text(&author, 5, " world");
        let third = insert_text(&author, 11, "!");
        fx.buffer.append(doc, u1, first).await;
        fx.buffer.append(doc, u2, second).await;
        fx.buffer.append(doc, u1, third).await;

        let outcome = fx.collector.collect_at(doc, at(10_000), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.merged_edits, 3);
        assert_eq!(outcome.snapshots_created, 2);
        assert!(!outcome.has_more);

        let snapshots = fx.store.list_snapshots(doc).unwrap();
        let attribution: Vec<(u32, Vec<Uuid>)> =
            snapshots.iter().map(|s| (s.order, s.contributors.clone())).collect();
        assert_eq!(attribution, vec![(0, vec![u1]), (1, vec![u2])]);
        assert!(snapshots.iter().all(|s| s.created_at_ms == 10_000));

        let canonical = SyncDocument::from_state(&fx.store.load_document(doc).unwrap().state).unwrap();
        assert_eq!(body(&canonical), "hello world!");
        assert_eq!(fx.buffer.count(doc).await, 0);

        let view = fx.store.load_view(doc).unwrap();
        assert_eq!(view.text, "hello world!");
        assert_eq!(view.character_count, 11);
        assert_eq!(fx.events.0.lock().await.len(), 3);

        // the last snapshot reconstructs the final content
        let token = SnapshotToken::decode(&snapshots[1].token().unwrap()).unwrap();
        assert_eq!(body(&canonical.reconstruct(&token).unwrap()), "hello world!");
    }

    #[tokio::test]
    async fn test_replayed_edit_creates_no_snapshot() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        let user = Uuid::new_v4();
        let delta = insert_text(&SyncDocument::new(), 0, "once");

        fx.buffer.append(doc, user, delta.clone()).await;
        fx.collector.collect_at(doc, at(1_000), &CancellationToken::new()).await.unwrap();
        let state = fx.store.load_document(doc).unwrap().state;

        fx.buffer.append(doc, user, delta).await;
        let outcome = fx.collector.collect_at(doc, at(2_000), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.merged_edits, 1);
        assert_eq!(outcome.snapshots_created, 0);
        assert_eq!(fx.store.list_snapshots(doc).unwrap().len(), 1);
        assert_eq!(fx.store.load_document(doc).unwrap().updated_at_ms, 1_000);

        let replayed = SyncDocument::from_state(&fx.store.load_document(doc).unwrap().state).unwrap();
        assert_eq!(replayed.snapshot(), SyncDocument::from_state(&state).unwrap().snapshot());
        assert_eq!(fx.events.0.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_timestamps_stay_monotone() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        let author = SyncDocument::new();

        fx.buffer.append(doc, Uuid::new_v4(), insert_text(&author, 0, "a")).await;
        fx.collector.collect_at(doc, at(5_000), &CancellationToken::new()).await.unwrap();
        // clock went backwards
        fx.buffer.append(doc, Uuid::new_v4(), insert_text(&author, 1, "b")).await;
        fx.collector.collect_at(doc, at(4_000), &CancellationToken::new()).await.unwrap();

        let stamps: Vec<i64> = fx.store.list_snapshots(doc).unwrap().iter().map(|s| s.created_at_ms).collect();
        assert_eq!(stamps, vec![5_000, 5_001]);
    }

    #[tokio::test]
    async fn test_character_counts_recorded_per_contributor() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let author = SyncDocument::new();
        fx.buffer.append(doc, u1, insert_text(&author, 0, "abcdef")).await;
        fx.buffer.append(doc, u2, remove_text(&author, 0, 2)).await;

        let hour = 3_600_000;
        fx.collector.collect_at(doc, at(2 * hour + 5), &CancellationToken::new()).await.unwrap();

        let mut counts = fx.store.character_counts(doc).unwrap();
        counts.sort_by_key(|c| c.additions);
        assert_eq!(counts.len(), 2);
        assert!(counts.iter().all(|c| c.bucket_ms == 2 * hour));
        assert_eq!((counts[0].contributor, counts[0].deletions), (u2, 2));
        assert_eq!((counts[1].contributor, counts[1].additions), (u1, 6));
    }

    #[tokio::test]
    async fn test_undecodable_edit_is_discarded() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        let user = Uuid::new_v4();
        fx.buffer.append(doc, user, vec![0xFF, 0xFF, 0xFF]).await;
        fx.buffer.append(doc, user, insert_text(&SyncDocument::new(), 0, "ok")).await;

        let outcome = fx.collector.collect_at(doc, at(1), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.merged_edits, 2);
        assert_eq!(outcome.snapshots_created, 1);
        assert_eq!(fx.buffer.count(doc).await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_commits_nothing() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Post);
        fx.buffer.append(doc, Uuid::new_v4(), insert_text(&SyncDocument::new(), 0, "x")).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx.collector.collect(doc, &cancel).await.unwrap_err();
        assert!(matches!(err, CollectError::Lock(LockError::Cancelled(_)) | CollectError::Cancelled(_)));
        assert!(fx.store.list_snapshots(doc).unwrap().is_empty());
        assert_eq!(fx.buffer.count(doc).await, 1);
        // lock was released
        let lock = DocumentLock::new(fx.ephemeral.clone(), LockConfig::default());
        assert!(lock.try_acquire(doc).await.is_some());
    }

    #[tokio::test]
    async fn test_edit_arriving_mid_run_is_left_for_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let ephemeral = Arc::new(EphemeralStore::new());
        let late = Arc::new(AppendAfterDrain::new(ephemeral.clone()));
        let buffer = Arc::new(UpdateBuffer::new(late.clone()));
        let lock = Arc::new(DocumentLock::new(ephemeral, LockConfig::default()));
        let collector = Collector::new(store.clone(), buffer.clone(), lock, Arc::new(Recorder::default()));

        let doc = create(&store, DocumentKind::Post);
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let author = SyncDocument::new();
        buffer.append(doc, u1, insert_text(&author, 0, "first")).await;
        late.arm(doc, PendingEdit::new(u2, insert_text(&author, 5, " second"))).await;

        let outcome = collector.collect_at(doc, at(1_000), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.merged_edits, 1);
        assert_eq!(outcome.snapshots_created, 1);
        assert!(outcome.has_more);
        assert_eq!(buffer.drain(doc).await.len(), 1);

        let outcome = collector.collect_at(doc, at(2_000), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.merged_edits, 1);
        assert!(!outcome.has_more);
        let canonical = SyncDocument::from_state(&store.load_document(doc).unwrap().state).unwrap();
        assert_eq!(body(&canonical), "first second");
        let contributors: Vec<Vec<Uuid>> =
            store.list_snapshots(doc).unwrap().into_iter().map(|s| s.contributors).collect();
        assert_eq!(contributors, vec![vec![u1], vec![u2]]);
    }

    #[tokio::test]
    async fn test_unknown_document_fails() {
        let fx = fixture();
        let doc = Uuid::new_v4();
        fx.buffer.append(doc, Uuid::new_v4(), vec![1]).await;
        let err = fx.collector.collect(doc, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CollectError::Store(StoreError::NotFound(id)) if id == doc));
        assert_eq!(fx.buffer.count(doc).await, 1);
    }

    #[tokio::test]
    async fn test_canvas_view_has_no_text() {
        let fx = fixture();
        let doc = create(&fx.store, DocumentKind::Canvas);
        fx.buffer
            .append(doc, Uuid::new_v4(), set_attr(&SyncDocument::new(), "title", "Board"))
            .await;
        fx.collector.collect_at(doc, at(1), &CancellationToken::new()).await.unwrap();

        let view = fx.store.load_view(doc).unwrap();
        assert_eq!(view.kind, DocumentKind::Canvas);
        assert_eq!(view.title.as_deref(), Some("Board"));
        assert!(view.text.is_empty());
        assert!(fx.store.character_counts(doc).unwrap().is_empty());
    }

    #[test]
    fn test_group_by_contributor_keeps_first_seen_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let edits = vec![
            PendingEdit::new(b, vec![1]),
            PendingEdit::new(a, vec![2]),
            PendingEdit::new(b, vec![3]),
        ];
        let groups = group_by_contributor(&edits);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], (b, vec![&[1u8][..], &[3u8][..]]));
        assert_eq!(groups[1], (a, vec![&[2u8][..]]));
    }
}
