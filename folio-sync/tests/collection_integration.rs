//! Integration tests for the collection pipeline: buffered edits from
//! several contributors folded into canonical state and snapshot history.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use folio_sync::view::plain_text;
use folio_sync::{
    Collector, CrdtState, DocumentKind, DocumentLock, DocumentStore, DownstreamEvent,
    EphemeralStore, Job, JobQueue, LockConfig, Notifier, NotifyError, StoreConfig, SyncDocument,
    UpdateBuffer,
};
use proptest::prelude::*;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yrs::{Doc, Text, Transact, WriteTxn};

/// Insert `text` into the body of `author` and return the delta.
fn insert(author: &Doc, index: u32, text: &str) -> Vec<u8> {
    let mut txn = author.transact_mut();
    let body = txn.get_or_insert_text("body");
    body.insert(&mut txn, index, text);
    txn.encode_update_v1()
}

fn remove(author: &Doc, index: u32, len: u32) -> Vec<u8> {
    let mut txn = author.transact_mut();
    let body = txn.get_or_insert_text("body");
    body.remove_range(&mut txn, index, len);
    txn.encode_update_v1()
}

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<DownstreamEvent>>);

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: DownstreamEvent) -> Result<(), NotifyError> {
        self.0.lock().await.push(event);
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<DocumentStore>,
    buffer: Arc<UpdateBuffer>,
    events: Arc<RecordingNotifier>,
    collector: Collector,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let ephemeral = Arc::new(EphemeralStore::new());
        let buffer = Arc::new(UpdateBuffer::new(ephemeral.clone()));
        let lock = Arc::new(DocumentLock::new(ephemeral, LockConfig::default()));
        let events = Arc::new(RecordingNotifier::default());
        let collector = Collector::new(store.clone(), buffer.clone(), lock, events.clone());
        Self {
            _dir: dir,
            store,
            buffer,
            events,
            collector,
        }
    }

    fn document(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .create_document(id, DocumentKind::Post, CrdtState::default(), 0)
            .unwrap();
        id
    }

    fn canonical(&self, id: Uuid) -> SyncDocument {
        SyncDocument::from_state(&self.store.load_document(id).unwrap().state).unwrap()
    }
}

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

#[tokio::test]
async fn test_two_contributors_produce_ordered_snapshots() {
    let h = Harness::new();
    let d1 = h.document();
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    // concurrent edits from two independent replicas
    let (alice, bob) = (Doc::new(), Doc::new());
    h.buffer.append(d1, u1, insert(&alice, 0, "alpha")).await;
    h.buffer.append(d1, u2, insert(&bob, 0, "beta")).await;

    let outcome = h
        .collector
        .collect_at(d1, at(60_000), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.snapshots_created, 2);

    let snapshots = h.store.list_snapshots(d1).unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].contributors, vec![u1]);
    assert_eq!(snapshots[1].contributors, vec![u2]);
    assert_eq!((snapshots[0].order, snapshots[1].order), (0, 1));

    let text = plain_text(&h.canonical(d1));
    assert!(text.contains("alpha") && text.contains("beta"), "got {text:?}");
    assert_eq!(text.len(), "alphabeta".len());

    let events = h.events.0.lock().await;
    assert!(events.contains(&DownstreamEvent::DocumentUpdated {
        document: d1,
        kind: DocumentKind::Post
    }));
    assert!(events.contains(&DownstreamEvent::UsageUpdated { document: d1 }));
    assert!(events.contains(&DownstreamEvent::IndexRequested { document: d1 }));
}

#[tokio::test]
async fn test_reprocessing_a_delta_is_idempotent() {
    let h = Harness::new();
    let doc = h.document();
    let user = Uuid::new_v4();
    let author = Doc::new();
    let delta = insert(&author, 0, "steady");

    h.buffer.append(doc, user, delta.clone()).await;
    h.collector.collect_at(doc, at(1_000), &CancellationToken::new()).await.unwrap();
    let before = h.canonical(doc).snapshot();

    h.buffer.append(doc, user, delta).await;
    let outcome = h
        .collector
        .collect_at(doc, at(2_000), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.snapshots_created, 0);
    assert_eq!(h.store.list_snapshots(doc).unwrap().len(), 1);
    assert_eq!(h.canonical(doc).snapshot(), before);
    assert_eq!(plain_text(&h.canonical(doc)), "steady");
}

#[tokio::test]
async fn test_edits_appended_after_drain_survive_removal() {
    let h = Harness::new();
    let doc = h.document();
    let user = Uuid::new_v4();
    let first = insert(&Doc::new(), 0, "one ");
    let second = insert(&Doc::new(), 0, "two");

    h.buffer.append(doc, user, first).await;
    let drained = h.buffer.drain(doc).await;
    h.buffer.append(doc, user, second.clone()).await;
    assert_eq!(h.buffer.remove(doc, &drained).await, 1);

    let left = h.buffer.drain(doc).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].payload, second);

    // the surviving edit is merged by the next run
    h.collector.collect(doc, &CancellationToken::new()).await.unwrap();
    assert_eq!(h.buffer.count(doc).await, 0);
    assert_eq!(plain_text(&h.canonical(doc)), "two");
}

#[tokio::test]
async fn test_triggers_during_a_run_collapse_into_one_follow_up() {
    let queue = JobQueue::new();
    let doc = Uuid::new_v4();
    for _ in 0..5 {
        queue.enqueue(Job::Collect(doc)).await;
    }
    assert_eq!(queue.pending_len().await, 1);

    // worker picks the job up; edits keep arriving
    let running = queue.next().await.unwrap();
    assert_eq!(running.job, Job::Collect(doc));
    let accepted = [
        queue.enqueue(Job::Collect(doc)).await,
        queue.enqueue(Job::Collect(doc)).await,
        queue.enqueue(Job::Collect(doc)).await,
    ];
    assert_eq!(accepted, [true, false, false]);
    assert_eq!(queue.pending_len().await, 1);
}

#[tokio::test]
async fn test_character_counts_accumulate_across_runs() {
    let h = Harness::new();
    let doc = h.document();
    let user = Uuid::new_v4();
    let author = Doc::new();
    let hour = 3_600_000;

    h.buffer.append(doc, user, insert(&author, 0, "hello world")).await;
    h.collector.collect_at(doc, at(hour + 10), &CancellationToken::new()).await.unwrap();
    h.buffer.append(doc, user, remove(&author, 0, 6)).await;
    h.collector.collect_at(doc, at(hour + 20), &CancellationToken::new()).await.unwrap();

    let counts = h.store.character_counts(doc).unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].bucket_ms, hour);
    assert_eq!((counts[0].additions, counts[0].deletions), (11, 6));

    let view = h.store.load_view(doc).unwrap();
    assert_eq!(view.text, "world");
    assert_eq!(view.character_count, 5);
}

#[tokio::test]
async fn test_many_runs_keep_history_chronological() {
    let h = Harness::new();
    let doc = h.document();
    let author = Doc::new();
    let mut len = 0;
    for round in 0..5 {
        let word = format!("w{round} ");
        h.buffer.append(doc, Uuid::new_v4(), insert(&author, len, &word)).await;
        len += word.len() as u32;
        h.collector.collect_at(doc, at(1_000), &CancellationToken::new()).await.unwrap();
    }

    let stamps: Vec<i64> = h
        .store
        .list_snapshots(doc)
        .unwrap()
        .iter()
        .map(|s| s.created_at_ms)
        .collect();
    assert_eq!(stamps, vec![1_000, 1_001, 1_002, 1_003, 1_004]);
    assert_eq!(plain_text(&h.canonical(doc)), "w0 w1 w2 w3 w4 ");
}

/// Deltas from `authors` independent replicas, each inserting at an
/// arbitrary position of its own copy.
fn concurrent_deltas(ops: &[(usize, String, u16)], authors: usize) -> Vec<Vec<u8>> {
    let replicas: Vec<Doc> = (0..authors).map(|_| Doc::new()).collect();
    let mut lengths = vec![0u32; authors];
    ops.iter()
        .map(|(author, text, pos)| {
            let index = u32::from(*pos) % (lengths[*author] + 1);
            lengths[*author] += text.chars().count() as u32;
            insert(&replicas[*author], index, text)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_merge_order_does_not_matter(
        (ops, order) in prop::collection::vec((0usize..3, "[a-z]{1,4}", any::<u16>()), 1..12)
            .prop_flat_map(|ops| {
                let indices: Vec<usize> = (0..ops.len()).collect();
                (Just(ops), Just(indices).prop_shuffle())
            })
    ) {
        let deltas = concurrent_deltas(&ops, 3);

        let in_order = SyncDocument::new();
        for delta in &deltas {
            in_order.merge(delta).unwrap();
        }
        let shuffled = SyncDocument::new();
        for &i in &order {
            shuffled.merge(&deltas[i]).unwrap();
        }

        prop_assert_eq!(plain_text(&in_order), plain_text(&shuffled));
        prop_assert_eq!(in_order.snapshot(), shuffled.snapshot());
    }
}
