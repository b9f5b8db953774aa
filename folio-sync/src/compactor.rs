//! History compactor: thins a document's snapshot history with a
//! time-decayed retention policy while keeping its final content intact.
//!
//! Recent snapshots are kept individually, middle-aged ones per minute and
//! old ones per hour. Each surviving bucket is rebuilt from the original
//! CRDT log and folded into a fresh working document via
//! [`SyncDocument::reconcile_with`]; a last reconciliation against the
//! uncompacted state guarantees the final content does not change.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::document::{DocumentError, SnapshotToken, SyncDocument};
use crate::lock::{DocumentLock, LockError, LockGuard};
use crate::storage::{DocumentStore, NewSnapshot, SnapshotRecord, StoreError};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Snapshots younger than this are kept individually
    pub exact_window: Duration,
    /// Snapshots younger than this are kept one per minute; older, one per hour
    pub minute_window: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            exact_window: Duration::from_secs(24 * 60 * 60),
            minute_window: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

/// Bucket a snapshot falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionKey {
    /// Exact timestamp and order
    Exact(i64, u32),
    /// Minute start, ms
    Minute(i64),
    /// Hour start, ms
    Hour(i64),
}

impl RetentionPolicy {
    pub fn key(&self, snapshot: &SnapshotRecord, now_ms: i64) -> RetentionKey {
        let age = now_ms - snapshot.created_at_ms;
        let created = snapshot.created_at_ms;
        if age < self.exact_window.as_millis() as i64 {
            RetentionKey::Exact(created, snapshot.order)
        } else if age < self.minute_window.as_millis() as i64 {
            RetentionKey::Minute(created.div_euclid(MINUTE_MS) * MINUTE_MS)
        } else {
            RetentionKey::Hour(created.div_euclid(HOUR_MS) * HOUR_MS)
        }
    }
}

/// The surviving snapshot of one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RetainedBucket<'a> {
    pub key: RetentionKey,
    /// Last snapshot in the bucket
    pub snapshot: &'a SnapshotRecord,
    /// Union of every contributor in the bucket, first-seen order
    pub contributors: Vec<Uuid>,
}

/// Bucket a chronologically ordered history.
pub fn retain<'a>(
    snapshots: &'a [SnapshotRecord],
    now_ms: i64,
    policy: &RetentionPolicy,
) -> Vec<RetainedBucket<'a>> {
    let mut buckets: Vec<RetainedBucket<'a>> = Vec::new();
    for snapshot in snapshots {
        let key = policy.key(snapshot, now_ms);
        match buckets.last_mut() {
            Some(bucket) if bucket.key == key => {
                bucket.snapshot = snapshot;
                union_into(&mut bucket.contributors, &snapshot.contributors);
            }
            _ => buckets.push(RetainedBucket {
                key,
                snapshot,
                contributors: dedup(&snapshot.contributors),
            }),
        }
    }
    buckets
}

fn union_into(target: &mut Vec<Uuid>, extra: &[Uuid]) {
    for id in extra {
        if !target.contains(id) {
            target.push(*id);
        }
    }
}

fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut out = Vec::with_capacity(ids.len());
    union_into(&mut out, ids);
    out
}

#[derive(Debug, Error)]
pub enum CompactError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("compaction of document {0} cancelled")]
    Cancelled(Uuid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Snapshots before compaction
    pub original: usize,
    /// Snapshots after compaction, corrective one included
    pub retained: usize,
    /// Undecodable snapshots discarded
    pub skipped: usize,
    /// A corrective snapshot was needed to restore the final content
    pub corrective: bool,
}

pub struct Compactor {
    store: Arc<DocumentStore>,
    lock: Arc<DocumentLock>,
    policy: RetentionPolicy,
}

impl Compactor {
    pub fn new(store: Arc<DocumentStore>, lock: Arc<DocumentLock>, policy: RetentionPolicy) -> Self {
        Self { store, lock, policy }
    }

    pub async fn compact(
        &self,
        document: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CompactOutcome, CompactError> {
        self.compact_at(document, Utc::now(), cancel).await
    }

    pub async fn compact_at(
        &self,
        document: Uuid,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CompactOutcome, CompactError> {
        let guard = self.lock.acquire(document, cancel).await?;
        let result = self
            .run_locked(document, now.timestamp_millis(), cancel, &guard)
            .await;
        guard.release().await;

        let outcome = result?;
        log::info!(
            "Compacted document {document}: {} -> {} snapshots ({} skipped{})",
            outcome.original,
            outcome.retained,
            outcome.skipped,
            if outcome.corrective { ", corrective" } else { "" }
        );
        Ok(outcome)
    }

    /// Rebuilding buckets is CPU and RocksDB work with no natural await
    /// points; the loop yields after every bucket so that lease renewal and
    /// cancellation get to run, even on a current-thread runtime.
    async fn run_locked(
        &self,
        document: Uuid,
        now_ms: i64,
        cancel: &CancellationToken,
        guard: &LockGuard,
    ) -> Result<CompactOutcome, CompactError> {
        let record = self.store.load_document(document)?;
        let history = self.store.list_snapshots(document)?;
        let buckets = retain(&history, now_ms, &self.policy);

        if buckets.len() == history.len() {
            self.store.mark_compacted(document, now_ms)?;
            return Ok(CompactOutcome {
                original: history.len(),
                retained: history.len(),
                ..CompactOutcome::default()
            });
        }

        let original = SyncDocument::from_state(&record.state)?;
        let mut working: Option<SyncDocument> = None;
        let mut snapshots: Vec<NewSnapshot> = Vec::with_capacity(buckets.len() + 1);
        let mut carried: Vec<Uuid> = Vec::new();
        let mut skipped = 0;

        for bucket in &buckets {
            let folded = restore(&original, bucket.snapshot).and_then(|state| {
                if let Some(current) = &working {
                    current.reconcile_with(state)
                } else {
                    working = Some(state);
                    Ok(())
                }
            });
            if let Err(e) = folded {
                log::warn!(
                    "Skipping snapshot {} of document {document}: {e}",
                    bucket.snapshot.id
                );
                skipped += 1;
                union_into(&mut carried, &bucket.contributors);
                continue;
            }

            let Some(current) = &working else { continue };
            let mut contributors = std::mem::take(&mut carried);
            union_into(&mut contributors, &bucket.contributors);
            snapshots.push(NewSnapshot {
                created_at_ms: bucket.snapshot.created_at_ms,
                order: bucket.snapshot.order,
                token: current.snapshot().encode(),
                contributors,
            });

            tokio::task::yield_now().await;
            checkpoint(document, cancel, guard)?;
        }

        let working = working.unwrap_or_default();
        let before = working.snapshot();
        working.reconcile_with(SyncDocument::from_state(&record.state)?)?;
        let after = working.snapshot();

        let corrective = before != after;
        if corrective {
            let created_at_ms = snapshots
                .last()
                .map_or(now_ms, |last| now_ms.max(last.created_at_ms + 1));
            snapshots.push(NewSnapshot {
                created_at_ms,
                order: 0,
                token: after.encode(),
                contributors: std::mem::take(&mut carried),
            });
        } else if let Some(last) = snapshots.last_mut() {
            union_into(&mut last.contributors, &carried);
        } else if !carried.is_empty() {
            log::warn!("No snapshot left to carry {} contributors of document {document}", carried.len());
        }

        checkpoint(document, cancel, guard)?;
        let retained = snapshots.len();
        self.store
            .commit_compaction(document, working.to_state(), snapshots, now_ms)?;

        Ok(CompactOutcome {
            original: history.len(),
            retained,
            skipped,
            corrective,
        })
    }
}

/// Rebuild the document as of `snapshot` from the original log.
fn restore(original: &SyncDocument, snapshot: &SnapshotRecord) -> Result<SyncDocument, DocumentError> {
    let bytes = snapshot
        .token()
        .map_err(|e| DocumentError::MalformedSnapshot(e.to_string()))?;
    let token = SnapshotToken::decode(&bytes)?;
    original.reconstruct(&token)
}

fn checkpoint(
    document: Uuid,
    cancel: &CancellationToken,
    guard: &LockGuard,
) -> Result<(), CompactError> {
    if cancel.is_cancelled() || guard.is_lost() {
        return Err(CompactError::Cancelled(document));
    }
    Ok(())
}
