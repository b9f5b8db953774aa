//! Work queue with deduplication by job key.
//!
//! A job is "pending" from the moment it is enqueued (or scheduled with a
//! delay) until a worker picks it up. Enqueuing a job whose key is pending
//! is a no-op, so a burst of triggers for one document collapses into a
//! single run, while a trigger arriving during a run schedules exactly one
//! follow-up.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Job {
    /// Merge a document's buffered edits.
    Collect(Uuid),
    /// Compact a document's snapshot history.
    Compact(Uuid),
    /// Enqueue `Collect` for every document with pending edits.
    CollectScan,
    /// Enqueue `Compact` for every document due for compaction.
    CompactScan,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Collect(id) => write!(f, "collect:{id}"),
            Job::Compact(id) => write!(f, "compact:{id}"),
            Job::CollectScan => write!(f, "collect-scan"),
            Job::CompactScan => write!(f, "compact-scan"),
        }
    }
}

/// A job as handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub job: Job,
    /// Zero-based attempt number
    pub attempt: u32,
}

pub struct JobQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
    pending: Arc<Mutex<HashSet<Job>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Enqueue `job` unless an identical job is already pending.
    pub async fn enqueue(&self, job: Job) -> bool {
        self.submit(QueuedJob { job, attempt: 0 }, None).await
    }

    /// Enqueue `job` after `delay`, deduplicated like [`JobQueue::enqueue`].
    pub async fn enqueue_delayed(&self, job: Job, delay: Duration) -> bool {
        self.submit(QueuedJob { job, attempt: 0 }, Some(delay)).await
    }

    /// Re-submit a failed job for another attempt after `delay`. Dropped if
    /// a fresh trigger for the same job is already pending.
    pub async fn retry(&self, failed: QueuedJob, delay: Duration) -> bool {
        let next = QueuedJob {
            job: failed.job,
            attempt: failed.attempt + 1,
        };
        self.submit(next, Some(delay)).await
    }

    async fn submit(&self, queued: QueuedJob, delay: Option<Duration>) -> bool {
        if !self.pending.lock().await.insert(queued.job) {
            log::trace!("Job {} already pending", queued.job);
            return false;
        }

        match delay.filter(|delay| !delay.is_zero()) {
            None => {
                if self.sender.send(queued).is_err() {
                    self.pending.lock().await.remove(&queued.job);
                    return false;
                }
            }
            Some(delay) => {
                let sender = self.sender.clone();
                let pending = self.pending.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(queued).is_err() {
                        pending.lock().await.remove(&queued.job);
                    }
                });
            }
        }
        true
    }

    /// Wait for the next job and mark it no longer pending.
    pub async fn next(&self) -> Option<QueuedJob> {
        let queued = self.receiver.lock().await.recv().await?;
        self.pending.lock().await.remove(&queued.job);
        Some(queued)
    }

    /// Take the next ready job without waiting.
    pub async fn try_next(&self) -> Option<QueuedJob> {
        let queued = self.receiver.lock().await.try_recv().ok()?;
        self.pending.lock().await.remove(&queued.job);
        Some(queued)
    }

    /// Number of pending jobs, ready or delayed.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, job: Job) -> bool {
        self.pending.lock().await.contains(&job)
    }
}
