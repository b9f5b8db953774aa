//! Background worker: executes queued collector and compactor jobs with
//! bounded concurrency, retries failures with exponential backoff and runs
//! the periodic scans.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::UpdateBuffer;
use crate::collector::{CollectError, CollectOutcome, Collector};
use crate::compactor::{CompactError, Compactor};
use crate::queue::{Job, JobQueue, QueuedJob};
use crate::storage::{DocumentStore, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs executed at once
    pub concurrency: usize,
    /// Attempts per job, first run included
    pub max_attempts: u32,
    /// Retry delay after the first failure; doubles per attempt
    pub backoff_base: Duration,
    pub collect_scan_interval: Duration,
    pub compact_scan_interval: Duration,
    /// Upper bound of the random delay before a scanned compaction runs
    pub compact_jitter: Duration,
    /// Documents must be this long without a new snapshot before compaction
    pub compact_idle: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            collect_scan_interval: Duration::from_secs(60),
            compact_scan_interval: Duration::from_secs(60 * 60),
            compact_jitter: Duration::from_secs(50 * 60),
            compact_idle: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Compact(#[from] CompactError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Worker {
    queue: Arc<JobQueue>,
    collector: Arc<Collector>,
    compactor: Arc<Compactor>,
    buffer: Arc<UpdateBuffer>,
    store: Arc<DocumentStore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        collector: Arc<Collector>,
        compactor: Arc<Compactor>,
        buffer: Arc<UpdateBuffer>,
        store: Arc<DocumentStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            collector,
            compactor,
            buffer,
            store,
            config,
        }
    }

    /// Run one job to completion.
    pub async fn execute(&self, job: Job, cancel: &CancellationToken) -> Result<(), JobError> {
        match job {
            Job::Collect(document) => {
                let outcome = self.collector.collect(document, cancel).await?;
                self.follow_up(document, &outcome).await;
            }
            Job::Compact(document) => {
                self.compactor.compact(document, cancel).await?;
            }
            Job::CollectScan => {
                let documents = self.buffer.pending_documents().await;
                let mut scheduled = 0;
                for document in documents {
                    if self.queue.enqueue(Job::Collect(document)).await {
                        scheduled += 1;
                    }
                }
                log::debug!("Collect scan scheduled {scheduled} documents");
            }
            Job::CompactScan => {
                let now_ms = Utc::now().timestamp_millis();
                let idle_ms = self.config.compact_idle.as_millis() as i64;
                let due = self.store.documents_due_for_compaction(now_ms, idle_ms)?;
                log::debug!("Compact scan found {} documents due", due.len());
                for document in due {
                    let delay = self.jitter();
                    self.queue.enqueue_delayed(Job::Compact(document), delay).await;
                }
            }
        }
        Ok(())
    }

    /// Re-trigger collection when edits arrived during the run.
    pub async fn follow_up(&self, document: Uuid, outcome: &CollectOutcome) -> bool {
        if !outcome.has_more {
            return false;
        }
        log::debug!("Edits arrived during collection of {document}, requeueing");
        self.queue.enqueue(Job::Collect(document)).await
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base * 2u32.saturating_pow(attempt)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.compact_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Pull jobs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let crons = vec![
            self.spawn_cron(Job::CollectScan, self.config.collect_scan_interval, shutdown.clone()),
            self.spawn_cron(Job::CompactScan, self.config.compact_scan_interval, shutdown.clone()),
        ];
        log::info!("Worker started with concurrency {}", self.config.concurrency);

        loop {
            let queued = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.next() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                worker.process(queued, &cancel).await;
            });
        }

        for cron in crons {
            cron.abort();
        }
        log::info!("Worker stopped");
    }

    async fn process(&self, queued: QueuedJob, cancel: &CancellationToken) {
        match self.execute(queued.job, cancel).await {
            Ok(()) => log::trace!("Job {} done", queued.job),
            Err(e) if queued.attempt + 1 < self.config.max_attempts => {
                let delay = self.backoff(queued.attempt);
                log::warn!(
                    "Job {} failed (attempt {}): {e}; retrying in {delay:?}",
                    queued.job,
                    queued.attempt + 1
                );
                self.queue.retry(queued, delay).await;
            }
            Err(e) => {
                log::error!(
                    "Job {} failed after {} attempts: {e}",
                    queued.job,
                    queued.attempt + 1
                );
            }
        }
    }

    fn spawn_cron(&self, job: Job, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticks.tick() => {
                        queue.enqueue(job).await;
                    }
                }
            }
        })
    }
}
