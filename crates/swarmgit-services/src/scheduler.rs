//! Job/batch scheduler.
//!
//! Turns a flat list of wanted objects into batches sized for the peer pool:
//! `max(1, total / conns)` jobs per batch, so every held connection gets a
//! proportional share. A batch closes when full or when the batch timeout
//! has passed since its first job arrived, whichever comes first, so a thin
//! tail never stalls waiting to fill.
//!
//! Failed jobs come back through [`JobScheduler::return_failed`] and are
//! batched again. Completion is an outstanding-work counter: once
//! [`JobScheduler::mark_done`] has accounted for every job, `next_batch`
//! returns None.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use swarmgit_core::{ManifestObject, ObjectId};

use crate::shutdown::Shutdown;
use crate::transport::PeerId;

/// One object to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub object_id: ObjectId,
    pub expected_size: u64,
    /// Peers that already failed to supply this object.
    pub failed_peers: HashSet<PeerId>,
}

impl Job {
    pub fn new(object_id: ObjectId, expected_size: u64) -> Self {
        Self {
            object_id,
            expected_size,
            failed_peers: HashSet::new(),
        }
    }

    /// Whether `peer` is still worth asking for this object.
    pub fn eligible_for(&self, peer: &PeerId) -> bool {
        !self.failed_peers.contains(peer)
    }
}

impl From<&ManifestObject> for Job {
    fn from(o: &ManifestObject) -> Self {
        Job::new(o.id, o.uncompressed_size)
    }
}

pub type Batch = Vec<Job>;

pub struct JobScheduler {
    jobs_tx: mpsc::UnboundedSender<Job>,
    batches: Mutex<mpsc::Receiver<Batch>>,
    outstanding: AtomicUsize,
    complete_tx: watch::Sender<bool>,
    complete: watch::Receiver<bool>,
    uncapped: Arc<AtomicBool>,
    batch_size: usize,
    shutdown: Shutdown,
}

impl JobScheduler {
    pub fn new(
        jobs: Vec<Job>,
        concurrent_conns: usize,
        batch_timeout: Duration,
        shutdown: &Shutdown,
    ) -> Self {
        let total = jobs.len();
        let batch_size = (total / concurrent_conns.max(1)).max(1);
        let shutdown = shutdown.child();

        // Unbounded but finite: every job in it is one of `total`.
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        for job in jobs {
            let _ = jobs_tx.send(job);
        }
        let (batch_tx, batch_rx) = mpsc::channel(concurrent_conns.max(1));
        let (complete_tx, complete) = watch::channel(total == 0);
        let uncapped = Arc::new(AtomicBool::new(false));

        let batcher = Batcher {
            jobs_rx,
            batch_tx,
            batch_size,
            batch_timeout,
            uncapped: uncapped.clone(),
            complete: complete.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(batcher.run());

        tracing::debug!(total, batch_size, "job scheduler started");
        Self {
            jobs_tx,
            batches: Mutex::new(batch_rx),
            outstanding: AtomicUsize::new(total),
            complete_tx,
            complete,
            uncapped,
            batch_size,
            shutdown,
        }
    }

    /// Next batch to send, or None once all work is done or cancelled.
    pub async fn next_batch(&self) -> Option<Batch> {
        let mut complete = self.complete.clone();
        let mut batches = self.batches.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            _ = complete.wait_for(|done| *done) => None,
            batch = batches.recv() => batch,
        }
    }

    /// Put jobs back for a later batch.
    pub fn return_failed(&self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            if self.jobs_tx.send(job).is_err() {
                // batcher gone: cancelled or complete
                return;
            }
        }
    }

    /// Account for `count` finished jobs.
    pub fn mark_done(&self, count: usize) {
        if count == 0 {
            return;
        }
        let before = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or(0);
        if before <= count {
            self.complete_tx.send_replace(true);
            tracing::debug!("all jobs done");
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Resolves when every job has been marked done.
    pub async fn completed(&self) {
        let mut complete = self.complete.clone();
        let _ = complete.wait_for(|done| *done).await;
    }

    /// Drop the size cap; batches then close on the timeout alone.
    pub fn uncap_batch_size(&self) {
        if !self.uncapped.swap(true, Ordering::AcqRel) {
            tracing::debug!("batch size uncapped");
        }
    }

    pub fn batch_size(&self) -> Option<usize> {
        if self.uncapped.load(Ordering::Acquire) {
            None
        } else {
            Some(self.batch_size)
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

// ── Background batching ──────────────────────────────────────────────────────

struct Batcher {
    jobs_rx: mpsc::UnboundedReceiver<Job>,
    batch_tx: mpsc::Sender<Batch>,
    batch_size: usize,
    batch_timeout: Duration,
    uncapped: Arc<AtomicBool>,
    complete: watch::Receiver<bool>,
    shutdown: Shutdown,
}

impl Batcher {
    fn full(&self, batch: &Batch) -> bool {
        !self.uncapped.load(Ordering::Acquire) && batch.len() >= self.batch_size
    }

    async fn run(mut self) {
        let mut complete = self.complete.clone();
        loop {
            // First job opens a batch and starts its clock.
            let first = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = complete.wait_for(|done| *done) => break,
                job = self.jobs_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            let deadline = Instant::now() + self.batch_timeout;
            let mut batch = vec![first];

            while !self.full(&batch) {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = self.shutdown.cancelled() => return,
                    job = self.jobs_rx.recv() => match job {
                        Some(job) => batch.push(job),
                        None => break,
                    },
                }
            }

            tracing::trace!(jobs = batch.len(), "batch closed");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = complete.wait_for(|done| *done) => break,
                sent = self.batch_tx.send(batch) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
