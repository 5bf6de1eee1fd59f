//! Completion Worker Queue
//!
//! Finalizing an upload (checksum verification, copy into the final store)
//! can take a long time, so it runs off the request path. Jobs travel over a
//! bounded channel to a fixed pool of workers; a full channel applies
//! back-pressure to `submit`, and `shutdown` drains what is queued.
//!
//! At most one job per upload is queued or running at a time. A second
//! `submit` for an upload that is already pending is a no-op.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::{UploadError, UploadId};

/// One deferred completion for an upload
pub struct CompletionJob {
    pub upload_id: UploadId,
    pub work: BoxFuture<'static, ()>,
}

/// Outcome of [`CompletionQueue::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    AlreadyPending,
}

pub struct CompletionQueue {
    sender: Mutex<Option<mpsc::Sender<CompletionJob>>>,
    in_flight: Arc<DashSet<UploadId>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompletionQueue {
    /// Start `workers` worker tasks reading from a channel of `capacity` jobs
    pub fn start(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<CompletionJob>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let in_flight = Arc::new(DashSet::new());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(run_worker(worker, rx, in_flight))
            })
            .collect();

        tracing::debug!(workers = workers.max(1), capacity, "Completion queue started");

        Self {
            sender: Mutex::new(Some(tx)),
            in_flight,
            workers: Mutex::new(handles),
        }
    }

    /// Queue `work` for `upload_id`, waiting for channel capacity if needed
    pub async fn submit(
        &self,
        upload_id: UploadId,
        work: BoxFuture<'static, ()>,
    ) -> Result<Submission, UploadError> {
        let sender = self.sender.lock().clone().ok_or(UploadError::QueueClosed)?;

        if !self.in_flight.insert(upload_id) {
            tracing::debug!(upload_id = %upload_id, "Completion already pending");
            return Ok(Submission::AlreadyPending);
        }

        if sender.send(CompletionJob { upload_id, work }).await.is_err() {
            self.in_flight.remove(&upload_id);
            return Err(UploadError::QueueClosed);
        }

        Ok(Submission::Queued)
    }

    /// Whether a job for `upload_id` is queued or running
    pub fn is_pending(&self, upload_id: &UploadId) -> bool {
        self.in_flight.contains(upload_id)
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Completion worker exited abnormally");
            }
        }

        tracing::debug!("Completion queue drained");
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CompletionJob>>>,
    in_flight: Arc<DashSet<UploadId>>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        tracing::debug!(worker, upload_id = %job.upload_id, "Running completion job");

        if AssertUnwindSafe(job.work).catch_unwind().await.is_err() {
            tracing::error!(worker, upload_id = %job.upload_id, "Completion job panicked");
        }

        in_flight.remove(&job.upload_id);
    }
}
