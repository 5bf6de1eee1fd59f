//! Upload Service
//!
//! Server side of the chunked upload protocol. Ties together the staging
//! store, the per-upload range locks and the completion queue, and owns the
//! terminal transition of every session:
//!
//! ```text
//! New -> receiving chunks -> Complete requested -> Completed | Failed
//! ```

use std::io::SeekFrom;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, Stream, StreamExt};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::checksum::{parse_checksum, verify_checksum, ChecksumError};
use super::completion::{CompletionQueue, Submission};
use super::content_range::ContentRange;
use super::range_lock::{RangeLockError, RangeLockRegistry};
use super::staging::StagingStore;
use super::types::{NewUploadRequest, PollResponse, SessionRecord, UploadError, UploadId};
use crate::error::StorageError;
use crate::storage::{base_name, parent_path, BackingStore};

/// How often the expiry sweeper runs
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Why a completion job ended in `Failed`
#[derive(Debug, thiserror::Error)]
enum CompletionError {
    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("{0}")]
    Staging(#[from] UploadError),

    #[error("error writing destination: {0}")]
    Store(#[from] StorageError),

    #[error("upload aborted")]
    Aborted,
}

/// Shared between a completion job and `abort` for the same upload.
///
/// The job holds `gate` from start to finish. `abort` cancels first and then
/// takes `gate`, so the job either publishes and records its result before
/// the session is removed, or stops without touching either.
#[derive(Default)]
struct CompletionControl {
    cancel: CancellationToken,
    gate: tokio::sync::Mutex<()>,
}

// ============================================================================
// Upload Service
// ============================================================================

#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    staging: StagingStore,
    locks: RangeLockRegistry,
    queue: CompletionQueue,
    completions: DashMap<UploadId, Arc<CompletionControl>>,
    store: Arc<dyn BackingStore>,
}

impl UploadService {
    /// Create a service that stages under `staging` and finalizes into `store`
    pub fn new(
        staging: StagingStore,
        store: Arc<dyn BackingStore>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(UploadServiceInner {
                staging,
                locks: RangeLockRegistry::new(),
                queue: CompletionQueue::start(workers, queue_capacity),
                completions: DashMap::new(),
                store,
            }),
        }
    }

    pub fn staging(&self) -> &StagingStore {
        &self.inner.staging
    }

    // ========================================================================
    // Protocol Operations
    // ========================================================================

    /// Open a new upload session with a pre-sized staging file
    pub async fn new_upload(&self, request: NewUploadRequest) -> Result<UploadId, UploadError> {
        let path = normalize_destination(&request.path)?;

        if request.size == 0 {
            return Err(UploadError::InvalidInput("size must be greater than zero".into()));
        }

        if request.checksum.is_empty() {
            return Err(UploadError::InvalidInput("checksum is required".into()));
        }
        parse_checksum(&request.checksum)
            .map_err(|e| UploadError::InvalidInput(e.to_string()))?;

        let record = SessionRecord::new(path, request.size, request.checksum);
        let id = self.inner.staging.create(&record).await?;

        tracing::info!(
            upload_id = %id,
            path = %record.path,
            size = record.size,
            "Created upload session"
        );

        Ok(id)
    }

    /// Write one chunk of the upload at its declared offset.
    ///
    /// `data` must yield exactly `range.len()` bytes. Overlapping writes to the
    /// same upload are serialized by the range lock; disjoint ones run in
    /// parallel.
    pub async fn write_chunk<S, E>(
        &self,
        id: UploadId,
        range: ContentRange,
        data: S,
    ) -> Result<u64, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let record = self.inner.staging.read_record(&id).await?;
        if record.complete {
            return Err(UploadError::SessionComplete);
        }

        if range.end >= record.size {
            return Err(UploadError::ChunkOutOfBounds {
                end: range.end,
                size: record.size,
            });
        }

        if let Some(total) = range.total {
            if total != record.size {
                return Err(UploadError::InvalidContentRange(format!(
                    "total size {} does not match upload size {}",
                    total, record.size
                )));
            }
        }

        let mut file = self.inner.staging.open_for_write(&id).await?;

        let lock = self.inner.locks.get(id);
        let guard = lock
            .acquire(range.start, range.end)
            .await
            .map_err(|e| match e {
                RangeLockError::Cancelled => UploadError::LockCancelled,
                RangeLockError::InvalidRange { .. } => {
                    UploadError::InvalidContentRange(e.to_string())
                }
            })?;

        file.seek(SeekFrom::Start(range.start)).await?;

        let expected = range.len();
        let mut written: u64 = 0;
        let mut data = std::pin::pin!(data);

        while let Some(chunk) = data.next().await {
            let chunk = chunk
                .map_err(|e| UploadError::InvalidInput(format!("error reading chunk body: {}", e)))?;

            let actual = written + chunk.len() as u64;
            if actual > expected {
                return Err(UploadError::ChunkLengthMismatch { expected, actual });
            }

            file.write_all(&chunk).await?;
            written = actual;
        }

        if written != expected {
            return Err(UploadError::ChunkLengthMismatch {
                expected,
                actual: written,
            });
        }

        file.flush().await?;
        drop(guard);

        tracing::debug!(
            upload_id = %id,
            start = range.start,
            end = range.end,
            "Chunk written"
        );

        Ok(written)
    }

    /// Drop the staged bytes and record of a session. Unknown sessions are
    /// not an error.
    ///
    /// A queued or running completion is cancelled. If it already got past
    /// the point of publishing, the destination stays and only the session
    /// goes.
    pub async fn abort(&self, id: UploadId) -> Result<(), UploadError> {
        let control = self
            .inner
            .completions
            .get(&id)
            .map(|entry| entry.value().clone());

        let _gate = match &control {
            Some(control) => {
                control.cancel.cancel();
                Some(control.gate.lock().await)
            }
            None => None,
        };

        self.inner.staging.remove(&id).await?;
        self.inner.locks.discard(&id);

        tracing::info!(upload_id = %id, "Upload aborted");
        Ok(())
    }

    /// Queue finalization and return without waiting for it
    pub async fn complete(&self, id: UploadId) -> Result<Submission, UploadError> {
        // Unknown sessions are reported now rather than by a later poll
        self.inner.staging.read_record(&id).await?;

        let control = self
            .inner
            .completions
            .entry(id)
            .or_default()
            .value()
            .clone();

        let service = self.clone();
        let job_control = control.clone();
        let submission = match self
            .inner
            .queue
            .submit(
                id,
                async move { service.finalize(id, job_control).await }.boxed(),
            )
            .await
        {
            Ok(submission) => submission,
            Err(e) => {
                self.release_control(&id, &control);
                return Err(e);
            }
        };

        tracing::info!(upload_id = %id, ?submission, "Upload completion requested");
        Ok(submission)
    }

    /// Current completion state of a session
    pub async fn poll(&self, id: UploadId) -> Result<PollResponse, UploadError> {
        let record = self.inner.staging.read_record(&id).await?;
        Ok(PollResponse {
            status: record.status(),
            error: record.error,
        })
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Run the terminal transition for one session.
    ///
    /// Unless the upload was aborted, the record is always written back with
    /// `complete` set, whatever the copy did, so pollers never wait forever.
    async fn finalize(&self, id: UploadId, control: Arc<CompletionControl>) {
        let gate = control.gate.lock().await;
        self.run_completion(id, &control.cancel).await;
        drop(gate);

        self.release_control(&id, &control);
    }

    async fn run_completion(&self, id: UploadId, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            tracing::debug!(upload_id = %id, "Upload aborted before completion started");
            return;
        }

        let mut record = match self.inner.staging.read_record(&id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(upload_id = %id, error = %e, "Cannot load session for completion");
                return;
            }
        };

        if record.complete {
            tracing::debug!(upload_id = %id, "Session already complete, skipping");
            return;
        }

        // Separate task so a panic still ends in a terminal record
        let service = self.clone();
        let job_record = record.clone();
        let job_cancel = cancel.clone();
        let staged = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = job_cancel.cancelled() => Err(CompletionError::Aborted),
                result = service.stage_destination(id, &job_record) => result,
            }
        })
        .await;

        let partial = partial_path(&record.path, &id);

        if cancel.is_cancelled() {
            self.discard_partial(&id, &partial).await;
            tracing::info!(upload_id = %id, "Completion abandoned, upload was aborted");
            return;
        }

        record.complete = true;
        record.error = match staged {
            Ok(Ok(())) => match self.publish(&id, &partial, &record.path).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            },
            Ok(Err(e)) => {
                self.discard_partial(&id, &partial).await;
                Some(e.to_string())
            }
            Err(e) => {
                self.discard_partial(&id, &partial).await;
                Some(format!("completion task failed: {}", e))
            }
        };

        match &record.error {
            None => tracing::info!(upload_id = %id, path = %record.path, "Upload completed"),
            Some(error) => {
                tracing::warn!(upload_id = %id, path = %record.path, error = %error, "Upload failed")
            }
        }

        if let Err(e) = self.inner.staging.write_record(&id, &record).await {
            tracing::error!(upload_id = %id, error = %e, "Failed to persist completion state");
        }

        self.inner.locks.discard(&id);
    }

    /// Verify the staged bytes and copy them beside the destination
    async fn stage_destination(&self, id: UploadId, record: &SessionRecord) -> Result<(), CompletionError> {
        let mut staged = self.inner.staging.open_for_read(&id).await?;
        verify_checksum(&mut staged, &record.checksum).await?;
        drop(staged);

        let parent = parent_path(&record.path);
        if !parent.is_empty() {
            self.inner.store.mkdir_all(parent).await?;
        }

        self.copy_staged(&id, &partial_path(&record.path, &id)).await?;
        Ok(())
    }

    /// Swap the finished copy in and release the staged bytes
    async fn publish(&self, id: &UploadId, partial: &str, dest: &str) -> Result<(), CompletionError> {
        if let Err(e) = self.inner.store.rename(partial, dest).await {
            self.discard_partial(id, partial).await;
            return Err(e.into());
        }

        self.inner.staging.truncate(id).await?;
        Ok(())
    }

    async fn discard_partial(&self, id: &UploadId, partial: &str) {
        if let Err(e) = self.inner.store.remove_all(partial).await {
            tracing::warn!(upload_id = %id, error = %e, "Failed to remove partial copy");
        }
    }

    fn release_control(&self, id: &UploadId, control: &Arc<CompletionControl>) {
        self.inner
            .completions
            .remove_if(id, |_, current| Arc::ptr_eq(current, control));
    }

    async fn copy_staged(&self, id: &UploadId, dest: &str) -> Result<u64, CompletionError> {
        let mut staged = self.inner.staging.open_for_read(id).await?;
        let mut writer = self.inner.store.create(dest).await?;

        let copied = tokio::io::copy(&mut staged, &mut writer)
            .await
            .map_err(StorageError::Io)?;
        writer.shutdown().await.map_err(StorageError::Io)?;

        Ok(copied)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Remove sessions nobody has touched for `ttl`. Returns how many went.
    pub async fn sweep_expired(&self, ttl: Duration) -> Result<usize, UploadError> {
        let Some(cutoff) = SystemTime::now().checked_sub(ttl) else {
            return Ok(0);
        };

        let mut removed = 0;
        for (id, modified) in self.inner.staging.list().await? {
            if modified >= cutoff || self.inner.queue.is_pending(&id) {
                continue;
            }

            match self.abort(id).await {
                Ok(()) => {
                    tracing::debug!(upload_id = %id, "Swept expired upload session");
                    removed += 1;
                }
                Err(e) => tracing::warn!(upload_id = %id, error = %e, "Failed to sweep session"),
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "Swept expired upload sessions");
        }

        Ok(removed)
    }

    /// Start the background task that sweeps expired sessions
    pub fn start_sweeper(self, ttl_hours: i64) -> tokio::task::JoinHandle<()> {
        let ttl = Duration::from_secs(ttl_hours.max(0) as u64 * 3600);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_expired(ttl).await {
                    tracing::warn!(error = %e, "Staging sweep failed");
                }
            }
        })
    }

    /// Stop taking completions and wait for the queued ones
    pub async fn shutdown(&self) {
        tracing::info!("Draining upload completion queue...");
        self.inner.queue.shutdown().await;
    }
}

/// Destination path as stored in the record: relative, `/`-separated, with
/// no parent-directory components
fn normalize_destination(path: &str) -> Result<String, UploadError> {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(UploadError::InvalidInput("path is required".into()));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(UploadError::InvalidInput(format!(
                    "invalid destination path: {}",
                    path
                )))
            }
        }
    }

    if parts.is_empty() {
        return Err(UploadError::InvalidInput("path is required".into()));
    }

    Ok(parts.join("/"))
}

/// Hidden sibling of `dest` used while copying
fn partial_path(dest: &str, id: &UploadId) -> String {
    let name = format!(".{}.{}.partial", base_name(dest), id);
    match parent_path(dest) {
        "" => name,
        parent => format!("{}/{}", parent, name),
    }
}
