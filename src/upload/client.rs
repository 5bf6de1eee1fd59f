//! Upload Client
//!
//! Drives the chunked upload protocol from the sending side:
//!
//! 1. checksum the source without holding it in memory
//! 2. open a session with `POST /upload/new`
//! 3. send fixed-size chunks over a bounded number of connections, retrying
//!    transient failures with backoff
//! 4. request completion and poll until the server reports a terminal state

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use rand::Rng;
use reqwest::header::CONTENT_RANGE;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use super::checksum::StreamingChecksum;
use super::content_range::ContentRange;
use super::source::ChunkSource;
use super::types::{
    CompletionStatus, NewUploadRequest, NewUploadResponse, PollResponse, UploadId,
    UploadIdRequest, DEFAULT_CHUNK_SIZE,
};

/// Read size used while checksumming the source
const CHECKSUM_READ_SIZE: u64 = 8 * 1024 * 1024;

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Concurrent chunk uploads
    pub num_connections: usize,

    /// Bytes per chunk; the last chunk carries the remainder
    pub chunk_size: u64,

    /// Attempts per chunk before it counts as failed
    pub max_retry_attempts: u32,

    /// Per-request timeout. `None` leaves requests unbounded.
    pub request_timeout: Option<Duration>,

    /// Upper bound on the whole completion wait
    pub completion_timeout: Duration,

    /// Ceiling for the delay between polls and between chunk retries
    pub max_poll_delay: Duration,

    /// First backoff delay, doubled on every further attempt
    pub initial_delay: Duration,

    /// Consecutive failed polls tolerated before giving up
    pub max_poll_errors: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            num_connections: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retry_attempts: 3,
            request_timeout: None,
            completion_timeout: Duration::from_secs(5 * 60),
            max_poll_delay: Duration::from_secs(10),
            initial_delay: Duration::from_millis(100),
            max_poll_errors: 3,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A chunk that could not be uploaded
#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub start: u64,
    pub end: u64,
    pub error: String,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}: {}", self.start, self.end, self.error)
    }
}

/// Every chunk that failed in one upload
#[derive(Debug, Clone)]
pub struct ChunkFailures(pub Vec<ChunkFailure>);

impl fmt::Display for ChunkFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} chunk(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("error reading source: {0}")]
    Source(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("server rejected request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("{0}")]
    ChunksFailed(ChunkFailures),

    #[error("upload not found: {0}")]
    NotFound(UploadId),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("polling for completion failed after {attempts} consecutive errors: {last}")]
    PollFailed { attempts: u32, last: String },

    #[error("timed out waiting for upload completion")]
    CompletionTimeout,

    #[error("upload cancelled")]
    Cancelled,
}

/// Outcome of one failed chunk attempt
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

enum PollError {
    NotFound,
    Transient(String),
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    base_url: String,
    opts: ClientOptions,
}

impl UploadClient {
    /// Create a client for the server at `base_url` (e.g. `http://host:port`)
    pub fn new(base_url: impl Into<String>, opts: ClientOptions) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = opts.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            opts,
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    /// Upload `size` bytes of `source` to `path` and wait for the server to
    /// finalize them
    pub async fn upload(
        &self,
        path: &str,
        source: Arc<dyn ChunkSource>,
        size: u64,
    ) -> Result<(), ClientError> {
        self.upload_with_cancel(path, source, size, &CancellationToken::new())
            .await
    }

    /// Like [`UploadClient::upload`], stopping early when `cancel` fires.
    ///
    /// A cancelled upload leaves its staged data on the server until it is
    /// aborted or expires.
    pub async fn upload_with_cancel(
        &self,
        path: &str,
        source: Arc<dyn ChunkSource>,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(path, "Upload cancelled");
                Err(ClientError::Cancelled)
            }
            result = self.run_upload(path, source, size) => result,
        }
    }

    /// Abandon a session and release its staged data
    pub async fn abort(&self, id: UploadId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/upload/abort"))
            .json(&UploadIdRequest {
                upload_id: id.to_string(),
            })
            .send()
            .await?;

        ensure_success(response).await.map(|_| ())
    }

    async fn run_upload(
        &self,
        path: &str,
        source: Arc<dyn ChunkSource>,
        size: u64,
    ) -> Result<(), ClientError> {
        let checksum = source_checksum(source.as_ref(), size).await?;

        let id = self.new_upload(path, size, checksum).await?;
        tracing::info!(upload_id = %id, path, size, "Upload session created");

        let ranges = chunk_ranges(size, self.opts.chunk_size);
        let chunk_count = ranges.len();

        let failures: Vec<ChunkFailure> = stream::iter(ranges)
            .map(|range| {
                let source = source.clone();
                async move {
                    self.upload_chunk(id, source.as_ref(), range)
                        .await
                        .err()
                        .map(|error| ChunkFailure {
                            start: range.start,
                            end: range.end,
                            error,
                        })
                }
            })
            .buffer_unordered(self.opts.num_connections.max(1))
            .filter_map(|failure| async move { failure })
            .collect()
            .await;

        if !failures.is_empty() {
            tracing::warn!(upload_id = %id, failed = failures.len(), "Chunk upload failed");
            return Err(ClientError::ChunksFailed(ChunkFailures(failures)));
        }

        tracing::debug!(upload_id = %id, chunks = chunk_count, "All chunks uploaded");

        let response = self
            .http
            .post(self.url("/upload/complete"))
            .json(&UploadIdRequest {
                upload_id: id.to_string(),
            })
            .send()
            .await?;
        ensure_success(response).await?;

        self.wait_for_completion(id).await?;

        tracing::info!(upload_id = %id, path, "Upload completed");
        Ok(())
    }

    async fn new_upload(
        &self,
        path: &str,
        size: u64,
        checksum: String,
    ) -> Result<UploadId, ClientError> {
        let response = self
            .http
            .post(self.url("/upload/new"))
            .json(&NewUploadRequest {
                path: path.to_string(),
                size,
                checksum,
            })
            .send()
            .await?;

        let body: NewUploadResponse = ensure_success(response).await?.json().await?;

        UploadId::parse(&body.upload_id).map_err(|_| ClientError::InvalidUploadId(body.upload_id))
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Send one chunk, retrying transient failures
    async fn upload_chunk(
        &self,
        id: UploadId,
        source: &dyn ChunkSource,
        range: ContentRange,
    ) -> Result<(), String> {
        let max_attempts = self.opts.max_retry_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.send_chunk(id, source, range).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Retryable(error)) => {
                    if attempt >= max_attempts {
                        return Err(error);
                    }

                    tracing::warn!(
                        upload_id = %id,
                        start = range.start,
                        end = range.end,
                        attempt,
                        error = %error,
                        "Retrying chunk upload"
                    );

                    let delay =
                        backoff_delay(self.opts.initial_delay, self.opts.max_poll_delay, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_chunk(
        &self,
        id: UploadId,
        source: &dyn ChunkSource,
        range: ContentRange,
    ) -> Result<(), AttemptError> {
        let data = source
            .read_range(range.start, range.len())
            .await
            .map_err(|e| AttemptError::Fatal(format!("error reading source: {}", e)))?;

        let part = Part::stream_with_length(data, range.len())
            .file_name(id.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| AttemptError::Fatal(e.to_string()))?;

        let response = self
            .http
            .patch(self.url("/upload/chunk"))
            .header(CONTENT_RANGE, range.to_string())
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        let error = format!("{}: {}", status, message);

        if status.is_client_error() {
            Err(AttemptError::Fatal(error))
        } else {
            Err(AttemptError::Retryable(error))
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Poll until the upload is terminal, the error budget is spent, or the
    /// completion timeout passes
    async fn wait_for_completion(&self, id: UploadId) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + self.opts.completion_timeout;
        let mut delay = self.opts.initial_delay;
        let mut consecutive_errors: u32 = 0;

        loop {
            let polled = tokio::time::timeout_at(deadline, self.poll_once(id))
                .await
                .map_err(|_| ClientError::CompletionTimeout)?;

            match polled {
                Ok(PollResponse {
                    status: CompletionStatus::Completed,
                    ..
                }) => return Ok(()),
                Ok(PollResponse {
                    status: CompletionStatus::Failed,
                    error,
                }) => {
                    return Err(ClientError::UploadFailed(
                        error.unwrap_or_else(|| "unknown error".to_string()),
                    ))
                }
                Ok(PollResponse {
                    status: CompletionStatus::Pending,
                    ..
                }) => {
                    consecutive_errors = 0;
                }
                Err(PollError::NotFound) => return Err(ClientError::NotFound(id)),
                Err(PollError::Transient(error)) => {
                    consecutive_errors += 1;
                    if consecutive_errors > self.opts.max_poll_errors {
                        return Err(ClientError::PollFailed {
                            attempts: consecutive_errors,
                            last: error,
                        });
                    }
                    tracing::debug!(upload_id = %id, error = %error, "Poll for completion failed");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ClientError::CompletionTimeout);
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.opts.max_poll_delay);
        }
    }

    async fn poll_once(&self, id: UploadId) -> Result<PollResponse, PollError> {
        let response = self
            .http
            .post(self.url("/upload/poll"))
            .json(&UploadIdRequest {
                upload_id: id.to_string(),
            })
            .send()
            .await
            .map_err(|e| PollError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(PollError::NotFound),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| PollError::Transient(e.to_string())),
            status => Err(PollError::Transient(format!("unexpected status {}", status))),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Turn a non-2xx response into [`ClientError::Rejected`]
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Rejected { status, message })
}

/// Checksum the first `size` bytes of `source`
pub async fn source_checksum(source: &dyn ChunkSource, size: u64) -> std::io::Result<String> {
    let mut checksum = StreamingChecksum::new();
    let mut offset = 0;

    while offset < size {
        let len = CHECKSUM_READ_SIZE.min(size - offset);
        let data = source.read_range(offset, len).await?;
        checksum.update(&data);
        offset += len;
    }

    Ok(checksum.finish())
}

/// Split `[0, size)` into contiguous inclusive ranges of `chunk_size` bytes
pub fn chunk_ranges(size: u64, chunk_size: u64) -> Vec<ContentRange> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::with_capacity(size.div_ceil(chunk_size) as usize);

    let mut start = 0;
    while start < size {
        let end = (start + chunk_size - 1).min(size - 1);
        ranges.push(ContentRange::new(start, end, size));
        start = end + 1;
    }

    ranges
}

/// Exponential delay for a 1-based `attempt`, capped at `max`, with ±25%
/// jitter
fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31) as i32;
    let secs = (initial.as_secs_f64() * 2f64.powi(exp)).min(max.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(-0.25..=0.25);
    Duration::from_secs_f64((secs * (1.0 + jitter)).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_default_options() {
        let opts = ClientOptions::default();
        assert_eq!(opts.num_connections, 1);
        assert_eq!(opts.chunk_size, 16_000_000);
        assert_eq!(opts.max_retry_attempts, 3);
        assert_eq!(opts.completion_timeout, Duration::from_secs(300));
        assert_eq!(opts.max_poll_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_chunk_ranges() {
        let ranges = chunk_ranges(100_000_000, 16_000_000);
        assert_eq!(ranges.len(), 7);
        assert_eq!(ranges[0], ContentRange::new(0, 15_999_999, 100_000_000));
        assert_eq!(
            ranges[6],
            ContentRange::new(96_000_000, 99_999_999, 100_000_000)
        );

        let covered: u64 = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(covered, 100_000_000);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
    }

    #[test]
    fn test_chunk_ranges_exact_and_small() {
        assert_eq!(chunk_ranges(32, 16).len(), 2);
        assert_eq!(chunk_ranges(5, 16), vec![ContentRange::new(0, 4, 5)]);
        assert!(chunk_ranges(0, 16).is_empty());
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(1);

        for attempt in 1..10 {
            let delay = backoff_delay(initial, max, attempt);
            assert!(delay <= Duration::from_millis(1250), "attempt {}: {:?}", attempt, delay);
        }

        let first = backoff_delay(initial, max, 1);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
    }

    #[test]
    fn test_chunk_failures_display() {
        let failures = ChunkFailures(vec![
            ChunkFailure {
                start: 0,
                end: 9,
                error: "500 Internal Server Error".into(),
            },
            ChunkFailure {
                start: 10,
                end: 19,
                error: "connection reset".into(),
            },
        ]);

        let message = ClientError::ChunksFailed(failures).to_string();
        assert!(message.starts_with("2 chunk(s) failed"));
        assert!(message.contains("bytes 0-9: 500"));
        assert!(message.contains("bytes 10-19: connection reset"));
    }

    #[tokio::test]
    async fn test_source_checksum_matches_one_shot() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 13) as u8).collect();
        let source = Bytes::from(data.clone());

        assert_eq!(
            source_checksum(&source, data.len() as u64).await.unwrap(),
            crate::upload::checksum::checksum_bytes(&data)
        );
    }
}
