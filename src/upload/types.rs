//! Upload types for the chunked transfer protocol

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Default client chunk size: 16 MB
pub const DEFAULT_CHUNK_SIZE: u64 = 16_000_000;

/// Checksum algorithm used for whole-file verification
pub const CHECKSUM_ALGORITHM: &str = "xxh64";

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque upload session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied identifier
    pub fn parse(s: &str) -> Result<Self, UploadError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| UploadError::InvalidUploadId(format!("{}: {}", s, e)))
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for UploadId {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// POST /upload/new
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUploadRequest {
    /// Destination path in the final store
    #[serde(default)]
    pub path: String,

    /// Total file size in bytes
    #[serde(default)]
    pub size: u64,

    /// Whole-file checksum in `algorithm:hex` form
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUploadResponse {
    #[serde(rename = "uploadID")]
    pub upload_id: String,
}

/// Body of the complete, poll and abort calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadIdRequest {
    #[serde(rename = "uploadID", default)]
    pub upload_id: String,
}

/// Terminal state of a completion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: CompletionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Session Record
// ============================================================================

/// Durable state of one upload session, stored next to its staging file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Destination path in the final store
    pub path: String,

    /// Declared size, fixed at creation
    pub size: u64,

    /// Expected whole-file checksum
    pub checksum: String,

    /// Set once the completion worker has run to conclusion
    #[serde(default)]
    pub complete: bool,

    /// Set only when completion failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(path: String, size: u64, checksum: String) -> Self {
        Self {
            path,
            size,
            checksum,
            complete: false,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> CompletionStatus {
        match (self.complete, &self.error) {
            (false, _) => CompletionStatus::Pending,
            (true, Some(_)) => CompletionStatus::Failed,
            (true, None) => CompletionStatus::Completed,
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid upload ID: {0}")]
    InvalidUploadId(String),

    #[error("Invalid content range: {0}")]
    InvalidContentRange(String),

    #[error("Chunk range ends at {end} beyond upload size {size}")]
    ChunkOutOfBounds { end: u64, size: u64 },

    #[error("Chunk length mismatch: expected {expected} bytes, got {actual}")]
    ChunkLengthMismatch { expected: u64, actual: u64 },

    #[error("Upload not found: {0}")]
    SessionNotFound(String),

    #[error("Upload already complete")]
    SessionComplete,

    #[error("Range lock acquisition cancelled")]
    LockCancelled,

    #[error("Completion queue is shut down")]
    QueueClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::InvalidUploadId(_) => StatusCode::BAD_REQUEST,
            Self::InvalidContentRange(_) => StatusCode::BAD_REQUEST,
            Self::ChunkOutOfBounds { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::ChunkLengthMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionComplete => StatusCode::CONFLICT,
            Self::LockCancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidUploadId(_) => "INVALID_UPLOAD_ID",
            Self::InvalidContentRange(_) => "INVALID_CONTENT_RANGE",
            Self::ChunkOutOfBounds { .. } => "CHUNK_OUT_OF_BOUNDS",
            Self::ChunkLengthMismatch { .. } => "CHUNK_LENGTH_MISMATCH",
            Self::SessionNotFound(_) => "UPLOAD_NOT_FOUND",
            Self::SessionComplete => "UPLOAD_COMPLETE",
            Self::LockCancelled => "LOCK_CANCELLED",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Storage(err.to_string())
    }
}

impl From<crate::error::StorageError> for UploadError {
    fn from(err: crate::error::StorageError) -> Self {
        UploadError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_parse() {
        let id = UploadId::new();
        let parsed = UploadId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);

        assert!(matches!(
            UploadId::parse("../../etc/passwd"),
            Err(UploadError::InvalidUploadId(_))
        ));
        assert!(UploadId::parse("").is_err());
    }

    #[test]
    fn test_record_status() {
        let mut record = SessionRecord::new("a/b.bin".into(), 10, "xxh64:00".into());
        assert_eq!(record.status(), CompletionStatus::Pending);

        record.complete = true;
        assert_eq!(record.status(), CompletionStatus::Completed);

        record.error = Some("checksum mismatch".into());
        assert_eq!(record.status(), CompletionStatus::Failed);
    }

    #[test]
    fn test_wire_field_names() {
        let body = serde_json::to_value(NewUploadResponse {
            upload_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(body["uploadID"], "abc");

        let poll = serde_json::to_value(PollResponse {
            status: CompletionStatus::Pending,
            error: None,
        })
        .unwrap();
        assert_eq!(poll, serde_json::json!({ "status": "Pending" }));

        let req: NewUploadRequest = serde_json::from_str(r#"{"path": "x"}"#).unwrap();
        assert_eq!(req.size, 0);
        assert!(req.checksum.is_empty());
    }
}
