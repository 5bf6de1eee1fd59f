//! Error types for the Ferry server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backing store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Map an IO error for `path`, keeping not-found distinct
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::Io(err)
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Storage(e) => match e {
                StorageError::NotFound(path) => {
                    (StatusCode::NOT_FOUND, "not_found", format!("Not found: {}", path))
                }
                StorageError::InvalidPath(path) => {
                    (StatusCode::BAD_REQUEST, "bad_request", format!("Invalid path: {}", path))
                }
                _ => {
                    tracing::error!("Storage error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "storage_error",
                        "Storage error".to_string(),
                    )
                }
            },
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "io_error",
                    "IO error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                AppError::Storage(StorageError::NotFound("a/b".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Storage(StorageError::InvalidPath("../x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Storage(StorageError::Unsupported("archive")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_from_io_keeps_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            StorageError::from_io(err, "a.txt"),
            StorageError::NotFound(path) if path == "a.txt"
        ));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(StorageError::from_io(err, "a.txt"), StorageError::Io(_)));
    }
}
