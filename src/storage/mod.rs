//! Storage module
//!
//! The backing store is the filesystem the final uploads land in and downloads
//! are served from. The upload/download core only talks to it through
//! [`BackingStore`]; [`LocalStore`] is the directory-backed implementation.

mod local;
mod pipe;
mod types;

pub use local::LocalStore;
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use types::*;

use async_trait::async_trait;

use crate::error::StorageError;

/// Filesystem operations the transfer core depends on
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Stat a file or directory
    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError>;

    /// Open a file for seekable reading
    async fn open(&self, path: &str) -> Result<BoxedReader, StorageError>;

    /// Create (or truncate) a file for writing
    async fn create(&self, path: &str) -> Result<BoxedWriter, StorageError>;

    /// Create a directory and all missing parents
    async fn mkdir_all(&self, path: &str) -> Result<(), StorageError>;

    /// Remove a file or directory tree. Missing paths are not an error.
    async fn remove_all(&self, path: &str) -> Result<(), StorageError>;

    /// Atomically replace `to` with `from`
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Produce an incremental tar stream of a directory.
    ///
    /// Entry names are relative to `path`. Stores without archive support
    /// keep the default.
    async fn archive(&self, path: &str) -> Result<ArchiveReader, StorageError> {
        let _ = path;
        Err(StorageError::Unsupported("archive"))
    }
}

/// Parent directory of a store path, `""` for top-level entries
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

/// Final component of a store path
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
