//! Storage types

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Metadata about a stored file or directory
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

/// Seekable async reader
pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ReadSeek for T {}

pub type BoxedReader = Box<dyn ReadSeek>;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Blocking tar stream produced by [`super::BackingStore::archive`]
pub type ArchiveReader = Box<dyn std::io::Read + Send>;
