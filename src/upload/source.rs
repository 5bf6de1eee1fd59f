//! Byte sources the upload client reads chunks from

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Random-access source of upload data.
///
/// Reads for different ranges may run concurrently.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes>;
}

/// A file on the local disk, opened afresh for every read
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the file on disk
    pub async fn len(&self) -> std::io::Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ChunkSource for Bytes {
    async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Bytes> {
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        if end > self.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range {}..{} beyond source of {} bytes", start, end, self.len()),
            ));
        }
        Ok(self.slice(start..end))
    }
}
