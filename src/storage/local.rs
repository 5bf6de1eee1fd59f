//! Directory-backed store
//!
//! Maps store paths (`a/b/c.bin`) onto a root directory on local disk.

use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;

use super::pipe::{pipe, PipeWriter};
use super::types::{ArchiveReader, BoxedReader, BoxedWriter, FileInfo};
use super::BackingStore;

/// Pending writes buffered between the tar producer and its reader
const ARCHIVE_PIPE_DEPTH: usize = 16;

/// Write buffer in front of the archive pipe
const ARCHIVE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a store path to a location under the root.
    ///
    /// Only plain components are accepted; `..` and absolute prefixes are
    /// rejected so callers cannot escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut resolved = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidPath(path.to_string())),
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl BackingStore for LocalStore {
    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        let full = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;

        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(FileInfo {
            name,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            is_dir: metadata.is_dir(),
        })
    }

    async fn open(&self, path: &str) -> Result<BoxedReader, StorageError> {
        let full = self.resolve(path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<BoxedWriter, StorageError> {
        let full = self.resolve(path)?;
        let file = tokio::fs::File::create(&full)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        let metadata = match tokio::fs::symlink_metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };

        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| StorageError::from_io(e, from))
    }

    async fn archive(&self, path: &str) -> Result<ArchiveReader, StorageError> {
        let dir = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&dir)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        if !metadata.is_dir() {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        let (writer, reader) = pipe(ARCHIVE_PIPE_DEPTH);

        tokio::task::spawn_blocking(move || write_tar(&dir, writer));

        Ok(Box::new(reader))
    }
}

/// Walk `dir` and write its contents as a tar stream.
///
/// Failures are pushed to the reader before the builder is dropped, since
/// dropping a `tar::Builder` writes the end-of-archive trailer.
fn write_tar(dir: &Path, writer: PipeWriter) {
    let failer = writer.clone();
    let mut builder = tar::Builder::new(BufWriter::with_capacity(ARCHIVE_BUFFER_SIZE, writer));
    builder.follow_symlinks(false);

    let result = append_tree(&mut builder, dir, Path::new(""))
        .and_then(|_| builder.finish())
        .and_then(|_| builder.get_mut().flush());

    if let Err(e) = result {
        tracing::warn!(dir = %dir.display(), error = %e, "Archive stream aborted");
        failer.fail(e);
    }
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    relative: &Path,
) -> io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let full = entry.path();
        let name = relative.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            builder.append_dir(&name, &full)?;
            append_tree(builder, &full, &name)?;
        } else {
            builder.append_path_with_name(&full, &name)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_create_stat_open() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();

        store.mkdir_all("a/b").await.unwrap();
        let mut w = store.create("a/b/file.txt").await.unwrap();
        w.write_all(b"hello").await.unwrap();
        w.shutdown().await.unwrap();

        let info = store.stat("a/b/file.txt").await.unwrap();
        assert_eq!(info.name, "file.txt");
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);
        assert!(store.stat("a/b").await.unwrap().is_dir);

        let mut r = store.open("a/b/file.txt").await.unwrap();
        let mut contents = String::new();
        r.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "hello");
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();

        assert!(matches!(
            store.stat("nope.bin").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.open("nope.bin").await,
            Err(StorageError::NotFound(_))
        ));
        store.remove_all("nope.bin").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("root")).unwrap();

        assert!(matches!(
            store.stat("../outside").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            store.create("a/../../x").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_replaces_destination() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();

        std::fs::write(temp_dir.path().join("src"), b"new").unwrap();
        std::fs::write(temp_dir.path().join("dst"), b"old").unwrap();

        store.rename("src", "dst").await.unwrap();

        assert_eq!(std::fs::read(temp_dir.path().join("dst")).unwrap(), b"new");
        assert!(!temp_dir.path().join("src").exists());
    }

    #[tokio::test]
    async fn test_archive_streams_tar() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();

        std::fs::create_dir_all(temp_dir.path().join("dir/one")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("dir/two")).unwrap();
        std::fs::write(temp_dir.path().join("dir/one/a.txt"), b"aaa").unwrap();
        std::fs::write(temp_dir.path().join("dir/two/b.txt"), b"bbbb").unwrap();

        let reader = store.archive("dir").await.unwrap();

        let names = tokio::task::spawn_blocking(move || {
            let mut archive = tar::Archive::new(reader);
            let mut names = Vec::new();
            for entry in archive.entries().unwrap() {
                let mut entry = entry.unwrap();
                if entry.header().entry_type().is_file() {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data).unwrap();
                    names.push((entry.path().unwrap().display().to_string(), data.len()));
                }
            }
            names
        })
        .await
        .unwrap();

        assert_eq!(
            names,
            vec![("one/a.txt".to_string(), 3), ("two/b.txt".to_string(), 4)]
        );
    }

    #[tokio::test]
    async fn test_archive_of_file_is_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        std::fs::write(temp_dir.path().join("f"), b"x").unwrap();

        assert!(matches!(
            store.archive("f").await,
            Err(StorageError::InvalidPath(_))
        ));
    }
}
