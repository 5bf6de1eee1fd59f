//! Staging Store
//!
//! One pre-sized scratch file per in-flight upload, plus a small JSON record
//! holding the session's durable state. Both live in the staging directory:
//!
//! ```text
//! <staging>/<upload id>        staged bytes, written at chunk offsets
//! <staging>/<upload id>.json   SessionRecord
//! ```
//!
//! Records are replaced atomically (temp file, fsync, rename) so a concurrent
//! reader sees either the old or the new record, never a partial one.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::types::{SessionRecord, UploadError, UploadId};

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, id: &UploadId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    fn record_path(&self, id: &UploadId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Scratch name for a record being replaced. A crash can leave one
    /// behind, so `list` and `remove` treat it as part of the session.
    fn record_temp_path(&self, id: &UploadId) -> PathBuf {
        self.dir.join(format!(".{}.{}.tmp", id, RECORD_EXTENSION))
    }

    /// Create a zero-filled staging file of `record.size` bytes and persist
    /// its record
    pub async fn create(&self, record: &SessionRecord) -> Result<UploadId, UploadError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UploadError::Internal(format!("error creating staging directory: {}", e)))?;

        let id = UploadId::new();
        let data_path = self.data_path(&id);

        let file = File::create(&data_path)
            .await
            .map_err(|e| UploadError::Internal(format!("error creating staging file: {}", e)))?;

        // Sparse pre-allocation
        if let Err(e) = file.set_len(record.size).await {
            let _ = tokio::fs::remove_file(&data_path).await;
            return Err(UploadError::Internal(format!(
                "error truncating staging file: {}",
                e
            )));
        }

        if let Err(e) = self.write_record(&id, record).await {
            let _ = tokio::fs::remove_file(&data_path).await;
            return Err(e);
        }

        Ok(id)
    }

    /// Open the staged bytes for positional writes
    pub async fn open_for_write(&self, id: &UploadId) -> Result<File, UploadError> {
        OpenOptions::new()
            .write(true)
            .open(self.data_path(id))
            .await
            .map_err(|e| not_found_or(e, id, "error opening staging file"))
    }

    pub async fn open_for_read(&self, id: &UploadId) -> Result<File, UploadError> {
        File::open(self.data_path(id))
            .await
            .map_err(|e| not_found_or(e, id, "error opening staging file"))
    }

    pub async fn read_record(&self, id: &UploadId) -> Result<SessionRecord, UploadError> {
        let raw = tokio::fs::read(self.record_path(id))
            .await
            .map_err(|e| not_found_or(e, id, "error reading session record"))?;

        serde_json::from_slice(&raw)
            .map_err(|e| UploadError::Internal(format!("corrupt session record {}: {}", id, e)))
    }

    /// Atomically replace the session record
    pub async fn write_record(
        &self,
        id: &UploadId,
        record: &SessionRecord,
    ) -> Result<(), UploadError> {
        let raw = serde_json::to_vec(record)
            .map_err(|e| UploadError::Internal(format!("error encoding session record: {}", e)))?;

        let final_path = self.record_path(id);
        let temp_path = self.record_temp_path(id);

        let mut file = File::create(&temp_path).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Release the staged bytes while keeping the record
    pub async fn truncate(&self, id: &UploadId) -> Result<(), UploadError> {
        let file = self.open_for_write(id).await?;
        file.set_len(0).await?;
        Ok(())
    }

    /// Delete staged bytes and record. Missing files are ignored.
    pub async fn remove(&self, id: &UploadId) -> Result<(), UploadError> {
        for path in [
            self.data_path(id),
            self.record_path(id),
            self.record_temp_path(id),
        ] {
            match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    /// All sessions with a staging file, record or stray record temp file on
    /// disk, with the last time any of them was modified
    pub async fn list(&self) -> Result<Vec<(UploadId, SystemTime)>, UploadError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions: Vec<(UploadId, SystemTime)> = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let record_suffix = format!(".{}", RECORD_EXTENSION);
            let temp_suffix = format!(".{}.tmp", RECORD_EXTENSION);
            let stem = name
                .strip_prefix('.')
                .and_then(|n| n.strip_suffix(&temp_suffix))
                .or_else(|| name.strip_suffix(&record_suffix))
                .unwrap_or(&name);

            let Ok(id) = UploadId::parse(stem) else {
                continue;
            };

            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);

            match sessions.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, seen)) => *seen = (*seen).max(modified),
                None => sessions.push((id, modified)),
            }
        }

        Ok(sessions)
    }
}

fn not_found_or(err: std::io::Error, id: &UploadId, context: &str) -> UploadError {
    if err.kind() == ErrorKind::NotFound {
        UploadError::SessionNotFound(id.to_string())
    } else {
        UploadError::Storage(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn test_record(size: u64) -> SessionRecord {
        SessionRecord::new("dest/file.bin".into(), size, "xxh64:0123456789abcdef".into())
    }

    #[tokio::test]
    async fn test_create_preallocates() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingStore::new(temp_dir.path().join("staging"));

        let id = staging.create(&test_record(4096)).await.unwrap();

        let metadata = tokio::fs::metadata(staging.data_path(&id)).await.unwrap();
        assert_eq!(metadata.len(), 4096);

        let record = staging.read_record(&id).await.unwrap();
        assert_eq!(record.path, "dest/file.bin");
        assert_eq!(record.size, 4096);
        assert!(!record.complete);
    }

    #[tokio::test]
    async fn test_positional_writes_out_of_order() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingStore::new(temp_dir.path());
        let id = staging.create(&test_record(8)).await.unwrap();

        for (offset, data) in [(4u64, b"EFGH"), (0u64, b"ABCD")] {
            let mut file = staging.open_for_write(&id).await.unwrap();
            file.seek(std::io::SeekFrom::Start(offset)).await.unwrap();
            file.write_all(data).await.unwrap();
            file.flush().await.unwrap();
        }

        let mut contents = String::new();
        staging
            .open_for_read(&id)
            .await
            .unwrap()
            .read_to_string(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, "ABCDEFGH");
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingStore::new(temp_dir.path());
        let id = UploadId::new();

        assert!(matches!(
            staging.read_record(&id).await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(matches!(
            staging.open_for_write(&id).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let id = {
            let staging = StagingStore::new(temp_dir.path());
            let id = staging.create(&test_record(16)).await.unwrap();

            let mut record = staging.read_record(&id).await.unwrap();
            record.complete = true;
            record.error = Some("checksum mismatch".into());
            staging.write_record(&id, &record).await.unwrap();
            id
        };

        // Fresh store over the same directory, as after a restart
        let staging = StagingStore::new(temp_dir.path());
        let record = staging.read_record(&id).await.unwrap();
        assert!(record.complete);
        assert_eq!(record.error.as_deref(), Some("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_truncate_keeps_record() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingStore::new(temp_dir.path());
        let id = staging.create(&test_record(1024)).await.unwrap();

        staging.truncate(&id).await.unwrap();

        let metadata = tokio::fs::metadata(staging.data_path(&id)).await.unwrap();
        assert_eq!(metadata.len(), 0);
        assert!(staging.read_record(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingStore::new(temp_dir.path());

        let a = staging.create(&test_record(1)).await.unwrap();
        let b = staging.create(&test_record(1)).await.unwrap();
        tokio::fs::write(temp_dir.path().join("unrelated.txt"), b"x")
            .await
            .unwrap();

        let mut listed: Vec<UploadId> = staging.list().await.unwrap().into_iter().map(|(id, _)| id).collect();
        listed.sort_by_key(|id| id.to_string());
        let mut expected = vec![a, b];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(listed, expected);

        staging.remove(&a).await.unwrap();
        staging.remove(&a).await.unwrap();

        let listed = staging.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, b);
    }

    #[tokio::test]
    async fn test_orphaned_record_temp_is_listed_and_removed() {
        let temp_dir = TempDir::new().unwrap();
        let staging = StagingStore::new(temp_dir.path());

        // Left behind by a crash between writing and renaming a record
        let orphan = UploadId::new();
        let temp_path = staging.record_temp_path(&orphan);
        tokio::fs::write(&temp_path, b"{\"path\":").await.unwrap();

        let listed = staging.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, orphan);

        staging.remove(&orphan).await.unwrap();
        assert!(!temp_path.exists());
        assert!(staging.list().await.unwrap().is_empty());
    }
}
