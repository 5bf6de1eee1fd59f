//! Directory archives
//!
//! The backing store hands out a directory as an incremental tar stream.
//! Clients expect zip, so each regular file entry is re-encoded as a deflated
//! zip entry as it goes by. Nothing is buffered beyond one write block.

use std::io::{self, Read, Write};

use bytes::Bytes;
use chrono::DateTime;
use futures::Stream;
use tokio::sync::mpsc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::ArchiveError;
use crate::storage::ArchiveReader;

/// Bytes gathered before a block is handed to the response body
const BLOCK_SIZE: usize = 64 * 1024;

/// Blocks in flight between the encoder and the response
const CHANNEL_DEPTH: usize = 8;

/// Convert a tar stream into a zip archive written to `writer`.
///
/// Only regular files become entries, named `<prefix>/<tar path>`. Returns
/// the number of entries written.
pub fn tar_to_zip<R: Read, W: Write>(
    reader: R,
    writer: W,
    prefix: &str,
) -> Result<usize, ArchiveError> {
    let mut tar = tar::Archive::new(reader);
    let mut zip = ZipWriter::new_stream(writer);
    let prefix = prefix.trim_matches('/');
    let mut count = 0;

    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?.to_string_lossy().replace('\\', "/");
        let relative = path.trim_start_matches("./").trim_start_matches('/');
        if relative.is_empty() {
            continue;
        }

        let name = if prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", prefix, relative)
        };

        // Sizes are only known after the entry is written, so the stream
        // writer needs a unix mode to emit data descriptors
        let size = entry.header().size()?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_time(entry.header().mtime().unwrap_or(0)))
            .unix_permissions(entry.header().mode().unwrap_or(0o644) & 0o777)
            .large_file(size >= u32::MAX as u64);

        zip.start_file(name, options)?;
        io::copy(&mut entry, &mut zip)?;
        count += 1;
    }

    zip.finish()?;
    Ok(count)
}

/// Zip a tar stream on a blocking thread and expose the output as a body
/// stream.
///
/// A failure part way through ends the stream with an error, so the client
/// sees a truncated download rather than a valid-looking archive.
pub fn zip_stream(
    reader: ArchiveReader,
    prefix: String,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);

    tokio::task::spawn_blocking(move || {
        let mut writer = BlockWriter::new(tx.clone());
        let result = tar_to_zip(reader, &mut writer, &prefix)
            .and_then(|count| writer.flush().map(|_| count).map_err(ArchiveError::from));

        match result {
            Ok(count) => tracing::debug!(prefix = %prefix, entries = count, "Directory archive finished"),
            Err(e) => {
                tracing::warn!(prefix = %prefix, error = %e, "Directory archive failed");
                let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
            }
        }
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

/// Blocking writer that forwards fixed-size blocks over a channel
struct BlockWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl BlockWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(BLOCK_SIZE),
        }
    }
}

impl Write for BlockWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= BLOCK_SIZE {
            self.flush()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let block = std::mem::replace(&mut self.buf, Vec::with_capacity(BLOCK_SIZE));
        self.tx
            .blocking_send(Ok(Bytes::from(block)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "download receiver closed"))
    }
}

/// Zip timestamps cover 1980 through 2107; anything else gets the zip epoch
fn zip_time(mtime: u64) -> zip::DateTime {
    i64::try_from(mtime)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .and_then(|time| zip::DateTime::try_from(time.naive_utc()).ok())
        .unwrap_or_default()
}
