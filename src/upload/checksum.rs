//! Whole-file checksums in `algorithm:hex` form
//!
//! Only xxh64 (seed 0) is supported. The digest is rendered as 16 lowercase hex
//! digits of the big-endian hash value.

use tokio::io::{AsyncRead, AsyncReadExt};
use xxhash_rust::xxh64::Xxh64;

use super::types::CHECKSUM_ALGORITHM;

const READ_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("invalid checksum format: {0}")]
    InvalidFormat(String),

    #[error("unsupported checksum algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("error reading data: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental xxh64 checksum
pub struct StreamingChecksum {
    hasher: Xxh64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self {
            hasher: Xxh64::new(0),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Render as `xxh64:<hex>`
    pub fn finish(&self) -> String {
        format!(
            "{}:{}",
            CHECKSUM_ALGORITHM,
            hex::encode(self.hasher.digest().to_be_bytes())
        )
    }
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut checksum = StreamingChecksum::new();
    checksum.update(data);
    checksum.finish()
}

/// Split `algorithm:hex`, rejecting anything but a supported algorithm
pub fn parse_checksum(value: &str) -> Result<(&str, &str), ChecksumError> {
    let (algorithm, digest) = value
        .split_once(':')
        .ok_or_else(|| ChecksumError::InvalidFormat(value.to_string()))?;

    if algorithm != CHECKSUM_ALGORITHM {
        return Err(ChecksumError::UnsupportedAlgorithm(algorithm.to_string()));
    }

    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ChecksumError::InvalidFormat(value.to_string()));
    }

    Ok((algorithm, digest))
}

/// Stream `reader` to the end and return its checksum
pub async fn checksum_reader<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut checksum = StreamingChecksum::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        checksum.update(&buf[..n]);
    }

    Ok(checksum.finish())
}

/// Verify that `reader` hashes to `expected`
pub async fn verify_checksum<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: &str,
) -> Result<(), ChecksumError> {
    parse_checksum(expected)?;

    let actual = checksum_reader(reader).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ChecksumError::Mismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    Ok(())
}
