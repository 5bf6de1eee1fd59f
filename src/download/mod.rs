//! Download Module
//!
//! Helpers behind `GET /download/*path`: byte-range selection for single
//! files and tar-to-zip conversion for directories.

pub mod archive;
pub mod range;

pub use archive::{tar_to_zip, zip_stream};
pub use range::{parse_range, ByteRange};

/// Directory archive errors
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
