//! Chunked Upload Module
//!
//! Resumable uploads split into byte ranges that may arrive out of order,
//! concurrently and more than once.
//!
//! # Flow
//!
//! 1. `POST /upload/new` creates a pre-sized staging file and a session record
//! 2. `PATCH /upload/chunk` writes each range at its offset under a range lock
//! 3. `POST /upload/complete` queues verification and the copy into the store
//! 4. `POST /upload/poll` reports `Pending`, `Completed` or `Failed`
//!
//! [`UploadClient`] implements the sending side of the same protocol.

pub mod checksum;
pub mod client;
pub mod completion;
pub mod content_range;
pub mod range_lock;
pub mod service;
pub mod source;
pub mod staging;
pub mod types;

pub use checksum::{checksum_bytes, StreamingChecksum};
pub use client::{ClientError, ClientOptions, UploadClient};
pub use completion::{CompletionQueue, Submission};
pub use content_range::ContentRange;
pub use range_lock::{RangeGuard, RangeLock, RangeLockError, RangeLockRegistry};
pub use service::UploadService;
pub use source::{ChunkSource, FileSource};
pub use staging::StagingStore;
pub use types::*;
