//! Chunk planning, per-file transfer state and progress aggregation.
//!
//! This crate holds everything about a chunked transfer that does not touch
//! the network: how a file is split, what state each chunk and task is in,
//! and how throughput and ETA are derived from acknowledgments.

mod chunked;
mod progress;
mod types;
mod validation;

pub use chunked::{ByteRange, FileSource, plan, should_chunk, total_chunks};
pub use progress::{ProgressAggregator, ProgressSnapshot, SpeedCalculator};
pub use types::{
    ChunkRecord, ChunkStatus, NewTask, TaskError, TaskEvent, TaskState, UploadTask, transition,
};
pub use validation::{normalize_relative_path, validate_upload_path};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Files at or above this size go through the chunked path: 10 MiB.
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Largest file accepted for upload: 500 MiB.
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("source ended early: expected {expected} bytes at offset {offset}, got {actual}")]
    ShortRead {
        offset: u64,
        expected: u64,
        actual: u64,
    },
}
