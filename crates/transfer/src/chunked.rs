use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// Half-open byte range `[start, end)` of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Number of chunks needed to cover `file_size` bytes: `ceil(file_size / chunk_size)`.
///
/// Returns 0 when `chunk_size` is 0.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size) as usize
}

/// Splits `file_size` bytes into ordered, contiguous ranges of `chunk_size`.
///
/// Every range except possibly the last is exactly `chunk_size` long; the
/// last one is `[k * chunk_size, file_size)`. A size that divides evenly
/// produces no trailing short chunk.
pub fn plan(file_size: u64, chunk_size: u64) -> Result<Vec<ByteRange>, TransferError> {
    if file_size == 0 {
        return Err(TransferError::InvalidInput(
            "file size must be greater than zero".into(),
        ));
    }
    if chunk_size == 0 {
        return Err(TransferError::InvalidInput(
            "chunk size must be greater than zero".into(),
        ));
    }

    let mut ranges = Vec::with_capacity(total_chunks(file_size, chunk_size));
    let mut start = 0u64;
    while start < file_size {
        let end = start.saturating_add(chunk_size).min(file_size);
        ranges.push(ByteRange::new(start, end));
        start = end;
    }
    Ok(ranges)
}

/// Returns `true` when a file is large enough for the chunked path.
///
/// Files below `threshold` are sent as a single multipart request.
pub fn should_chunk(file_size: u64, threshold: u64) -> bool {
    file_size >= threshold
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Where a task's bytes come from.
///
/// Chunks are read lazily, one range at a time, so a 500 MiB file never has
/// to sit in memory in full.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on disk, reopened for every range read.
    Disk(PathBuf),
    /// An in-memory buffer.
    Memory(Arc<[u8]>),
}

impl FileSource {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::Disk(path.as_ref().to_path_buf())
    }

    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Self {
        Self::Memory(data.into())
    }

    /// Current size of the source in bytes.
    pub async fn len(&self) -> Result<u64, TransferError> {
        match self {
            Self::Disk(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Self::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// Reads exactly the bytes of `range`.
    ///
    /// Fails with [`TransferError::ShortRead`] if the source is shorter than
    /// the range, e.g. because the file was truncated after planning.
    pub async fn read_range(&self, range: ByteRange) -> Result<Vec<u8>, TransferError> {
        let expected = range.len();
        match self {
            Self::Disk(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;

                let mut buf = vec![0u8; expected as usize];
                let mut filled = 0usize;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if (filled as u64) < expected {
                    return Err(TransferError::ShortRead {
                        offset: range.start,
                        expected,
                        actual: filled as u64,
                    });
                }
                Ok(buf)
            }
            Self::Memory(data) => {
                let len = data.len() as u64;
                if range.end > len {
                    return Err(TransferError::ShortRead {
                        offset: range.start,
                        expected,
                        actual: len.saturating_sub(range.start),
                    });
                }
                Ok(data[range.start as usize..range.end as usize].to_vec())
            }
        }
    }
}
