//! Wire types for the document-ingestion upload endpoints.
//!
//! Three calls make up one chunked transfer (`init`, `upload`, `complete`),
//! routed under either a project or a folder. Files below the chunking
//! threshold use a single multipart POST instead.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    ChunkAck, CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest,
    InitUploadResponse, UploadStatusResponse,
};
pub use types::Destination;
