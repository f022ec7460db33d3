//! Chunked upload engine for the document-ingestion service.
//!
//! [`UploadRegistry`] accepts files, queues them as tasks and drives each
//! one through `init`, a bounded window of parallel chunk uploads and
//! `complete`. The network sits behind [`ChunkTransport`];
//! [`HttpTransport`] is the multipart implementation.

pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod retry;
pub mod scanner;
pub(crate) mod scheduler;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig, RetryConfig};
pub use error::{TransportError, UploadError};
pub use http::HttpTransport;
pub use registry::UploadRegistry;
pub use retry::{RetryError, RetryPolicy};
pub use scanner::{FolderScan, ScannedFile, SkipReason, SkippedFile, scan_folder};
pub use transport::{ChunkTransport, TransportFuture};
pub use types::{BatchSummary, SubmitOptions, TaskOutcome, UploadEvent, UploadFile};
