//! Upload error types.

use docingest_transfer::TransferError;

/// Failure of a single call to the remote upload service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Timeouts, network failures, 5xx and 429 are worth another attempt.
    /// Everything else (other 4xx, malformed responses) is fatal.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidResponse(_) | Self::Unsupported(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("init failed: {0}")]
    Init(#[source] TransportError),

    #[error("chunk {index} failed after {attempts} attempt(s): {source}")]
    ChunkTransport {
        index: usize,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("chunk {index} could not be read: {source}")]
    ChunkSource {
        index: usize,
        #[source]
        source: TransferError,
    },

    #[error("complete failed: {0}")]
    Complete(#[source] TransportError),

    #[error("cancelled")]
    Cancelled,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {0} has no remote upload session")]
    NoRemoteSession(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// The chunk responsible for the failure, if any.
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            Self::ChunkTransport { index, .. } | Self::ChunkSource { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Io(e) => Self::Io(e),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}
