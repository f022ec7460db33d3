//! Remote upload service abstraction.
//!
//! `ChunkTransport` is the seam between the scheduler and the wire.
//! [`HttpTransport`](crate::http::HttpTransport) implements it over
//! multipart HTTP; tests implement it with in-memory mocks.

use std::future::Future;
use std::pin::Pin;

use docingest_protocol::{
    ChunkAck, CompleteUploadRequest, Destination, InitUploadRequest, UploadStatusResponse,
};

use crate::error::TransportError;

/// Boxed future returned by [`ChunkTransport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Abstract connection to the remote upload service.
///
/// Every method is a single attempt. Retries, timeouts on chunk calls and
/// cancellation are the caller's business.
pub trait ChunkTransport: Send + Sync {
    /// Opens an upload session and returns the remote upload id.
    fn init<'a>(
        &'a self,
        destination: &'a Destination,
        request: &'a InitUploadRequest,
    ) -> TransportFuture<'a, String>;

    /// Sends one chunk of an open session.
    fn upload_chunk<'a>(
        &'a self,
        destination: &'a Destination,
        upload_id: &'a str,
        chunk_index: usize,
        data: Vec<u8>,
    ) -> TransportFuture<'a, ChunkAck>;

    /// Assembles the session into a file and returns its resource id.
    fn complete<'a>(
        &'a self,
        destination: &'a Destination,
        request: &'a CompleteUploadRequest,
    ) -> TransportFuture<'a, String>;

    /// Asks the server which chunks of a session it holds.
    fn status<'a>(
        &'a self,
        _destination: &'a Destination,
        _upload_id: &'a str,
    ) -> TransportFuture<'a, UploadStatusResponse> {
        Box::pin(async { Err(TransportError::Unsupported("status")) })
    }

    /// Discards a session and its stored chunks.
    fn abort<'a>(
        &'a self,
        _destination: &'a Destination,
        _upload_id: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async { Err(TransportError::Unsupported("abort")) })
    }
}
