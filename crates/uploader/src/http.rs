//! Multipart HTTP transport.
//!
//! Async client using `reqwest`, with optional Bearer token authentication.

use std::time::Duration;

use docingest_protocol::constants::{
    CHUNKED_CANCEL, CHUNKED_COMPLETE, CHUNKED_INIT, CHUNKED_STATUS, CHUNKED_UPLOAD, FIELD_BATCH_ID,
    FIELD_CHUNK, FIELD_CHUNK_INDEX, FIELD_FILE, FIELD_RELATIVE_PATH, FIELD_UPLOAD_ID,
};
use docingest_protocol::{
    ChunkAck, CompleteUploadRequest, CompleteUploadResponse, Destination, InitUploadRequest,
    InitUploadResponse, UploadStatusResponse,
};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{TransportError, UploadError};
use crate::transport::{ChunkTransport, TransportFuture};

/// Timeout for requests that carry no file data.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`ChunkTransport`] over the service's multipart HTTP endpoints.
///
/// Chunk uploads carry no client-side timeout of their own; the scheduler
/// bounds each attempt.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for `base_url`, e.g. `https://docs.example.com/api`.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, UploadError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| UploadError::InvalidInput("invalid API token".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(TransportError::from)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends a request and decodes a JSON success body.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let resp = request.send().await?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    /// Uploads a small file in one multipart request and returns the
    /// server's answer.
    ///
    /// This is the path for files below the chunking threshold; it bypasses
    /// the task engine entirely.
    pub async fn upload_direct(
        &self,
        destination: &Destination,
        file_name: &str,
        data: Vec<u8>,
        batch_id: &str,
        relative_path: Option<&str>,
        timeout: Duration,
    ) -> Result<CompleteUploadResponse, TransportError> {
        let size = data.len();
        let mut form = Form::new()
            .part(FIELD_FILE, Part::bytes(data).file_name(file_name.to_string()))
            .text(FIELD_BATCH_ID, batch_id.to_string());
        if let Some(path) = relative_path.filter(|p| !p.is_empty()) {
            form = form.text(FIELD_RELATIVE_PATH, path.to_string());
        }

        trace!(destination = %destination, file = file_name, size, "direct upload");
        let request = self
            .http
            .post(self.url(&destination.files_path()))
            .multipart(form)
            .timeout(timeout);
        let resp: CompleteUploadResponse = self.send_json(request).await?;
        non_empty_file_id(resp)
    }
}

fn text_form(fields: Vec<(&'static str, String)>) -> Form {
    fields
        .into_iter()
        .fold(Form::new(), |form, (name, value)| form.text(name, value))
}

fn non_empty_file_id(resp: CompleteUploadResponse) -> Result<CompleteUploadResponse, TransportError> {
    if resp.file_id.is_empty() {
        return Err(TransportError::InvalidResponse("empty file id".into()));
    }
    Ok(resp)
}

impl ChunkTransport for HttpTransport {
    fn init<'a>(
        &'a self,
        destination: &'a Destination,
        request: &'a InitUploadRequest,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let req = self
                .http
                .post(self.url(&destination.endpoint(CHUNKED_INIT)))
                .multipart(text_form(request.form_fields()))
                .timeout(self.request_timeout);
            let resp: InitUploadResponse = self.send_json(req).await?;
            if resp.upload_id.is_empty() {
                return Err(TransportError::InvalidResponse("empty upload id".into()));
            }
            Ok(resp.upload_id)
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        destination: &'a Destination,
        upload_id: &'a str,
        chunk_index: usize,
        data: Vec<u8>,
    ) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move {
            let form = text_form(vec![
                (FIELD_UPLOAD_ID, upload_id.to_string()),
                (FIELD_CHUNK_INDEX, chunk_index.to_string()),
            ])
            .part(
                FIELD_CHUNK,
                Part::bytes(data).file_name(format!("chunk_{chunk_index}")),
            );
            let req = self
                .http
                .post(self.url(&destination.endpoint(CHUNKED_UPLOAD)))
                .multipart(form);
            self.send_json(req).await
        })
    }

    fn complete<'a>(
        &'a self,
        destination: &'a Destination,
        request: &'a CompleteUploadRequest,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let req = self
                .http
                .post(self.url(&destination.endpoint(CHUNKED_COMPLETE)))
                .multipart(text_form(request.form_fields()))
                .timeout(self.request_timeout);
            let resp: CompleteUploadResponse = self.send_json(req).await?;
            Ok(non_empty_file_id(resp)?.file_id)
        })
    }

    fn status<'a>(
        &'a self,
        destination: &'a Destination,
        upload_id: &'a str,
    ) -> TransportFuture<'a, UploadStatusResponse> {
        Box::pin(async move {
            let path = destination.endpoint(&format!("{CHUNKED_STATUS}/{upload_id}"));
            let req = self.http.get(self.url(&path)).timeout(self.request_timeout);
            self.send_json(req).await
        })
    }

    fn abort<'a>(
        &'a self,
        destination: &'a Destination,
        upload_id: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let path = destination.endpoint(&format!("{CHUNKED_CANCEL}/{upload_id}"));
            let resp = self
                .http
                .delete(self.url(&path))
                .timeout(self.request_timeout)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(())
        })
    }
}
