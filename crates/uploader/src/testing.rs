//! In-memory transport for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use docingest_protocol::{
    ChunkAck, CompleteUploadRequest, Destination, InitUploadRequest, UploadStatusResponse,
};
use tokio::sync::Semaphore;

use crate::error::TransportError;
use crate::transport::{ChunkTransport, TransportFuture};

/// Deterministic file content: byte `i` is `i % 251`.
pub(crate) fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

enum ChunkScript {
    Fail(TransportError),
    Stall,
}

/// Records every call and answers from scripts, defaulting to success.
///
/// Upload ids are `upload-1`, `upload-2`, ... in init order; the file id
/// returned by `complete` is `file-<upload id>`.
pub(crate) struct MockTransport {
    pub(crate) init_calls: AtomicUsize,
    pub(crate) complete_calls: AtomicUsize,
    pub(crate) abort_calls: AtomicUsize,
    pub(crate) in_flight: Arc<AtomicUsize>,
    pub(crate) peak_in_flight: Arc<AtomicUsize>,
    inits: Mutex<Vec<InitUploadRequest>>,
    init_failures: Mutex<VecDeque<TransportError>>,
    complete_failure: Mutex<Option<TransportError>>,
    chunk_scripts: Mutex<HashMap<usize, VecDeque<ChunkScript>>>,
    chunk_calls: Mutex<Vec<usize>>,
    received: Mutex<HashMap<(String, usize), Vec<u8>>>,
    chunk_delay: Duration,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            init_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            abort_calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            inits: Mutex::new(Vec::new()),
            init_failures: Mutex::new(VecDeque::new()),
            complete_failure: Mutex::new(None),
            chunk_scripts: Mutex::new(HashMap::new()),
            chunk_calls: Mutex::new(Vec::new()),
            received: Mutex::new(HashMap::new()),
            chunk_delay: Duration::ZERO,
            gate: None,
        }
    }

    pub(crate) fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Holds every chunk call until the returned semaphore gets permits.
    pub(crate) fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub(crate) fn fail_init(&self, error: TransportError) {
        self.init_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn fail_complete(&self, error: TransportError) {
        *self.complete_failure.lock().unwrap() = Some(error);
    }

    /// Queues errors for the next calls on chunk `index`.
    pub(crate) fn fail_chunk(&self, index: usize, errors: impl IntoIterator<Item = TransportError>) {
        let mut scripts = self.chunk_scripts.lock().unwrap();
        let script = scripts.entry(index).or_default();
        script.extend(errors.into_iter().map(ChunkScript::Fail));
    }

    /// Makes the next `times` calls on chunk `index` hang forever.
    pub(crate) fn stall_chunk(&self, index: usize, times: usize) {
        let mut scripts = self.chunk_scripts.lock().unwrap();
        let script = scripts.entry(index).or_default();
        script.extend((0..times).map(|_| ChunkScript::Stall));
    }

    pub(crate) fn chunk_call_count(&self) -> usize {
        self.chunk_calls.lock().unwrap().len()
    }

    pub(crate) fn chunk_indices(&self) -> Vec<usize> {
        self.chunk_calls.lock().unwrap().clone()
    }

    pub(crate) fn last_init(&self) -> Option<InitUploadRequest> {
        self.inits.lock().unwrap().last().cloned()
    }

    pub(crate) fn inits(&self) -> Vec<InitUploadRequest> {
        self.inits.lock().unwrap().clone()
    }

    /// Concatenates the received chunks of a session in index order.
    pub(crate) fn assembled(&self, upload_id: &str, total_chunks: usize) -> Vec<u8> {
        let received = self.received.lock().unwrap();
        (0..total_chunks)
            .flat_map(|i| {
                received
                    .get(&(upload_id.to_string(), i))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Tracks concurrent chunk calls, including ones dropped mid-flight.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChunkTransport for MockTransport {
    fn init<'a>(
        &'a self,
        _destination: &'a Destination,
        request: &'a InitUploadRequest,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let n = self.init_calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.inits.lock().unwrap().push(request.clone());
            if let Some(error) = self.init_failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            Ok(format!("upload-{n}"))
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        _destination: &'a Destination,
        upload_id: &'a str,
        chunk_index: usize,
        data: Vec<u8>,
    ) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move {
            let _guard = InFlightGuard::enter(&self.in_flight, &self.peak_in_flight);
            self.chunk_calls.lock().unwrap().push(chunk_index);

            if let Some(gate) = &self.gate {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| TransportError::Network("gate closed".into()))?;
            }
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }

            let script = self
                .chunk_scripts
                .lock()
                .unwrap()
                .get_mut(&chunk_index)
                .and_then(VecDeque::pop_front);
            match script {
                Some(ChunkScript::Fail(error)) => return Err(error),
                Some(ChunkScript::Stall) => std::future::pending::<()>().await,
                None => {}
            }

            self.received
                .lock()
                .unwrap()
                .insert((upload_id.to_string(), chunk_index), data);
            Ok(ChunkAck::received(chunk_index))
        })
    }

    fn complete<'a>(
        &'a self,
        _destination: &'a Destination,
        request: &'a CompleteUploadRequest,
    ) -> TransportFuture<'a, String> {
        Box::pin(async move {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.complete_failure.lock().unwrap().take() {
                return Err(error);
            }
            Ok(format!("file-{}", request.upload_id))
        })
    }

    fn status<'a>(
        &'a self,
        _destination: &'a Destination,
        upload_id: &'a str,
    ) -> TransportFuture<'a, UploadStatusResponse> {
        Box::pin(async move {
            let received: Vec<usize> = self
                .received
                .lock()
                .unwrap()
                .keys()
                .filter(|(id, _)| id == upload_id)
                .map(|(_, index)| *index)
                .collect();
            Ok(UploadStatusResponse {
                upload_id: upload_id.to_string(),
                total_chunks: received.len(),
                received_chunks: received.len(),
                missing_chunks: Vec::new(),
                progress: 100.0,
            })
        })
    }

    fn abort<'a>(
        &'a self,
        _destination: &'a Destination,
        _upload_id: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.abort_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
