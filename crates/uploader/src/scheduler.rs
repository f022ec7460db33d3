//! Per-task transfer driver.
//!
//! A [`TransferScheduler`] takes one queued task through
//! `init -> chunks -> complete`, keeping at most `max_parallel_chunks`
//! chunk calls in flight and retrying each chunk independently.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use docingest_protocol::{CompleteUploadRequest, Destination, InitUploadRequest};
use docingest_transfer::{
    ByteRange, FileSource, ProgressAggregator, ProgressSnapshot, TaskEvent, TaskState, UploadTask,
};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, UploadError};
use crate::retry::{RetryError, RetryPolicy};
use crate::transport::ChunkTransport;
use crate::types::{TaskOutcome, UploadEvent};

// ---------------------------------------------------------------------------
// TaskEntry
// ---------------------------------------------------------------------------

/// Registry-owned cell around one task.
///
/// The task record is only ever mutated through [`update`](Self::update),
/// which also publishes state changes to waiters.
pub(crate) struct TaskEntry {
    task: RwLock<UploadTask>,
    state_tx: watch::Sender<TaskState>,
    cancel: CancellationToken,
}

impl TaskEntry {
    pub(crate) fn new(task: UploadTask) -> Self {
        let (state_tx, _) = watch::channel(task.state);
        Self {
            task: RwLock::new(task),
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&UploadTask) -> R) -> R {
        let task = self.task.read().unwrap_or_else(PoisonError::into_inner);
        f(&task)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut UploadTask) -> R) -> R {
        let mut task = self.task.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut task);
        let state = task.state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        out
    }

    pub(crate) fn task_id(&self) -> String {
        self.read(|t| t.task_id.clone())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// EngineContext
// ---------------------------------------------------------------------------

/// Everything a scheduler needs besides its own task.
pub(crate) struct EngineContext {
    pub(crate) transport: Arc<dyn ChunkTransport>,
    pub(crate) progress: Arc<ProgressAggregator>,
    pub(crate) events: broadcast::Sender<UploadEvent>,
    pub(crate) retry: RetryPolicy,
    pub(crate) max_parallel_chunks: usize,
    pub(crate) chunk_timeout: Duration,
    pub(crate) abort_remote_on_cancel: bool,
}

impl EngineContext {
    /// Observes the task and broadcasts the resulting snapshot.
    pub(crate) fn publish_progress(&self, entry: &TaskEntry) -> ProgressSnapshot {
        let snapshot = entry.read(|t| self.progress.observe(t));
        self.emit(UploadEvent::Progress(snapshot.clone()));
        snapshot
    }

    /// Announces the task's current state, followed by a progress snapshot.
    pub(crate) fn publish_state(&self, entry: &TaskEntry) {
        let (task_id, batch_id, state) =
            entry.read(|t| (t.task_id.clone(), t.batch_id.clone(), t.state));
        self.emit(UploadEvent::StateChanged {
            task_id,
            batch_id,
            state,
        });
        self.publish_progress(entry);
    }

    pub(crate) fn emit(&self, event: UploadEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// TransferScheduler
// ---------------------------------------------------------------------------

pub(crate) struct TransferScheduler {
    ctx: Arc<EngineContext>,
    entry: Arc<TaskEntry>,
    source: FileSource,
    cancel: CancellationToken,
}

impl TransferScheduler {
    pub(crate) fn new(ctx: Arc<EngineContext>, entry: Arc<TaskEntry>, source: FileSource) -> Self {
        let cancel = entry.cancel_token().clone();
        Self {
            ctx,
            entry,
            source,
            cancel,
        }
    }

    /// Drives the task to a terminal state and returns how it ended.
    pub(crate) async fn run(self) -> TaskOutcome {
        let (task_id, batch_id) = self.entry.read(|t| (t.task_id.clone(), t.batch_id.clone()));

        match self.drive().await {
            Ok(file_id) => {
                info!(task = %task_id, file_id = %file_id, "upload completed");
                self.ctx.emit(UploadEvent::Completed {
                    task_id,
                    batch_id,
                    file_id,
                });
            }
            Err(UploadError::Cancelled) => {
                let newly_canceled = self.entry.update(|t| {
                    t.release_in_flight();
                    t.apply(TaskEvent::Cancel)
                });
                if newly_canceled {
                    self.ctx.publish_state(&self.entry);
                    self.ctx.emit(UploadEvent::Canceled {
                        task_id: task_id.clone(),
                        batch_id,
                    });
                } else {
                    self.ctx.publish_progress(&self.entry);
                }
                info!(task = %task_id, "upload stopped after cancellation");
                self.abort_remote(&task_id).await;
            }
            Err(err) => {
                let chunk_index = err.chunk_index();
                let message = err.to_string();
                let failed = self.entry.update(|t| {
                    t.release_in_flight();
                    t.fail(chunk_index, message.clone())
                });
                if failed {
                    error!(task = %task_id, chunk = ?chunk_index, error = %message, "upload failed");
                    self.ctx.publish_state(&self.entry);
                    self.ctx.emit(UploadEvent::Failed {
                        task_id,
                        batch_id,
                        chunk_index,
                        error: message,
                    });
                }
            }
        }

        self.entry
            .read(TaskOutcome::from_task)
            .unwrap_or(TaskOutcome::Canceled)
    }

    async fn drive(&self) -> Result<String, UploadError> {
        self.advance(TaskEvent::Start)?;

        let (task_id, destination, init_request) = self.entry.read(|t| {
            let request = InitUploadRequest {
                filename: t.file_name.clone(),
                total_size: t.file_size,
                total_chunks: t.total_chunks,
                batch_id: t.batch_id.clone(),
                import_batch_id: t.import_batch_id.clone(),
                relative_path: (!t.relative_path.is_empty()).then(|| t.relative_path.clone()),
            };
            (t.task_id.clone(), t.destination.clone(), request)
        });

        let upload_id = self
            .ctx
            .retry
            .run(&self.cancel, |_| {
                self.ctx.transport.init(&destination, &init_request)
            })
            .await
            .map_err(|e| match e {
                RetryError::Cancelled => UploadError::Cancelled,
                RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => {
                    UploadError::Init(error)
                }
            })?;
        if upload_id.is_empty() {
            return Err(UploadError::Init(TransportError::InvalidResponse(
                "empty upload id".into(),
            )));
        }

        debug!(
            task = %task_id,
            upload_id = %upload_id,
            chunks = init_request.total_chunks,
            "upload session opened"
        );
        self.entry
            .update(|t| t.remote_upload_id = Some(upload_id.clone()));
        self.advance(TaskEvent::Initialized)?;

        self.upload_chunks(&destination, &upload_id).await?;
        self.advance(TaskEvent::AllChunksAcked)?;

        // Completing cannot be canceled; the call runs to its result.
        let request = CompleteUploadRequest {
            upload_id,
            batch_id: init_request.batch_id.clone(),
        };
        let file_id = self
            .ctx
            .transport
            .complete(&destination, &request)
            .await
            .map_err(UploadError::Complete)?;

        self.entry.update(|t| t.file_id = Some(file_id.clone()));
        self.advance(TaskEvent::Completed)?;
        Ok(file_id)
    }

    /// Applies a lifecycle event. A rejected transition means the task was
    /// canceled from outside.
    fn advance(&self, event: TaskEvent) -> Result<(), UploadError> {
        if self.entry.update(|t| t.apply(event)) {
            self.ctx.publish_state(&self.entry);
            Ok(())
        } else {
            Err(UploadError::Cancelled)
        }
    }

    /// Sliding window over the task's pending chunks.
    async fn upload_chunks(&self, destination: &Destination, upload_id: &str) -> Result<(), UploadError> {
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.ctx.max_parallel_chunks {
                let next = self.entry.update(|t| {
                    let index = t.next_pending()?;
                    t.mark_in_flight(index);
                    t.chunks.get(index).map(|c| (index, c.range))
                });
                let Some((index, range)) = next else {
                    break;
                };
                in_flight.push(self.send_chunk(destination, upload_id, index, range));
            }

            let Some((index, result)) = in_flight.next().await else {
                return Ok(());
            };

            match result {
                Ok(attempts) => {
                    self.entry.update(|t| t.mark_acked(index));
                    debug!(chunk = index, attempts, "chunk acknowledged");
                    self.ctx.publish_progress(&self.entry);
                }
                Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                Err(err) => {
                    self.entry
                        .update(|t| t.mark_chunk_failed(index, err.to_string()));
                    warn!(chunk = index, error = %err, "chunk failed");
                    return Err(err);
                }
            }
        }
    }

    async fn send_chunk(
        &self,
        destination: &Destination,
        upload_id: &str,
        index: usize,
        range: ByteRange,
    ) -> (usize, Result<u32, UploadError>) {
        (index, self.try_send_chunk(destination, upload_id, index, range).await)
    }

    /// Reads one range and sends it with retries. Returns the attempt count.
    async fn try_send_chunk(
        &self,
        destination: &Destination,
        upload_id: &str,
        index: usize,
        range: ByteRange,
    ) -> Result<u32, UploadError> {
        let data = self
            .source
            .read_range(range)
            .await
            .map_err(|source| UploadError::ChunkSource { index, source })?;

        let result = self
            .ctx
            .retry
            .run(&self.cancel, |_| {
                let data = data.clone();
                async move {
                    self.entry.update(|t| t.record_attempt(index));
                    let call = self
                        .ctx
                        .transport
                        .upload_chunk(destination, upload_id, index, data);
                    let outcome = match tokio::time::timeout(self.ctx.chunk_timeout, call).await {
                        Ok(Ok(ack)) if ack.confirms(index) => Ok(()),
                        Ok(Ok(ack)) => Err(TransportError::InvalidResponse(format!(
                            "chunk {index} not confirmed: {ack:?}"
                        ))),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(TransportError::Timeout),
                    };
                    if let Err(e) = &outcome {
                        self.entry.update(|t| t.note_chunk_error(index, e.to_string()));
                    }
                    outcome
                }
            })
            .await;

        match result {
            Ok(()) => Ok(self.entry.read(|t| t.chunks.get(index).map_or(0, |c| c.attempt))),
            Err(RetryError::Cancelled) => Err(UploadError::Cancelled),
            Err(
                RetryError::Fatal { attempts, error } | RetryError::Exhausted { attempts, error },
            ) => Err(UploadError::ChunkTransport {
                index,
                attempts,
                source: error,
            }),
        }
    }

    /// Best-effort cleanup of the remote session after cancellation.
    async fn abort_remote(&self, task_id: &str) {
        if !self.ctx.abort_remote_on_cancel {
            return;
        }
        let session = self.entry.read(|t| {
            t.remote_upload_id
                .clone()
                .map(|id| (t.destination.clone(), id))
        });
        let Some((destination, upload_id)) = session else {
            return;
        };

        match self.ctx.transport.abort(&destination, &upload_id).await {
            Ok(()) => debug!(task = %task_id, upload_id = %upload_id, "remote session discarded"),
            Err(e) => warn!(task = %task_id, error = %e, "failed to discard remote session"),
        }
    }
}
