use chrono::{DateTime, Utc};
use docingest_protocol::Destination;
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::chunked::{ByteRange, plan};

/// Lifecycle state of one file's transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Initializing,
    Uploading,
    Completing,
    Done,
    Failed,
    Canceled,
}

impl TaskState {
    /// `Done`, `Failed` and `Canceled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Input to the task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// The scheduler picked the task up and is calling `init`.
    Start,
    /// `init` returned a remote upload id.
    Initialized,
    /// Every chunk is acknowledged.
    AllChunksAcked,
    /// `complete` returned the final resource id.
    Completed,
    /// An unrecoverable error in init, a chunk, or complete.
    Fail,
    /// External cancellation request.
    Cancel,
}

/// Pure transition function of the task state machine.
///
/// ```text
/// Queued -> Initializing -> Uploading -> Completing -> Done
///                |              |            |
///                v              v            v
///             Failed         Failed       Failed
/// Queued/Initializing/Uploading -> Canceled
/// ```
///
/// Returns `None` for every transition not drawn above, including any
/// transition out of a terminal state. Chunk retries happen inside
/// `Uploading` and never produce an event.
pub fn transition(state: TaskState, event: TaskEvent) -> Option<TaskState> {
    use TaskEvent as E;
    use TaskState as S;

    match (state, event) {
        (S::Queued, E::Start) => Some(S::Initializing),
        (S::Initializing, E::Initialized) => Some(S::Uploading),
        (S::Uploading, E::AllChunksAcked) => Some(S::Completing),
        (S::Completing, E::Completed) => Some(S::Done),
        (S::Initializing | S::Uploading | S::Completing, E::Fail) => Some(S::Failed),
        (S::Queued | S::Initializing | S::Uploading, E::Cancel) => Some(S::Canceled),
        _ => None,
    }
}

/// Status of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Acked,
    Failed,
}

/// One byte range of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub range: ByteRange,
    pub status: ChunkStatus,
    /// Transmission attempts made so far.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Task-level failure, as shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// The chunk that failed, if the failure came from a chunk upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    pub message: String,
}

/// Parameters for [`UploadTask::new`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub batch_id: String,
    pub import_batch_id: Option<String>,
    pub destination: Destination,
    pub file_name: String,
    pub file_size: u64,
    pub relative_path: String,
    pub chunk_size: u64,
}

/// One file's chunked transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub task_id: String,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_batch_id: Option<String>,
    pub destination: Destination,
    pub file_name: String,
    pub file_size: u64,
    /// Folder-relative path; empty for flat uploads.
    #[serde(default)]
    pub relative_path: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub chunks: Vec<ChunkRecord>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_upload_id: Option<String>,
    /// Final resource id returned by `complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl UploadTask {
    /// Creates a queued task with its chunk plan.
    pub fn new(params: NewTask) -> Result<Self, TransferError> {
        let ranges = plan(params.file_size, params.chunk_size)?;
        let chunks: Vec<ChunkRecord> = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| ChunkRecord {
                index,
                range,
                status: ChunkStatus::Pending,
                attempt: 0,
                last_error: None,
            })
            .collect();

        Ok(Self {
            task_id: params.task_id,
            batch_id: params.batch_id,
            import_batch_id: params.import_batch_id,
            destination: params.destination,
            file_name: params.file_name,
            file_size: params.file_size,
            relative_path: params.relative_path,
            chunk_size: params.chunk_size,
            total_chunks: chunks.len(),
            chunks,
            state: TaskState::Queued,
            remote_upload_id: None,
            file_id: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        })
    }

    /// Applies `event` to the task state.
    ///
    /// Returns `false` (and changes nothing) when the transition is not
    /// allowed, which covers every attempt to leave a terminal state.
    pub fn apply(&mut self, event: TaskEvent) -> bool {
        match transition(self.state, event) {
            Some(next) => {
                self.state = next;
                if next.is_terminal() {
                    self.finished_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    /// Moves the task to `Failed` and records why.
    pub fn fail(&mut self, chunk_index: Option<usize>, message: impl Into<String>) -> bool {
        if !self.apply(TaskEvent::Fail) {
            return false;
        }
        self.error = Some(TaskError {
            chunk_index,
            message: message.into(),
        });
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Index of the lowest-numbered pending chunk.
    pub fn next_pending(&self) -> Option<usize> {
        self.chunks
            .iter()
            .find(|c| c.status == ChunkStatus::Pending)
            .map(|c| c.index)
    }

    pub fn mark_in_flight(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::InFlight;
        }
    }

    /// Counts one more transmission attempt and returns the new total.
    pub fn record_attempt(&mut self, index: usize) -> u32 {
        match self.chunks.get_mut(index) {
            Some(chunk) => {
                chunk.attempt += 1;
                chunk.attempt
            }
            None => 0,
        }
    }

    /// Records a transient error on a chunk that will be retried.
    pub fn note_chunk_error(&mut self, index: usize, error: impl Into<String>) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.last_error = Some(error.into());
        }
    }

    /// Marks a chunk as confirmed by the remote side.
    pub fn mark_acked(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Acked;
        }
    }

    pub fn mark_chunk_failed(&mut self, index: usize, error: impl Into<String>) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.status = ChunkStatus::Failed;
            chunk.last_error = Some(error.into());
        }
    }

    /// Returns aborted in-flight chunks to `Pending`. Acknowledged chunks stay acknowledged.
    pub fn release_in_flight(&mut self) {
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::InFlight {
                chunk.status = ChunkStatus::Pending;
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.count(ChunkStatus::InFlight)
    }

    pub fn acked_count(&self) -> usize {
        self.count(ChunkStatus::Acked)
    }

    pub fn all_acked(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Acked)
    }

    /// Sum of the sizes of acknowledged chunks.
    pub fn bytes_completed(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Acked)
            .map(|c| c.range.len())
            .sum()
    }

    fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.iter().filter(|c| c.status == status).count()
    }
}
