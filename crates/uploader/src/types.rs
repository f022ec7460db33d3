//! Shared types for the upload engine.

use std::path::Path;

use docingest_transfer::{FileSource, ProgressSnapshot, TaskState, UploadTask};
use serde::{Deserialize, Serialize};

use crate::error::UploadError;

/// A file handed to the engine.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// File name sent as `filename` on init.
    pub name: String,
    pub size: u64,
    pub source: FileSource,
    /// Folder-relative path; empty for flat uploads.
    pub relative_path: String,
}

impl UploadFile {
    /// Describes a file on disk. Its bytes are read chunk by chunk later.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::InvalidInput(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UploadError::InvalidInput(format!("path has no file name: {}", path.display()))
            })?;

        Ok(Self {
            name,
            size: metadata.len(),
            source: FileSource::from_path(path),
            relative_path: String::new(),
        })
    }

    /// Wraps an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::from_bytes(data),
            relative_path: String::new(),
        }
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }
}

/// Grouping and tuning for a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Shared by every file of one user action. Generated when absent or empty.
    pub batch_id: Option<String>,
    /// Set for folder imports.
    pub import_batch_id: Option<String>,
    /// Overrides the configured chunk size for this submission.
    pub chunk_size: Option<u64>,
}

impl SubmitOptions {
    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn with_import_batch_id(mut self, import_batch_id: impl Into<String>) -> Self {
        self.import_batch_id = Some(import_batch_id.into());
        self
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Done {
        file_id: String,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_index: Option<usize>,
        message: String,
    },
    Canceled,
}

impl TaskOutcome {
    /// Reads the outcome of a terminal task. `None` while it is still running.
    pub fn from_task(task: &UploadTask) -> Option<Self> {
        match task.state {
            TaskState::Done => Some(Self::Done {
                file_id: task.file_id.clone().unwrap_or_default(),
            }),
            TaskState::Failed => {
                let (chunk_index, message) = task
                    .error
                    .as_ref()
                    .map(|e| (e.chunk_index, e.message.clone()))
                    .unwrap_or_default();
                Some(Self::Failed {
                    chunk_index,
                    message,
                })
            }
            TaskState::Canceled => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Engine events broadcast to every listener.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// A task moved through its state machine.
    StateChanged {
        task_id: String,
        batch_id: String,
        state: TaskState,
    },
    /// Fresh progress after a chunk acknowledgment or state change.
    Progress(ProgressSnapshot),
    Completed {
        task_id: String,
        batch_id: String,
        file_id: String,
    },
    Failed {
        task_id: String,
        batch_id: String,
        chunk_index: Option<usize>,
        error: String,
    },
    Canceled {
        task_id: String,
        batch_id: String,
    },
}

impl UploadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::StateChanged { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Canceled { task_id, .. } => task_id,
            Self::Progress(snapshot) => &snapshot.task_id,
        }
    }
}

/// Aggregate state of a batch or import batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub id: String,
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
    pub bytes_completed: u64,
    pub total_bytes: u64,
}

impl BatchSummary {
    pub(crate) fn add(&mut self, task: &UploadTask) {
        self.total += 1;
        self.bytes_completed += task.bytes_completed();
        self.total_bytes += task.file_size;
        match task.state {
            TaskState::Queued => self.queued += 1,
            TaskState::Initializing | TaskState::Uploading | TaskState::Completing => {
                self.active += 1
            }
            TaskState::Done => self.done += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Canceled => self.canceled += 1,
        }
    }

    /// Every task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.queued == 0 && self.active == 0
    }

    /// Every task finished successfully.
    pub fn is_success(&self) -> bool {
        self.total > 0 && self.done == self.total
    }

    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_completed as f64 / self.total_bytes as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docingest_protocol::Destination;
    use docingest_transfer::{NewTask, TaskEvent};

    fn task(id: &str, size: u64) -> UploadTask {
        UploadTask::new(NewTask {
            task_id: id.into(),
            batch_id: "b1".into(),
            import_batch_id: None,
            destination: Destination::Project("p1".into()),
            file_name: format!("{id}.pdf"),
            file_size: size,
            relative_path: String::new(),
            chunk_size: 4,
        })
        .unwrap()
    }

    #[test]
    fn outcome_of_running_task_is_none() {
        let mut t = task("t1", 8);
        assert_eq!(TaskOutcome::from_task(&t), None);
        t.apply(TaskEvent::Start);
        assert_eq!(TaskOutcome::from_task(&t), None);
    }

    #[test]
    fn outcome_of_failed_task_carries_chunk() {
        let mut t = task("t1", 8);
        t.apply(TaskEvent::Start);
        t.apply(TaskEvent::Initialized);
        t.fail(Some(1), "HTTP 400: bad chunk");
        assert_eq!(
            TaskOutcome::from_task(&t),
            Some(TaskOutcome::Failed {
                chunk_index: Some(1),
                message: "HTTP 400: bad chunk".into(),
            })
        );
    }

    #[test]
    fn summary_counts_states_and_bytes() {
        let queued = task("a", 8);

        let mut done = task("b", 4);
        done.apply(TaskEvent::Start);
        done.apply(TaskEvent::Initialized);
        done.mark_acked(0);
        done.apply(TaskEvent::AllChunksAcked);
        done.apply(TaskEvent::Completed);

        let mut canceled = task("c", 4);
        canceled.apply(TaskEvent::Cancel);

        let mut summary = BatchSummary::default();
        for t in [&queued, &done, &canceled] {
            summary.add(t);
        }
        assert_eq!(summary.total, 3);
        assert_eq!((summary.queued, summary.done, summary.canceled), (1, 1, 1));
        assert_eq!(summary.bytes_completed, 4);
        assert_eq!(summary.total_bytes, 16);
        assert_eq!(summary.percentage(), 25.0);
        assert!(!summary.is_finished());
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn upload_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        let file = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "scan.pdf");
        assert_eq!(file.size, 8);
        assert!(file.relative_path.is_empty());

        assert!(matches!(
            UploadFile::from_path(dir.path()).await,
            Err(UploadError::InvalidInput(_))
        ));
    }
}
