//! Upload task registry.
//!
//! The registry owns every task record, hands queued tasks to schedulers
//! as active-task slots free up, and answers queries about tasks and
//! batches. Cloning an [`UploadRegistry`] yields another handle to the
//! same registry.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::{TimeDelta, Utc};
use docingest_protocol::{Destination, UploadStatusResponse};
use docingest_transfer::{
    FileSource, NewTask, ProgressAggregator, ProgressSnapshot, TaskEvent, TaskState, UploadTask,
    normalize_relative_path,
};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::error::UploadError;
use crate::scanner::scan_folder;
use crate::scheduler::{EngineContext, TaskEntry, TransferScheduler};
use crate::transport::ChunkTransport;
use crate::types::{BatchSummary, SubmitOptions, TaskOutcome, UploadEvent, UploadFile};

/// Buffered engine events per listener before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, Arc<TaskEntry>>,
    batches: HashMap<String, Vec<String>>,
    import_batches: HashMap<String, Vec<String>>,
}

struct RegistryInner {
    ctx: Arc<EngineContext>,
    config: EngineConfig,
    tables: RwLock<Tables>,
    task_slots: Arc<Semaphore>,
    runtime: Handle,
}

/// Owns upload tasks and runs them in the background.
#[derive(Clone)]
pub struct UploadRegistry {
    inner: Arc<RegistryInner>,
}

impl UploadRegistry {
    /// Creates a registry that talks to the service through `transport`.
    ///
    /// Tasks run on the Tokio runtime this is called from; use
    /// [`UploadRegistry::with_handle`] to build one outside a runtime.
    pub fn new(transport: Arc<dyn ChunkTransport>, config: EngineConfig) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current()
            .map_err(|e| ConfigError::Invalid(format!("no Tokio runtime: {e}")))?;
        Self::with_handle(transport, config, runtime)
    }

    /// Creates a registry whose tasks run on `runtime`. Submission then
    /// works from any thread.
    pub fn with_handle(
        transport: Arc<dyn ChunkTransport>,
        config: EngineConfig,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ctx = EngineContext {
            transport,
            progress: Arc::new(ProgressAggregator::new(
                Some(config.progress_window()),
                Some(config.progress_window_samples),
            )),
            events,
            retry: config.retry_policy(),
            max_parallel_chunks: config.max_parallel_chunks,
            chunk_timeout: config.chunk_timeout(),
            abort_remote_on_cancel: config.abort_remote_on_cancel,
        };

        Ok(Self {
            inner: Arc::new(RegistryInner {
                ctx: Arc::new(ctx),
                task_slots: Arc::new(Semaphore::new(config.max_active_tasks)),
                config,
                tables: RwLock::new(Tables::default()),
                runtime,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Queues one file and returns its task id immediately.
    ///
    /// A batch id is generated when `options` carries none.
    pub fn submit(
        &self,
        file: UploadFile,
        destination: Destination,
        options: SubmitOptions,
    ) -> Result<String, UploadError> {
        self.prune_history();
        let batch_id = non_empty(options.batch_id).unwrap_or_else(new_id);
        let import_batch_id = non_empty(options.import_batch_id);
        let chunk_size = options.chunk_size.unwrap_or(self.inner.config.chunk_size);

        let (task, source) = self.inner.prepare(
            file,
            &destination,
            &batch_id,
            import_batch_id.as_deref(),
            chunk_size,
        )?;
        Ok(self.enqueue(task, source))
    }

    /// Queues several files under one batch id.
    ///
    /// Every file is validated before any is queued, so an invalid file
    /// rejects the whole batch.
    pub fn submit_batch(
        &self,
        files: Vec<UploadFile>,
        destination: Destination,
        options: SubmitOptions,
    ) -> Result<Vec<String>, UploadError> {
        if files.is_empty() {
            return Err(UploadError::InvalidInput("no files to upload".into()));
        }
        self.prune_history();

        let batch_id = non_empty(options.batch_id).unwrap_or_else(new_id);
        let import_batch_id = non_empty(options.import_batch_id);
        let chunk_size = options.chunk_size.unwrap_or(self.inner.config.chunk_size);

        let prepared = files
            .into_iter()
            .map(|file| {
                self.inner.prepare(
                    file,
                    &destination,
                    &batch_id,
                    import_batch_id.as_deref(),
                    chunk_size,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(batch = %batch_id, files = prepared.len(), "batch queued");
        Ok(prepared
            .into_iter()
            .map(|(task, source)| self.enqueue(task, source))
            .collect())
    }

    /// Imports every file under `root` as one batch with a fresh import
    /// batch id.
    ///
    /// Empty and oversized files are skipped with a warning; the import
    /// fails only when nothing uploadable is left.
    ///
    /// Relative paths start with the folder's own name, e.g.
    /// `scans/2024/a.pdf` for `<root>/2024/a.pdf` when `root` is `scans`.
    pub async fn submit_folder(
        &self,
        root: &Path,
        destination: Destination,
        options: SubmitOptions,
    ) -> Result<Vec<String>, UploadError> {
        let root = tokio::fs::canonicalize(root).await?;
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UploadError::InvalidInput(format!("cannot import {}", root.display()))
            })?;

        let max_file_size = self.inner.config.max_file_size;
        let scan = tokio::task::spawn_blocking({
            let root = root.clone();
            move || scan_folder(&root, max_file_size)
        })
        .await
        .map_err(|e| UploadError::Io(std::io::Error::other(e)))??;

        for skipped in &scan.skipped {
            warn!(
                root = %root.display(),
                file = %skipped.relative_path,
                size = skipped.size,
                "skipping file: {}",
                skipped.reason
            );
        }
        if scan.files.is_empty() {
            return Err(UploadError::InvalidInput(format!(
                "folder contains no uploadable files: {}",
                root.display()
            )));
        }
        debug!(
            root = %root.display(),
            files = scan.files.len(),
            skipped = scan.skipped.len(),
            total_bytes = scan.total_size,
            "folder scanned"
        );

        let files = scan
            .files
            .into_iter()
            .map(|f| {
                let name = f
                    .relative_path
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                UploadFile {
                    name,
                    size: f.size,
                    source: FileSource::from_path(&f.path),
                    relative_path: format!("{root_name}/{}", f.relative_path),
                }
            })
            .collect();

        let options = SubmitOptions {
            import_batch_id: Some(non_empty(options.import_batch_id).unwrap_or_else(new_id)),
            ..options
        };
        self.submit_batch(files, destination, options)
    }

    fn enqueue(&self, task: UploadTask, source: FileSource) -> String {
        let task_id = task.task_id.clone();
        info!(
            task = %task_id,
            batch = %task.batch_id,
            file = %task.file_name,
            size = task.file_size,
            chunks = task.total_chunks,
            destination = %task.destination,
            "upload queued"
        );

        let batch_id = task.batch_id.clone();
        let import_batch_id = task.import_batch_id.clone();
        let entry = Arc::new(TaskEntry::new(task));
        {
            let mut tables = self.inner.write_tables();
            tables
                .batches
                .entry(batch_id)
                .or_default()
                .push(task_id.clone());
            if let Some(import_batch_id) = import_batch_id {
                tables
                    .import_batches
                    .entry(import_batch_id)
                    .or_default()
                    .push(task_id.clone());
            }
            tables.tasks.insert(task_id.clone(), entry.clone());
        }
        self.inner.ctx.publish_state(&entry);

        let inner = self.inner.clone();
        self.inner
            .runtime
            .spawn(async move { inner.run_task(entry, source).await });
        task_id
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancels a task. Returns `false` for unknown tasks and for tasks that
    /// are already finished or completing.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.inner
            .entry(task_id)
            .is_some_and(|entry| self.inner.cancel_entry(&entry))
    }

    /// Cancels every unfinished task of a batch and returns how many were
    /// canceled.
    pub fn cancel_batch(&self, batch_id: &str) -> usize {
        self.inner
            .batch_entries(batch_id, false)
            .iter()
            .filter(|entry| self.inner.cancel_entry(entry))
            .count()
    }

    /// Cancels every unfinished task.
    pub fn cancel_all(&self) -> usize {
        self.inner
            .entries()
            .iter()
            .filter(|entry| self.inner.cancel_entry(entry))
            .count()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// A copy of the task record.
    pub fn get(&self, task_id: &str) -> Option<UploadTask> {
        self.inner.entry(task_id).map(|e| e.read(UploadTask::clone))
    }

    /// Every known task, oldest first.
    pub fn tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self
            .inner
            .entries()
            .iter()
            .map(|e| e.read(UploadTask::clone))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Progress of every unfinished task, oldest first.
    pub fn list_active(&self) -> Vec<ProgressSnapshot> {
        let mut active: Vec<_> = self
            .inner
            .entries()
            .iter()
            .filter_map(|e| {
                e.read(|t| {
                    t.state
                        .is_active()
                        .then(|| (t.created_at, self.inner.current_snapshot(t)))
                })
            })
            .collect();
        active.sort_by_key(|(created_at, _)| *created_at);
        active.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Current progress of one task.
    pub fn snapshot(&self, task_id: &str) -> Option<ProgressSnapshot> {
        self.inner
            .entry(task_id)
            .map(|e| e.read(|t| self.inner.current_snapshot(t)))
    }

    /// Streams progress snapshots of one task.
    pub fn subscribe(&self, task_id: &str) -> Option<broadcast::Receiver<ProgressSnapshot>> {
        self.inner.ctx.progress.subscribe(task_id)
    }

    /// Streams engine events for every task.
    pub fn events(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// Waits for a task to finish. `None` for unknown tasks.
    pub async fn wait(&self, task_id: &str) -> Option<TaskOutcome> {
        let entry = self.inner.entry(task_id)?;
        let mut state = entry.watch_state();
        // The sender lives in `entry`, which is held here.
        let _ = state.wait_for(|s| s.is_terminal()).await;
        entry.read(TaskOutcome::from_task)
    }

    /// Waits for every task of a batch to finish.
    pub async fn wait_batch(&self, batch_id: &str) -> Vec<(String, TaskOutcome)> {
        let mut outcomes = Vec::new();
        for entry in self.inner.batch_entries(batch_id, false) {
            let task_id = entry.task_id();
            if let Some(outcome) = self.wait(&task_id).await {
                outcomes.push((task_id, outcome));
            }
        }
        outcomes
    }

    pub fn batch_summary(&self, batch_id: &str) -> Option<BatchSummary> {
        self.inner.summarize(batch_id, false)
    }

    pub fn import_batch_summary(&self, import_batch_id: &str) -> Option<BatchSummary> {
        self.inner.summarize(import_batch_id, true)
    }

    /// Asks the server which chunks of a task's session it holds.
    pub async fn remote_status(&self, task_id: &str) -> Result<UploadStatusResponse, UploadError> {
        let entry = self
            .inner
            .entry(task_id)
            .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
        let (destination, upload_id) =
            entry.read(|t| (t.destination.clone(), t.remote_upload_id.clone()));
        let upload_id = upload_id.ok_or_else(|| UploadError::NoRemoteSession(task_id.to_string()))?;

        Ok(self
            .inner
            .ctx
            .transport
            .status(&destination, &upload_id)
            .await?)
    }

    /// Forgets finished tasks older than the history TTL. Returns how many
    /// were removed.
    pub fn prune_history(&self) -> usize {
        let Ok(ttl) = TimeDelta::from_std(self.inner.config.history_ttl()) else {
            return 0;
        };
        let now = Utc::now();

        let expired: HashSet<String> = {
            let mut guard = self.inner.write_tables();
            let tables = &mut *guard;
            let expired: HashSet<String> = tables
                .tasks
                .iter()
                .filter(|(_, e)| e.read(|t| t.finished_at.is_some_and(|at| now - at >= ttl)))
                .map(|(id, _)| id.clone())
                .collect();
            if expired.is_empty() {
                return 0;
            }

            tables.tasks.retain(|id, _| !expired.contains(id));
            for index in [&mut tables.batches, &mut tables.import_batches] {
                for ids in index.values_mut() {
                    ids.retain(|id| !expired.contains(id));
                }
                index.retain(|_, ids| !ids.is_empty());
            }
            expired
        };

        for id in &expired {
            self.inner.ctx.progress.remove(id);
        }
        debug!(removed = expired.len(), "pruned finished tasks");
        expired.len()
    }

    /// Number of tasks held, finished ones included.
    pub fn len(&self) -> usize {
        self.inner.read_tables().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryInner {
    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        self.read_tables().tasks.get(task_id).cloned()
    }

    fn entries(&self) -> Vec<Arc<TaskEntry>> {
        self.read_tables().tasks.values().cloned().collect()
    }

    fn batch_entries(&self, id: &str, import: bool) -> Vec<Arc<TaskEntry>> {
        let tables = self.read_tables();
        let index = if import {
            &tables.import_batches
        } else {
            &tables.batches
        };
        index
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|task_id| tables.tasks.get(task_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn summarize(&self, id: &str, import: bool) -> Option<BatchSummary> {
        let entries = self.batch_entries(id, import);
        if entries.is_empty() {
            return None;
        }
        let mut summary = BatchSummary {
            id: id.to_string(),
            ..BatchSummary::default()
        };
        for entry in &entries {
            entry.read(|t| summary.add(t));
        }
        Some(summary)
    }

    /// Validates a file and builds its queued task.
    fn prepare(
        &self,
        file: UploadFile,
        destination: &Destination,
        batch_id: &str,
        import_batch_id: Option<&str>,
        chunk_size: u64,
    ) -> Result<(UploadTask, FileSource), UploadError> {
        if file.name.trim().is_empty() {
            return Err(UploadError::InvalidInput("file name is empty".into()));
        }
        if destination.id().is_empty() {
            return Err(UploadError::InvalidInput("destination id is empty".into()));
        }
        if file.size == 0 {
            return Err(UploadError::InvalidInput(format!("{} is empty", file.name)));
        }
        if file.size > self.config.max_file_size {
            return Err(UploadError::InvalidInput(format!(
                "{} is {} bytes, the limit is {} bytes",
                file.name, file.size, self.config.max_file_size
            )));
        }
        let relative_path = normalize_relative_path(&file.relative_path)?;

        let task = UploadTask::new(NewTask {
            task_id: new_id(),
            batch_id: batch_id.to_string(),
            import_batch_id: import_batch_id.map(str::to_string),
            destination: destination.clone(),
            file_name: file.name,
            file_size: file.size,
            relative_path,
            chunk_size,
        })?;
        Ok((task, file.source))
    }

    /// Waits for an active-task slot, then drives the task.
    async fn run_task(self: Arc<Self>, entry: Arc<TaskEntry>, source: FileSource) {
        let permit = tokio::select! {
            biased;
            _ = entry.cancel_token().cancelled() => None,
            permit = self.task_slots.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            debug!(task = %entry.task_id(), "task canceled while queued");
            return;
        };

        TransferScheduler::new(self.ctx.clone(), entry, source)
            .run()
            .await;
    }

    fn cancel_entry(&self, entry: &TaskEntry) -> bool {
        if !entry.update(|t| t.apply(TaskEvent::Cancel)) {
            return false;
        }
        entry.cancel_token().cancel();

        let (task_id, batch_id) = entry.read(|t| (t.task_id.clone(), t.batch_id.clone()));
        info!(task = %task_id, "upload canceled");
        self.ctx.publish_state(entry);
        self.ctx.emit(UploadEvent::Canceled { task_id, batch_id });
        true
    }

    /// Rebuilds a task's snapshot from its chunk table, with the speed
    /// measured over the window ending now.
    fn current_snapshot(&self, task: &UploadTask) -> ProgressSnapshot {
        let transferring = matches!(task.state, TaskState::Uploading | TaskState::Completing);
        let speed = if transferring {
            self.ctx.progress.speed_at(&task.task_id, Instant::now())
        } else {
            0.0
        };
        ProgressSnapshot::from_task(task, speed)
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
