use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{TaskError, TaskState, UploadTask};

/// Default trailing window for speed calculation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default maximum number of retained samples.
const DEFAULT_MAX_SAMPLES: usize = 10;

/// Buffered snapshots per subscriber before the slowest one starts lagging.
const SUBSCRIBER_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    /// Cumulative acknowledged bytes at `timestamp`.
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed over a trailing window of cumulative samples.
///
/// The window is bounded both by age and by sample count, whichever keeps
/// fewer samples. Speed is the byte delta across the window divided by the
/// time from its oldest sample to the moment of the query, which smooths out
/// bursts of chunk acknowledgments landing together.
#[derive(Debug, Clone)]
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: maximum sample age (default 5 s).
    /// - `max_samples`: maximum retained samples (default 10).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
            window_size: window_size.unwrap_or(DEFAULT_WINDOW),
        }
    }

    /// Records the cumulative byte count at the current instant.
    pub fn add_sample(&mut self, bytes_completed: u64) {
        self.add_sample_at(bytes_completed, Instant::now());
    }

    /// Records the cumulative byte count at `now` and drops samples that
    /// fell out of the window.
    pub fn add_sample_at(&mut self, bytes_completed: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            bytes: bytes_completed,
            timestamp: now,
        });
        self.prune(now);
    }

    /// Drops samples older than the window as of `now`, then trims to the
    /// sample cap.
    pub fn prune(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.window_size) {
            while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Returns the speed in bytes/second over the window ending at `now`.
    ///
    /// Only samples inside the window count. With fewer than 2 of them the
    /// speed is 0.0. The rate is measured up to `now`, so it decays while no
    /// new bytes arrive.
    pub fn bytes_per_second(&self, now: Instant) -> f64 {
        let cutoff = now.checked_sub(self.window_size);
        let mut recent = self
            .samples
            .iter()
            .filter(|s| cutoff.is_none_or(|c| s.timestamp >= c) && s.timestamp <= now);

        let Some(first) = recent.next() else {
            return 0.0;
        };
        let Some(last) = recent.last() else {
            return 0.0;
        };

        let elapsed = now.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        last.bytes.saturating_sub(first.bytes) as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes` as of `now`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64, now: Instant) -> Option<Duration> {
        let speed = self.bytes_per_second(now);
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// ProgressSnapshot
// ---------------------------------------------------------------------------

/// Derived view of a task's progress. Rebuilt from chunk state on every
/// observation; never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: String,
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_batch_id: Option<String>,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relative_path: String,
    pub state: TaskState,
    pub bytes_completed: u64,
    pub file_size: u64,
    /// 0–100.
    pub percentage: f64,
    pub upload_speed_bps: f64,
    /// Withheld while the speed is unknown or zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub chunks_acked: usize,
    pub total_chunks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl ProgressSnapshot {
    /// Builds a snapshot from the task's chunk table and a measured speed.
    pub fn from_task(task: &UploadTask, upload_speed_bps: f64) -> Self {
        let bytes_completed = task.bytes_completed();
        let percentage = if task.file_size == 0 {
            0.0
        } else {
            bytes_completed as f64 / task.file_size as f64 * 100.0
        };
        let eta_seconds = (upload_speed_bps > 0.0)
            .then(|| task.file_size.saturating_sub(bytes_completed) as f64 / upload_speed_bps);

        Self {
            task_id: task.task_id.clone(),
            batch_id: task.batch_id.clone(),
            import_batch_id: task.import_batch_id.clone(),
            file_name: task.file_name.clone(),
            relative_path: task.relative_path.clone(),
            state: task.state,
            bytes_completed,
            file_size: task.file_size,
            percentage,
            upload_speed_bps,
            eta_seconds,
            chunks_acked: task.acked_count(),
            total_chunks: task.total_chunks,
            error: task.error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressAggregator
// ---------------------------------------------------------------------------

struct TaskProgress {
    speed: SpeedCalculator,
    last_bytes: Option<u64>,
    latest: ProgressSnapshot,
    tx: broadcast::Sender<ProgressSnapshot>,
}

/// Turns task observations into progress snapshots.
///
/// Keeps one speed window per task, exposes the latest snapshot for polling
/// and publishes every new snapshot to that task's subscribers.
pub struct ProgressAggregator {
    inner: RwLock<HashMap<String, TaskProgress>>,
    window_size: Duration,
    max_samples: usize,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ProgressAggregator {
    /// Creates an aggregator whose speed windows use the given bounds
    /// (defaults: 5 s, 10 samples).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            window_size: window_size.unwrap_or(DEFAULT_WINDOW),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES),
        }
    }

    /// Observes the task's current state and publishes a fresh snapshot.
    pub fn observe(&self, task: &UploadTask) -> ProgressSnapshot {
        self.observe_at(task, Instant::now())
    }

    /// Like [`observe`](Self::observe) with an explicit sample time.
    pub fn observe_at(&self, task: &UploadTask, now: Instant) -> ProgressSnapshot {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let entry = inner.entry(task.task_id.clone()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
            TaskProgress {
                speed: SpeedCalculator::new(Some(self.window_size), Some(self.max_samples)),
                last_bytes: None,
                latest: ProgressSnapshot::from_task(task, 0.0),
                tx,
            }
        });

        let bytes = task.bytes_completed();
        let transferring = matches!(task.state, TaskState::Uploading | TaskState::Completing);
        if transferring && entry.last_bytes != Some(bytes) {
            entry.speed.add_sample_at(bytes, now);
            entry.last_bytes = Some(bytes);
        } else {
            entry.speed.prune(now);
        }

        let speed = if transferring {
            entry.speed.bytes_per_second(now)
        } else {
            0.0
        };
        let snapshot = ProgressSnapshot::from_task(task, speed);
        entry.latest = snapshot.clone();
        // No receivers is fine: polling still works.
        let _ = entry.tx.send(snapshot.clone());
        snapshot
    }

    /// Speed of a task over the window ending at `now`; 0.0 for untracked
    /// tasks.
    pub fn speed_at(&self, task_id: &str, now: Instant) -> f64 {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(task_id)
            .map_or(0.0, |p| p.speed.bytes_per_second(now))
    }

    /// Latest published snapshot for a task.
    pub fn snapshot(&self, task_id: &str) -> Option<ProgressSnapshot> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.get(task_id).map(|p| p.latest.clone())
    }

    /// Subscribes to future snapshots of a task that has been observed at
    /// least once.
    pub fn subscribe(&self, task_id: &str) -> Option<broadcast::Receiver<ProgressSnapshot>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.get(task_id).map(|p| p.tx.subscribe())
    }

    /// Stops tracking a task. Its subscribers see the channel close.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.remove(task_id).is_some()
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewTask, TaskEvent};
    use docingest_protocol::Destination;

    fn uploading_task(file_size: u64, chunk_size: u64) -> UploadTask {
        let mut task = UploadTask::new(NewTask {
            task_id: "t1".into(),
            batch_id: "b1".into(),
            import_batch_id: None,
            destination: Destination::Project("p1".into()),
            file_name: "scan.pdf".into(),
            file_size,
            relative_path: String::new(),
            chunk_size,
        })
        .unwrap();
        task.apply(TaskEvent::Start);
        task.apply(TaskEvent::Initialized);
        task
    }

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(Instant::now()), 0.0);
        assert!(calc.eta(1000, Instant::now()).is_none());
    }

    #[test]
    fn speed_calculator_single_sample() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample_at(100, t0);
        assert_eq!(calc.bytes_per_second(t0 + Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn speed_is_delta_over_window() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(1_000, t0 + Duration::from_secs(1));
        calc.add_sample_at(4_000, t0 + Duration::from_secs(2));

        let now = t0 + Duration::from_secs(2);
        assert_eq!(calc.bytes_per_second(now), 2_000.0);
        assert_eq!(calc.eta(10_000, now), Some(Duration::from_secs(5)));
    }

    #[test]
    fn old_samples_leave_the_window() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(5)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(100, t0 + Duration::from_secs(1));
        calc.add_sample_at(200, t0 + Duration::from_secs(2));
        // The window now starts at t=1; the burst is measured against it.
        calc.add_sample_at(1_200, t0 + Duration::from_secs(6));

        assert_eq!(calc.len(), 3);
        assert_eq!(calc.bytes_per_second(t0 + Duration::from_secs(6)), 220.0);
    }

    #[test]
    fn samples_further_apart_than_the_window_give_no_speed() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(5)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(1_000, t0 + Duration::from_secs(30));

        assert_eq!(calc.len(), 1);
        let now = t0 + Duration::from_secs(30);
        assert_eq!(calc.bytes_per_second(now), 0.0);
        assert!(calc.eta(1_000, now).is_none());
    }

    #[test]
    fn speed_decays_while_stalled() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(5)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(1_000, t0 + Duration::from_secs(1));

        assert_eq!(calc.bytes_per_second(t0 + Duration::from_secs(1)), 1_000.0);
        assert_eq!(calc.bytes_per_second(t0 + Duration::from_secs(4)), 250.0);
        // t0 has left the window; one sample is not a rate.
        assert_eq!(calc.bytes_per_second(t0 + Duration::from_secs(6)), 0.0);
    }

    #[test]
    fn sample_count_is_capped() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        let t0 = Instant::now();
        for i in 0..20u64 {
            calc.add_sample_at(i * 10, t0 + Duration::from_millis(i * 10));
        }
        assert_eq!(calc.len(), 5);
    }

    #[test]
    fn speed_calculator_reset() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(200, t0 + Duration::from_secs(1));
        calc.reset();
        assert!(calc.is_empty());
        assert_eq!(calc.bytes_per_second(t0 + Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn snapshot_percentage_and_eta() {
        let mut task = uploading_task(100, 25);
        task.mark_acked(0);
        task.mark_acked(3);

        let snap = ProgressSnapshot::from_task(&task, 10.0);
        assert_eq!(snap.bytes_completed, 50);
        assert_eq!(snap.percentage, 50.0);
        assert_eq!(snap.eta_seconds, Some(5.0));
        assert_eq!(snap.chunks_acked, 2);
        assert_eq!(snap.total_chunks, 4);

        let unknown = ProgressSnapshot::from_task(&task, 0.0);
        assert_eq!(unknown.eta_seconds, None);
    }

    #[test]
    fn aggregator_tracks_speed_across_acks() {
        let agg = ProgressAggregator::default();
        let mut task = uploading_task(100, 25);
        let t0 = Instant::now();

        let first = agg.observe_at(&task, t0);
        assert_eq!(first.upload_speed_bps, 0.0);
        assert_eq!(first.eta_seconds, None);

        task.mark_acked(0);
        let second = agg.observe_at(&task, t0 + Duration::from_secs(1));
        assert_eq!(second.upload_speed_bps, 25.0);
        assert_eq!(second.eta_seconds, Some(3.0));

        assert_eq!(agg.snapshot("t1"), Some(second));
    }

    #[test]
    fn stalled_upload_withholds_eta() {
        let agg = ProgressAggregator::default();
        let mut task = uploading_task(4_000, 1_000);
        let t0 = Instant::now();

        agg.observe_at(&task, t0);
        task.mark_acked(0);
        let moving = agg.observe_at(&task, t0 + Duration::from_secs(1));
        assert_eq!(moving.upload_speed_bps, 1_000.0);
        assert_eq!(moving.eta_seconds, Some(3.0));

        // No acknowledgments for a minute.
        let stalled = agg.observe_at(&task, t0 + Duration::from_secs(61));
        assert_eq!(stalled.upload_speed_bps, 0.0);
        assert_eq!(stalled.eta_seconds, None);
        assert_eq!(agg.speed_at("t1", t0 + Duration::from_secs(61)), 0.0);
        assert_eq!(agg.speed_at("unknown", t0), 0.0);
    }

    #[test]
    fn aggregator_reports_no_speed_outside_transfer() {
        let agg = ProgressAggregator::default();
        let mut task = uploading_task(100, 50);
        let t0 = Instant::now();
        agg.observe_at(&task, t0);
        task.mark_acked(0);
        task.mark_acked(1);
        agg.observe_at(&task, t0 + Duration::from_secs(1));

        task.apply(TaskEvent::AllChunksAcked);
        task.apply(TaskEvent::Completed);
        let done = agg.observe_at(&task, t0 + Duration::from_secs(2));
        assert_eq!(done.state, TaskState::Done);
        assert_eq!(done.percentage, 100.0);
        assert_eq!(done.upload_speed_bps, 0.0);
    }

    #[tokio::test]
    async fn aggregator_publishes_to_subscribers() {
        let agg = ProgressAggregator::default();
        let mut task = uploading_task(10, 5);
        assert!(agg.subscribe("t1").is_none());

        agg.observe(&task);
        let mut rx = agg.subscribe("t1").unwrap();

        task.mark_acked(1);
        agg.observe(&task);
        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.bytes_completed, 5);

        assert!(agg.remove("t1"));
        assert!(rx.recv().await.is_err());
        assert!(agg.is_empty());
    }
}
