//! Upload queue, task lifecycle and session accounting.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_PAUSE_THRESHOLD, TaskId, TaskOutcome, TaskSource, TaskState, UploadError,
    UploadResult, UploadStats, UploadTask,
};

/// Session lifecycle as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    CompletedWithFailures,
}

impl SessionStatus {
    fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// What a report did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Failed with retries left; back in the queue.
    Requeued { retry_count: u32 },
    /// Reached a terminal state.
    Finalized(TaskState),
    /// The task was not in progress; nothing changed.
    Ignored,
}

/// Events emitted by the manager, in transition order.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Log(String),
    Started(UploadTask),
    Progress {
        task: TaskId,
        source: PathBuf,
        fraction: f64,
    },
    Requeued {
        task: UploadTask,
        error: String,
    },
    Completed {
        task: UploadTask,
        result: UploadResult,
    },
    Stats(UploadStats),
    OverallProgress(f64),
    SessionEnded(UploadResult),
}

struct InFlight {
    task: UploadTask,
    bytes: u64,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<UploadTask>,
    in_flight: HashMap<TaskId, InFlight>,
    failed_tasks: Vec<UploadTask>,
    result: UploadResult,
    status: SessionStatus,
    consecutive_failures: u32,
}

impl Inner {
    fn contains(&self, id: TaskId) -> bool {
        self.in_flight.contains_key(&id) || self.queue.iter().any(|t| t.id() == id)
    }

    /// Insert at the tail of the task's priority band.
    fn enqueue(&mut self, task: UploadTask) {
        let pos = self
            .queue
            .iter()
            .position(|queued| queued.priority() < task.priority())
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, task);
    }

    fn stats(&self) -> UploadStats {
        UploadStats::snapshot(&self.result, self.queue.len(), self.in_flight.len())
    }
}

/// Transport-agnostic upload queue.
///
/// All operations take one internal lock, so a manager can be shared by
/// several workers behind an `Arc`.
pub struct UploadManager {
    inner: Mutex<Inner>,
    pause_threshold: u32,
    events_tx: mpsc::UnboundedSender<UploadEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<UploadEvent>>,
}

impl Default for UploadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadManager {
    pub fn new() -> Self {
        Self::with_pause_threshold(DEFAULT_PAUSE_THRESHOLD)
    }

    pub fn with_pause_threshold(pause_threshold: u32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(Inner::default()),
            pause_threshold,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events_rx.take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: UploadEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_stats(&self, stats: UploadStats) {
        self.emit(UploadEvent::Stats(stats));
        self.emit(UploadEvent::OverallProgress(stats.progress()));
    }

    /// Appends a task in `Pending`. Returns its id.
    ///
    /// Never touches the filesystem; byte totals come from
    /// [`UploadTask::with_size`].
    pub fn add_task(&self, mut task: UploadTask) -> Result<TaskId, UploadError> {
        if task.source_path().as_os_str().is_empty() {
            return Err(UploadError::InvalidTask("source path is empty".into()));
        }
        if task.target_path().as_os_str().is_empty() {
            return Err(UploadError::InvalidTask("target path is empty".into()));
        }

        task.state = TaskState::Pending;

        let id = task.id();
        let mut inner = self.lock();
        if inner.contains(id) {
            return Err(UploadError::DuplicateTask(id));
        }
        if inner.status.is_active() {
            inner.result.total_files += 1;
            inner.result.total_bytes += task.size_hint;
        }
        debug!(task = %id, source = %task.source_path().display(), priority = ?task.priority(), "task queued");
        inner.enqueue(task);
        Ok(id)
    }

    /// Enqueues a batch, stopping at the first invalid task.
    pub fn add_tasks(
        &self,
        tasks: impl IntoIterator<Item = UploadTask>,
    ) -> Result<Vec<TaskId>, UploadError> {
        tasks.into_iter().map(|task| self.add_task(task)).collect()
    }

    /// Resets the session result and counters and marks the session active.
    pub fn start_session(&self) -> Result<(), UploadError> {
        let mut inner = self.lock();
        if inner.status.is_active() {
            return Err(UploadError::SessionAlreadyActive);
        }
        let total_bytes = inner.queue.iter().map(|t| t.size_hint).sum();
        inner.result = UploadResult {
            total_files: inner.queue.len() + inner.in_flight.len(),
            total_bytes,
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        inner.failed_tasks.clear();
        inner.consecutive_failures = 0;
        inner.status = SessionStatus::Running;
        let total = inner.result.total_files;
        drop(inner);

        info!(total, "upload session started");
        self.emit(UploadEvent::Log(format!("upload session started with {total} files")));
        Ok(())
    }

    /// Marks the session finished and returns the final result.
    pub fn end_session(&self) -> UploadResult {
        let mut inner = self.lock();
        if !inner.status.is_active() {
            return inner.result.clone();
        }
        inner.result.ended_at = Some(Utc::now());
        inner.status = if inner.result.has_failures() {
            SessionStatus::CompletedWithFailures
        } else {
            SessionStatus::Completed
        };
        let result = inner.result.clone();
        drop(inner);

        info!(
            success = result.success_files.len(),
            failed = result.failed_files.len(),
            skipped = result.skipped_files.len(),
            speed_mbps = result.average_speed_mbps(),
            "upload session ended"
        );
        self.emit(UploadEvent::SessionEnded(result.clone()));
        result
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    /// Stops handing out tasks until [`resume`](Self::resume).
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.status == SessionStatus::Running {
            inner.status = SessionStatus::Paused;
            info!("upload session paused");
        }
    }

    pub fn resume(&self) {
        let mut inner = self.lock();
        if inner.status == SessionStatus::Paused {
            inner.status = SessionStatus::Running;
            info!("upload session resumed");
        }
    }

    /// Dequeues the head of the queue and marks it `InProgress`.
    pub fn get_next_task(&self) -> Option<UploadTask> {
        let mut inner = self.lock();
        if inner.status == SessionStatus::Paused {
            return None;
        }
        let mut task = inner.queue.pop_front()?;
        task.state = TaskState::InProgress;
        inner.in_flight.insert(
            task.id(),
            InFlight {
                task: task.clone(),
                bytes: 0,
            },
        );
        drop(inner);

        self.emit(UploadEvent::Started(task.clone()));
        Some(task)
    }

    pub fn mark_task_success(&self, task: &UploadTask) -> Transition {
        self.report(task, TaskOutcome::Success)
    }

    pub fn mark_task_failed(&self, task: &UploadTask, error: impl Into<String>) -> Transition {
        self.report(task, TaskOutcome::Failure(error.into()))
    }

    pub fn mark_task_skipped(&self, task: &UploadTask, reason: impl Into<String>) -> Transition {
        self.report(task, TaskOutcome::Skipped(reason.into()))
    }

    /// Applies the outcome of an in-progress task.
    pub fn report(&self, task: &UploadTask, outcome: TaskOutcome) -> Transition {
        let mut inner = self.lock();
        let Some(InFlight {
            task: mut current,
            bytes,
        }) = inner.in_flight.remove(&task.id())
        else {
            drop(inner);
            warn!(task = %task.id(), "outcome reported for a task that is not in progress");
            return Transition::Ignored;
        };
        let source = current.source_path().to_path_buf();

        let transition = match outcome {
            TaskOutcome::Success => {
                current.state = TaskState::Succeeded;
                inner.result.success_files.push(source.clone());
                inner.result.transferred_bytes += if bytes > 0 { bytes } else { current.size_hint };
                inner.consecutive_failures = 0;
                info!(task = %current.id(), source = %source.display(), retries = current.retry_count(), "upload succeeded");
                Transition::Finalized(TaskState::Succeeded)
            }
            TaskOutcome::Skipped(reason) => {
                current.state = TaskState::Skipped;
                info!(task = %current.id(), source = %source.display(), reason = %reason, "upload skipped");
                inner.result.skipped_files.push((source.clone(), reason));
                Transition::Finalized(TaskState::Skipped)
            }
            TaskOutcome::Failure(error) if current.retry_count() < current.max_retries() => {
                current.bump_retry();
                let retry_count = current.retry_count();
                warn!(
                    task = %current.id(),
                    source = %source.display(),
                    retry = retry_count,
                    max_retries = current.max_retries(),
                    error = %error,
                    "upload failed, requeued"
                );
                inner.enqueue(current.clone());
                let stats = inner.stats();
                drop(inner);

                self.emit(UploadEvent::Requeued {
                    task: current,
                    error,
                });
                self.emit_stats(stats);
                return Transition::Requeued { retry_count };
            }
            TaskOutcome::Failure(error) => {
                current.state = TaskState::Failed;
                warn!(
                    task = %current.id(),
                    source = %source.display(),
                    retries = current.retry_count(),
                    error = %error,
                    "upload failed permanently"
                );
                inner.result.failed_files.push((source.clone(), error));
                inner.failed_tasks.push(current.clone());
                inner.consecutive_failures += 1;
                Transition::Finalized(TaskState::Failed)
            }
        };

        let result = inner.result.clone();
        let stats = inner.stats();
        drop(inner);

        self.emit(UploadEvent::Completed {
            task: current,
            result,
        });
        self.emit_stats(stats);
        transition
    }

    /// Forwards per-file progress and records the bytes moved for the task.
    pub fn record_progress(&self, task: &UploadTask, fraction: f64, bytes: u64) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut inner = self.lock();
            match inner.in_flight.get_mut(&task.id()) {
                Some(entry) => entry.bytes = entry.bytes.max(bytes),
                None => return,
            }
        }
        self.emit(UploadEvent::Progress {
            task: task.id(),
            source: task.source_path().to_path_buf(),
            fraction,
        });
    }

    pub fn queue_size(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stats(&self) -> UploadStats {
        self.lock().stats()
    }

    pub fn result(&self) -> UploadResult {
        self.lock().result.clone()
    }

    /// Drops every pending task. In-progress tasks are unaffected.
    pub fn clear_queue(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.queue.len();
        inner.queue.clear();
        debug!(dropped, "queue cleared");
        dropped
    }

    /// Re-enqueues every terminally failed task with a fresh retry budget.
    pub fn retry_failed_tasks(&self) -> usize {
        let mut inner = self.lock();
        let failed = std::mem::take(&mut inner.failed_tasks);
        let count = failed.len();
        for mut task in failed {
            let source = task.source_path().to_path_buf();
            if let Some(pos) = inner
                .result
                .failed_files
                .iter()
                .position(|(path, _)| *path == source)
            {
                inner.result.failed_files.remove(pos);
            }
            task.reset_retries();
            inner.enqueue(task);
        }
        inner.consecutive_failures = 0;
        drop(inner);

        if count > 0 {
            info!(count, "failed tasks requeued");
            self.emit(UploadEvent::Log(format!("retrying {count} failed files")));
        }
        count
    }

    /// Terminal failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn should_pause(&self) -> bool {
        self.consecutive_failures() >= self.pause_threshold
    }

    pub fn reset_consecutive_failures(&self) {
        self.lock().consecutive_failures = 0;
    }
}

impl TaskSource for UploadManager {
    fn next_task(&self) -> Option<UploadTask> {
        self.get_next_task()
    }

    fn report(&self, task: &UploadTask, outcome: TaskOutcome) {
        UploadManager::report(self, task, outcome);
    }

    fn progress(&self, task: &UploadTask, fraction: f64, bytes: u64) {
        self.record_progress(task, fraction, bytes);
    }

    fn set_held(&self, held: bool) {
        if held {
            self.pause();
        } else {
            self.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;

    fn task(name: &str) -> UploadTask {
        UploadTask::new(name, format!("/dest/{name}"))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn fails_three_times_then_succeeds() {
        let manager = UploadManager::new();
        manager.add_task(task("a.jpg")).unwrap();

        for attempt in 1..=3 {
            let claimed = manager.get_next_task().unwrap();
            assert_eq!(claimed.state(), TaskState::InProgress);
            assert_eq!(
                manager.mark_task_failed(&claimed, "timeout"),
                Transition::Requeued { retry_count: attempt }
            );
        }

        let claimed = manager.get_next_task().unwrap();
        assert_eq!(claimed.retry_count(), 3);
        assert_eq!(
            manager.mark_task_success(&claimed),
            Transition::Finalized(TaskState::Succeeded)
        );

        let result = manager.result();
        assert_eq!(result.success_files, vec![PathBuf::from("a.jpg")]);
        assert!(result.failed_files.is_empty());
        assert!(manager.get_next_task().is_none());
    }

    #[test]
    fn fails_past_retry_budget() {
        let manager = UploadManager::new();
        manager.add_task(task("a.jpg")).unwrap();

        for _ in 0..3 {
            let claimed = manager.get_next_task().unwrap();
            manager.mark_task_failed(&claimed, "timeout");
        }
        let claimed = manager.get_next_task().unwrap();
        assert_eq!(
            manager.mark_task_failed(&claimed, "550 denied"),
            Transition::Finalized(TaskState::Failed)
        );

        let result = manager.result();
        assert_eq!(
            result.failed_files,
            vec![(PathBuf::from("a.jpg"), "550 denied".to_string())]
        );
        assert_eq!(manager.queue_size(), 0);
        assert!(manager.get_next_task().is_none());
    }

    #[test]
    fn zero_retries_fails_immediately() {
        let manager = UploadManager::new();
        manager
            .add_task(task("a.jpg").with_max_retries(0))
            .unwrap();
        let claimed = manager.get_next_task().unwrap();
        assert_eq!(
            manager.mark_task_failed(&claimed, "boom"),
            Transition::Finalized(TaskState::Failed)
        );
    }

    #[test]
    fn rejects_invalid_and_duplicate_tasks() {
        let manager = UploadManager::new();
        assert!(matches!(
            manager.add_task(UploadTask::new("", "/dest/x")),
            Err(UploadError::InvalidTask(_))
        ));

        let t = task("a.jpg");
        manager.add_task(t.clone()).unwrap();
        assert!(matches!(
            manager.add_task(t.clone()),
            Err(UploadError::DuplicateTask(id)) if id == t.id()
        ));

        // Still a duplicate while in progress.
        let claimed = manager.get_next_task().unwrap();
        assert!(matches!(
            manager.add_task(t),
            Err(UploadError::DuplicateTask(_))
        ));
        manager.mark_task_success(&claimed);
    }

    #[test]
    fn add_tasks_stops_at_first_invalid() {
        let manager = UploadManager::new();
        let err = manager.add_tasks(vec![task("a"), UploadTask::new("", "x"), task("c")]);
        assert!(err.is_err());
        assert_eq!(manager.queue_size(), 1);
    }

    #[test]
    fn fifo_within_priority_band() {
        let manager = UploadManager::new();
        manager.add_task(task("n1")).unwrap();
        manager.add_task(task("low").with_priority(Priority::Low)).unwrap();
        manager.add_task(task("n2")).unwrap();
        manager.add_task(task("u1").with_priority(Priority::Urgent)).unwrap();
        manager.add_task(task("h1").with_priority(Priority::High)).unwrap();
        manager.add_task(task("u2").with_priority(Priority::Urgent)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| manager.get_next_task())
            .map(|t| t.source_path().to_string_lossy().into_owned())
            .collect();
        assert_eq!(order, ["u1", "u2", "h1", "n1", "n2", "low"]);
    }

    #[test]
    fn retry_goes_to_band_tail() {
        let manager = UploadManager::new();
        manager.add_task(task("first")).unwrap();
        manager.add_task(task("second")).unwrap();

        let first = manager.get_next_task().unwrap();
        manager.mark_task_failed(&first, "reset");
        manager.add_task(task("third")).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| manager.get_next_task())
            .map(|t| t.source_path().to_string_lossy().into_owned())
            .collect();
        assert_eq!(order, ["second", "first", "third"]);
    }

    #[test]
    fn task_appears_once() {
        let manager = UploadManager::new();
        for name in ["a", "b", "c"] {
            manager.add_task(task(name)).unwrap();
        }
        let a = manager.get_next_task().unwrap();
        manager.mark_task_failed(&a, "x");
        let b = manager.get_next_task().unwrap();
        manager.mark_task_failed(&b, "x");

        let stats = manager.stats();
        assert_eq!(stats.pending + stats.in_progress, 3);
        assert_eq!(manager.queue_size(), 3);
    }

    #[test]
    fn stale_reports_are_ignored() {
        let manager = UploadManager::new();
        manager.add_task(task("a")).unwrap();
        let claimed = manager.get_next_task().unwrap();
        manager.mark_task_success(&claimed);

        assert_eq!(manager.mark_task_success(&claimed), Transition::Ignored);
        assert_eq!(manager.mark_task_failed(&claimed, "late"), Transition::Ignored);
        assert_eq!(manager.mark_task_success(&task("never-queued")), Transition::Ignored);
        assert_eq!(manager.result().success_files.len(), 1);
    }

    #[test]
    fn session_accounting() {
        let manager = UploadManager::new();
        for name in ["a", "b", "c", "d", "e"] {
            manager.add_task(task(name)).unwrap();
        }
        manager.start_session().unwrap();
        assert!(matches!(
            manager.start_session(),
            Err(UploadError::SessionAlreadyActive)
        ));

        let a = manager.get_next_task().unwrap();
        manager.mark_task_success(&a);
        let b = manager.get_next_task().unwrap();
        manager.mark_task_skipped(&b, "target already exists");
        let c = manager.get_next_task().unwrap();
        manager.report(&c, TaskOutcome::Failure("x".into()));
        let _d = manager.get_next_task().unwrap();

        let stats = manager.stats();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.in_progress, 1);
        // c (requeued) and e
        assert_eq!(stats.pending, 2);

        let result = manager.end_session();
        assert_eq!(result.total_files, 5);
        assert!(result.ended_at.is_some());
        assert_eq!(manager.status(), SessionStatus::Completed);
        assert_eq!(result.processed_files() + stats.pending + stats.in_progress, 5);
    }

    #[test]
    fn session_with_failures() {
        let manager = UploadManager::new();
        manager.add_task(task("a").with_max_retries(0)).unwrap();
        manager.start_session().unwrap();
        let a = manager.get_next_task().unwrap();
        manager.mark_task_failed(&a, "boom");
        let result = manager.end_session();
        assert!(result.has_failures());
        assert_eq!(manager.status(), SessionStatus::CompletedWithFailures);

        // Ending again is a no-op and a new session can start.
        assert_eq!(manager.end_session(), result);
        manager.start_session().unwrap();
        assert!(manager.result().failed_files.is_empty());
    }

    #[test]
    fn consecutive_failures_and_pause() {
        let manager = UploadManager::new();
        for name in ["a", "b", "c", "d"] {
            manager.add_task(task(name).with_max_retries(0)).unwrap();
        }
        for _ in 0..2 {
            let t = manager.get_next_task().unwrap();
            manager.mark_task_failed(&t, "down");
        }
        assert_eq!(manager.consecutive_failures(), 2);
        assert!(!manager.should_pause());

        let t = manager.get_next_task().unwrap();
        manager.mark_task_failed(&t, "down");
        assert!(manager.should_pause());

        let t = manager.get_next_task().unwrap();
        manager.mark_task_success(&t);
        assert_eq!(manager.consecutive_failures(), 0);
    }

    #[test]
    fn requeue_does_not_count_as_consecutive_failure() {
        let manager = UploadManager::new();
        manager.add_task(task("a")).unwrap();
        let t = manager.get_next_task().unwrap();
        manager.mark_task_failed(&t, "flaky");
        assert_eq!(manager.consecutive_failures(), 0);
    }

    #[test]
    fn retry_failed_tasks_resets_budget() {
        let manager = UploadManager::new();
        manager.add_task(task("a").with_max_retries(1)).unwrap();
        let t = manager.get_next_task().unwrap();
        manager.mark_task_failed(&t, "one");
        let t = manager.get_next_task().unwrap();
        manager.mark_task_failed(&t, "two");
        assert_eq!(manager.result().failed_files.len(), 1);

        assert_eq!(manager.retry_failed_tasks(), 1);
        assert!(manager.result().failed_files.is_empty());
        let t = manager.get_next_task().unwrap();
        assert_eq!(t.retry_count(), 0);
        assert_eq!(t.state(), TaskState::InProgress);
        assert_eq!(manager.retry_failed_tasks(), 0);
    }

    #[test]
    fn clear_queue_keeps_in_flight() {
        let manager = UploadManager::new();
        for name in ["a", "b", "c"] {
            manager.add_task(task(name)).unwrap();
        }
        let a = manager.get_next_task().unwrap();
        assert_eq!(manager.clear_queue(), 2);
        assert_eq!(manager.queue_size(), 0);
        assert_eq!(manager.stats().in_progress, 1);
        assert_eq!(
            manager.mark_task_success(&a),
            Transition::Finalized(TaskState::Succeeded)
        );
    }

    #[test]
    fn pause_holds_back_tasks() {
        let manager = UploadManager::new();
        manager.add_task(task("a")).unwrap();
        manager.start_session().unwrap();
        manager.pause();
        assert_eq!(manager.status(), SessionStatus::Paused);
        assert!(manager.get_next_task().is_none());
        manager.resume();
        assert!(manager.get_next_task().is_some());
    }

    #[test]
    fn held_worker_pauses_the_session() {
        let manager = UploadManager::new();
        manager.add_task(task("a")).unwrap();
        manager.start_session().unwrap();

        let source: &dyn TaskSource = &manager;
        source.set_held(true);
        assert_eq!(manager.status(), SessionStatus::Paused);
        assert!(source.next_task().is_none());
        source.set_held(false);
        assert_eq!(manager.status(), SessionStatus::Running);
        assert!(source.next_task().is_some());
    }

    #[test]
    fn transferred_bytes_use_progress_or_size() {
        let manager = UploadManager::new();
        manager
            .add_task(UploadTask::new("/src/a.bin", "/dest/a.bin").with_size(1000))
            .unwrap();
        manager
            .add_task(UploadTask::new("/src/b.bin", "/dest/b.bin").with_size(1000))
            .unwrap();
        manager.start_session().unwrap();
        assert_eq!(manager.result().total_bytes, 2000);

        let t = manager.get_next_task().unwrap();
        manager.record_progress(&t, 0.5, 500);
        manager.record_progress(&t, 1.0, 1000);
        manager.mark_task_success(&t);
        let t = manager.get_next_task().unwrap();
        manager.mark_task_success(&t);

        assert_eq!(manager.end_session().transferred_bytes, 2000);
    }

    #[test]
    fn adding_tasks_does_not_read_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("on-disk.bin");
        std::fs::write(&src, vec![0u8; 4096]).unwrap();

        let manager = UploadManager::new();
        manager.start_session().unwrap();
        // Unsized tasks count zero bytes even when the file exists.
        manager.add_task(UploadTask::new(&src, "/dest/a.bin")).unwrap();
        manager
            .add_task(UploadTask::new("/missing/b.bin", "/dest/b.bin").with_size(7))
            .unwrap();
        let result = manager.result();
        assert_eq!(result.total_files, 2);
        assert_eq!(result.total_bytes, 7);
    }

    #[test]
    fn events_follow_transitions() {
        let mut manager = UploadManager::new();
        let mut rx = manager.take_events().unwrap();
        assert!(manager.take_events().is_none());

        manager.add_task(task("a").with_max_retries(1)).unwrap();
        manager.start_session().unwrap();
        let t = manager.get_next_task().unwrap();
        manager.record_progress(&t, 0.25, 10);
        manager.mark_task_failed(&t, "reset");
        let t = manager.get_next_task().unwrap();
        manager.mark_task_success(&t);
        manager.end_session();

        let events = drain(&mut rx);
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                UploadEvent::Log(_) => "log",
                UploadEvent::Started(_) => "started",
                UploadEvent::Progress { .. } => "progress",
                UploadEvent::Requeued { .. } => "requeued",
                UploadEvent::Completed { .. } => "completed",
                UploadEvent::Stats(_) => "stats",
                UploadEvent::OverallProgress(_) => "overall",
                UploadEvent::SessionEnded(_) => "ended",
            })
            .collect();
        assert_eq!(
            kinds,
            [
                "log", "started", "progress", "requeued", "stats", "overall", "started",
                "completed", "stats", "overall", "ended"
            ]
        );
        match events.last() {
            Some(UploadEvent::SessionEnded(result)) => assert_eq!(result.success_files.len(), 1),
            other => panic!("unexpected final event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shared_between_threads() {
        let manager = std::sync::Arc::new(UploadManager::new());
        for i in 0..50 {
            manager.add_task(task(&format!("f{i}"))).unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let mut handled = 0;
                while let Some(t) = manager.next_task() {
                    TaskSource::report(&*manager, &t, TaskOutcome::Success);
                    handled += 1;
                    tokio::task::yield_now().await;
                }
                handled
            }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);
        assert_eq!(manager.result().success_files.len(), 50);
    }
}
