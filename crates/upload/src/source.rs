use crate::{TaskOutcome, UploadTask};

/// Pull/report contract between a task supplier and a worker.
///
/// A worker calls [`next_task`](Self::next_task) until it returns `None`
/// and calls [`report`](Self::report) exactly once for every task it
/// received.
pub trait TaskSource: Send + Sync {
    fn next_task(&self) -> Option<UploadTask>;

    fn report(&self, task: &UploadTask, outcome: TaskOutcome);

    /// Progress for an in-flight task. `fraction` is in `0.0..=1.0`.
    fn progress(&self, _task: &UploadTask, _fraction: f64, _bytes: u64) {}

    /// The worker stopped pulling because its destination cannot take work
    /// (`true`), or started again (`false`).
    fn set_held(&self, _held: bool) {}
}
