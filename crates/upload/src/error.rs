//! Upload manager error types.

use crate::TaskId;

/// Programmer-error class failures. Expected conditions (retry exhausted,
/// stale reports) are never errors.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task {0} is already queued or in progress")]
    DuplicateTask(TaskId),

    #[error("an upload session is already active")]
    SessionAlreadyActive,
}
