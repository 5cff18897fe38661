//! Upload task orchestration.
//!
//! [`UploadManager`] owns the queue of [`UploadTask`]s, every task state
//! transition, the retry policy and the per-session [`UploadResult`]. It
//! knows nothing about how bytes move: workers pull tasks through the
//! [`TaskSource`] contract and report exactly one [`TaskOutcome`] per claim.

mod error;
mod manager;
mod result;
mod source;
mod task;

pub use error::UploadError;
pub use manager::{SessionStatus, Transition, UploadEvent, UploadManager};
pub use result::{UploadResult, UploadStats};
pub use source::TaskSource;
pub use task::{Priority, TaskId, TaskOutcome, TaskState, UploadTask};

/// Retry budget given to tasks that do not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Terminal failures in a row after which [`UploadManager::should_pause`] is true.
pub const DEFAULT_PAUSE_THRESHOLD: u32 = 3;
