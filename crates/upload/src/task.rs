use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::DEFAULT_MAX_RETRIES;

pub type TaskId = Uuid;

/// Scheduling band. Higher bands are served first; FIFO within a band.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

/// Lifecycle state of a task. Only the manager changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// What a worker reports after handling a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure(String),
    Skipped(String),
}

/// One file's transfer request.
///
/// Paths, id and retry budget are fixed at creation. `state` and
/// `retry_count` are only advanced by the [`UploadManager`](crate::UploadManager).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadTask {
    id: TaskId,
    source_path: PathBuf,
    target_path: PathBuf,
    backup_path: Option<PathBuf>,
    retry_count: u32,
    max_retries: u32,
    priority: Priority,
    pub(crate) state: TaskState,
    pub(crate) size_hint: u64,
    created_at: DateTime<Utc>,
}

impl UploadTask {
    pub fn new(source_path: impl Into<PathBuf>, target_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path: source_path.into(),
            target_path: target_path.into(),
            backup_path: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: Priority::default(),
            state: TaskState::Pending,
            size_hint: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_backup(mut self, backup_path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(backup_path.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Expected size in bytes, counted into the session totals and used as
    /// the transferred amount when no progress was reported.
    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_hint = bytes;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup_path.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn size(&self) -> u64 {
        self.size_hint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn bump_retry(&mut self) {
        self.retry_count += 1;
        self.state = TaskState::Pending;
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.state = TaskState::Pending;
    }
}
