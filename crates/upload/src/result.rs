use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Accumulated outcome of one session.
///
/// Every task that entered the queue ends up in exactly one of the three
/// sequences, unless it was still pending or in progress when the session
/// stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadResult {
    pub success_files: Vec<PathBuf>,
    pub failed_files: Vec<(PathBuf, String)>,
    pub skipped_files: Vec<(PathBuf, String)>,
    pub total_files: usize,
    /// Sum of source sizes at enqueue time (best effort).
    pub total_bytes: u64,
    /// Bytes of successfully transferred files.
    pub transferred_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl UploadResult {
    pub fn processed_files(&self) -> usize {
        self.success_files.len() + self.failed_files.len() + self.skipped_files.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_files.is_empty()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    /// Average throughput in MiB/s over the session so far.
    pub fn average_speed_mbps(&self) -> f64 {
        let Some(duration) = self.duration() else {
            return 0.0;
        };
        let secs = duration.num_milliseconds() as f64 / 1000.0;
        if secs <= 0.0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Counts derived from an [`UploadResult`] plus the live queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadStats {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub in_progress: usize,
}

impl UploadStats {
    pub(crate) fn snapshot(result: &UploadResult, pending: usize, in_progress: usize) -> Self {
        Self {
            success: result.success_files.len(),
            failed: result.failed_files.len(),
            skipped: result.skipped_files.len(),
            pending,
            in_progress,
        }
    }

    /// Tasks that reached a terminal state.
    pub fn finished(&self) -> usize {
        self.success + self.failed + self.skipped
    }

    /// Fraction of known tasks that are finished.
    pub fn progress(&self) -> f64 {
        let total = self.finished() + self.pending + self.in_progress;
        if total == 0 {
            1.0
        } else {
            self.finished() as f64 / total as f64
        }
    }
}
