//! Transfer worker.
//!
//! A [`Worker`] pulls [`UploadTask`](ferry_upload::UploadTask)s from a
//! [`TaskSource`](ferry_upload::TaskSource), moves the bytes to a local
//! share or an FTP server, verifies them, and reports one outcome per task.
//! [`scan_files`] produces the candidate list for a source tree.

mod copy;
mod progress;
mod scan;
mod space;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

pub use scan::{FileScan, FileScanIter, check_path_accessible, scan_files};
pub use space::{DiskGuard, free_space_percent};
pub use worker::{Destination, HoldReason, Worker, WorkerConfig, WorkerEvent};

/// Read/write unit for local copies.
pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Default bound for a single read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for destination and source probes.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a held worker re-checks the condition holding it.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path unavailable: {}", .0.display())]
    PathUnavailable(PathBuf),

    #[error("destination unreachable: {}", .0.display())]
    Unreachable(PathBuf),

    #[error("operation timed out")]
    Timeout,

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("digest mismatch: source {source_digest}, target {target_digest}")]
    DigestMismatch {
        source_digest: String,
        target_digest: String,
    },

    #[error("target path is not valid UTF-8: {}", .0.display())]
    InvalidTarget(PathBuf),

    #[error("hash error: {0}")]
    Hash(#[from] ferry_hasher::HashError),

    #[error("ftp error: {0}")]
    Ftp(#[from] ferry_ftp::FtpError),

    #[error("worker is already running")]
    AlreadyRunning,
}

impl From<tokio::time::error::Elapsed> for WorkerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
