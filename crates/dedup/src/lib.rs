//! Content-based deduplication.
//!
//! A candidate is a duplicate when a file with the same digest already
//! exists anywhere under the destination root. Names and sizes are never
//! compared. The destination index is rebuilt on every call.

mod index;
mod service;

pub use index::DigestIndex;
pub use service::DedupService;

/// Errors produced by the dedup service.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination root is not a directory: {0}")]
    NotADirectory(std::path::PathBuf),
}
