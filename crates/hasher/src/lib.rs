//! Streaming content digests.
//!
//! Files are read through a fixed-size buffer, so memory use stays bounded
//! regardless of file size. The same digest is used for deduplication and
//! for post-transfer verification.

mod algorithm;
mod hash;

pub use algorithm::HashAlgorithm;
pub use hash::{ContentDigest, hash_file, hash_reader};

/// Read buffer used while hashing (8 KB).
pub const HASH_BUFFER_SIZE: usize = 8192;

/// Errors produced by the hasher.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported hash algorithm: {0}")]
    UnknownAlgorithm(String),
}
