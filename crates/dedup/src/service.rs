use std::path::{Path, PathBuf};

use ferry_hasher::{HashAlgorithm, hash_file};
use tracing::{debug, info, warn};

use crate::{DedupError, DigestIndex};

/// Filters candidate files whose content already exists at the destination.
///
/// Disabled by default; while disabled every candidate passes through.
#[derive(Debug, Clone, Default)]
pub struct DedupService {
    enabled: bool,
    algorithm: HashAlgorithm,
}

impl DedupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_deduplication(&mut self, enabled: bool, algorithm: HashAlgorithm) {
        self.enabled = enabled;
        self.algorithm = algorithm;
        info!(enabled, %algorithm, "deduplication configured");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Returns `files` minus those whose content is already under `target_root`.
    ///
    /// Input order is preserved. Each existing file and each candidate is
    /// hashed exactly once. A candidate that cannot be read is kept: it is
    /// not provably a duplicate, and the transfer will report the IO error.
    ///
    /// Blocking; run it on the blocking pool from async code.
    pub fn filter_duplicates(
        &self,
        files: &[PathBuf],
        target_root: &Path,
    ) -> Result<Vec<PathBuf>, DedupError> {
        if !self.enabled {
            return Ok(files.to_vec());
        }

        let index = DigestIndex::build(target_root, self.algorithm)?;
        if index.is_empty() {
            return Ok(files.to_vec());
        }

        let mut kept = Vec::with_capacity(files.len());
        for file in files {
            match self.find_duplicate(file, &index) {
                Ok(Some(existing)) => {
                    debug!(
                        candidate = %file.display(),
                        existing = %existing.display(),
                        "duplicate skipped"
                    );
                }
                Ok(None) => kept.push(file.clone()),
                Err(e) => {
                    warn!(candidate = %file.display(), "cannot hash candidate, keeping it: {e}");
                    kept.push(file.clone());
                }
            }
        }

        info!(
            candidates = files.len(),
            kept = kept.len(),
            duplicates = files.len() - kept.len(),
            "deduplication pass finished"
        );
        Ok(kept)
    }

    /// Known destination path with the same content as `file`, if any.
    pub fn find_duplicate<'a>(
        &self,
        file: &Path,
        index: &'a DigestIndex,
    ) -> Result<Option<&'a Path>, ferry_hasher::HashError> {
        let digest = hash_file(file, index.algorithm())?;
        Ok(index.get(&digest))
    }
}
