use std::collections::HashMap;
use std::fs::{DirEntry, FileType};
use std::path::{Path, PathBuf};

use ferry_hasher::{ContentDigest, HashAlgorithm, hash_file};
use tracing::{debug, warn};

use crate::DedupError;

/// Digest records `(content digest, known path)` for one destination tree.
#[derive(Debug)]
pub struct DigestIndex {
    algorithm: HashAlgorithm,
    records: HashMap<ContentDigest, PathBuf>,
}

impl DigestIndex {
    /// Hashes every regular file under `root`, one file at a time.
    ///
    /// A missing root yields an empty index. Entries, directories and files
    /// below the root that cannot be read are skipped with a warning.
    pub fn build(root: &Path, algorithm: HashAlgorithm) -> Result<Self, DedupError> {
        let mut index = Self {
            algorithm,
            records: HashMap::new(),
        };

        match std::fs::metadata(root) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %root.display(), "destination root missing, empty index");
                return Ok(index);
            }
            Err(e) => return Err(e.into()),
            Ok(meta) if !meta.is_dir() => {
                return Err(DedupError::NotADirectory(root.to_path_buf()));
            }
            Ok(_) => {}
        }

        index.walk_dir(root, true)?;
        debug!(root = %root.display(), files = index.len(), %algorithm, "digest index built");
        Ok(index)
    }

    fn walk_dir(&mut self, current: &Path, is_root: bool) -> Result<(), DedupError> {
        let entries = match std::fs::read_dir(current) {
            Ok(entries) => entries,
            // Only the root itself must be readable.
            Err(e) if is_root => return Err(e.into()),
            Err(e) => {
                warn!(dir = %current.display(), "skipping unreadable directory: {e}");
                return Ok(());
            }
        };

        for entry in entries {
            let Some((path, file_type)) = readable_entry(current, entry) else {
                continue;
            };

            if file_type.is_dir() {
                self.walk_dir(&path, false)?;
            } else if file_type.is_file() {
                match hash_file(&path, self.algorithm) {
                    Ok(digest) => {
                        self.records.entry(digest).or_insert(path);
                    }
                    Err(e) => warn!(path = %path.display(), "skipping unreadable file: {e}"),
                }
            }
        }
        Ok(())
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Path of a known file with this digest.
    pub fn get(&self, digest: &ContentDigest) -> Option<&Path> {
        self.records.get(digest).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn readable_entry(dir: &Path, entry: std::io::Result<DirEntry>) -> Option<(PathBuf, FileType)> {
    match entry.and_then(|e| Ok((e.path(), e.file_type()?))) {
        Ok(found) => Some(found),
        Err(e) => {
            warn!(dir = %dir.display(), "skipping unreadable entry: {e}");
            None
        }
    }
}
