//! Lazy source-tree scanning.

use std::fs::ReadDir;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::WorkerError;

/// Bounded-time existence probe. Returns `false` when the probe times out,
/// e.g. on a hung network share.
pub async fn check_path_accessible(path: &Path, timeout: Duration) -> bool {
    let path = path.to_path_buf();
    let probe = tokio::task::spawn_blocking(move || path.exists());
    matches!(tokio::time::timeout(timeout, probe).await, Ok(Ok(true)))
}

/// Probes `root` and returns a restartable scan of its files.
///
/// `extensions` match case-insensitively, with or without a leading dot.
/// An empty list matches every file.
pub async fn scan_files(
    root: &Path,
    extensions: &[String],
    timeout: Duration,
) -> Result<FileScan, WorkerError> {
    let dir = root.to_path_buf();
    let probe = tokio::task::spawn_blocking(move || std::fs::read_dir(&dir).is_ok());
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(true)) => {}
        _ => return Err(WorkerError::PathUnavailable(root.to_path_buf())),
    }

    let extensions: Vec<String> = extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    debug!(root = %root.display(), ?extensions, "scan prepared");

    Ok(FileScan {
        root: root.to_path_buf(),
        extensions,
    })
}

/// A recursive, extension-filtered view of a directory tree.
///
/// Nothing is read until iterated. Every [`iter`](Self::iter) call walks
/// the tree again, so a scan can be reused between passes.
#[derive(Debug, Clone)]
pub struct FileScan {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FileScan {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iter(&self) -> FileScanIter<'_> {
        FileScanIter {
            scan: self,
            stack: Vec::new(),
            started: false,
        }
    }

    fn matches(&self, path: &Path) -> bool {
        if is_staging_file(path) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(ext))
            })
    }
}

/// Hidden `.<name>.part` / `.<name>.<n>.incoming` files are transfers
/// still being written.
fn is_staging_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && (n.ends_with(".part") || n.ends_with(".incoming")))
}

impl<'a> IntoIterator for &'a FileScan {
    type Item = PathBuf;
    type IntoIter = FileScanIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Depth-first walk over a [`FileScan`]. Unreadable entries are skipped.
pub struct FileScanIter<'a> {
    scan: &'a FileScan,
    stack: Vec<ReadDir>,
    started: bool,
}

impl FileScanIter<'_> {
    fn descend(&mut self, dir: &Path) {
        match std::fs::read_dir(dir) {
            Ok(entries) => self.stack.push(entries),
            Err(e) => warn!(path = %dir.display(), error = %e, "skipping unreadable directory"),
        }
    }
}

impl Iterator for FileScanIter<'_> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        if !self.started {
            self.started = true;
            let root = self.scan.root.clone();
            self.descend(&root);
        }

        loop {
            let entries = self.stack.last_mut()?;
            let entry = match entries.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
                None => {
                    self.stack.pop();
                    continue;
                }
            };

            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                self.descend(&path);
                continue;
            }
            // Symlinked files are followed, symlinked directories are not.
            let is_file = file_type.is_file()
                || (file_type.is_symlink() && std::fs::metadata(&path).is_ok_and(|m| m.is_file()));
            if is_file && self.scan.matches(&path) {
                return Some(path);
            }
        }
    }
}
