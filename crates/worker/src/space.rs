//! Free space on the volumes transfers write to.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::debug;

/// Pause transfers while any of `paths` sits on a volume with less than
/// `min_free_percent` of its capacity free.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskGuard {
    pub min_free_percent: f64,
    pub paths: Vec<PathBuf>,
}

impl DiskGuard {
    pub fn new(min_free_percent: f64, paths: Vec<PathBuf>) -> Self {
        Self {
            min_free_percent,
            paths,
        }
    }
}

/// Percentage of free space on the volume holding `path`, which need not
/// exist yet. `None` when no mounted volume can be matched.
///
/// Blocking: reads the mount table.
pub fn free_space_percent(path: &Path) -> Option<f64> {
    let resolved = resolve(path)?;
    let disks = Disks::new_with_refreshed_list();
    let percent = percent_on_volume(
        &resolved,
        disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.available_space(), d.total_space())),
    );
    debug!(path = %path.display(), ?percent, "free space measured");
    percent
}

/// Nearest existing ancestor of `path`, canonicalized.
fn resolve(path: &Path) -> Option<PathBuf> {
    let absolute = std::path::absolute(path).ok()?;
    absolute
        .ancestors()
        .find_map(|p| std::fs::canonicalize(p).ok())
}

/// Picks the volume with the longest mount point containing `path`.
fn percent_on_volume<'a>(
    path: &Path,
    volumes: impl Iterator<Item = (&'a Path, u64, u64)>,
) -> Option<f64> {
    volumes
        .filter(|(mount, _, total)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.as_os_str().len())
        .map(|(_, available, total)| available as f64 * 100.0 / total as f64)
}
