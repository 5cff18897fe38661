//! Background folder polling.
//!
//! Every interval the monitor lists the source directory, uploads each
//! matching file and, after a successful upload, moves it into the backup
//! directory. A file is never removed from the source without a completed
//! backup move.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::FtpClient;
use crate::config::MonitorConfig;

/// Events emitted by the monitor loop.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Uploaded {
        path: PathBuf,
        remote: String,
        bytes: u64,
    },
    Failed {
        path: PathBuf,
        error: String,
    },
    BackedUp {
        path: PathBuf,
        backup: PathBuf,
    },
    BackupFailed {
        path: PathBuf,
        error: String,
    },
    PassCompleted {
        uploaded: usize,
        failed: usize,
    },
}

struct Shared {
    client: Arc<FtpClient>,
    config: MonitorConfig,
    events: Option<mpsc::UnboundedSender<MonitorEvent>>,
}

impl Shared {
    fn emit(&self, event: MonitorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Polls a folder and uploads new files through an [`FtpClient`].
pub struct FolderMonitor {
    shared: Arc<Shared>,
    inner: Mutex<MonitorInner>,
}

#[derive(Default)]
struct MonitorInner {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl FolderMonitor {
    pub fn new(
        client: Arc<FtpClient>,
        config: MonitorConfig,
        events: Option<mpsc::UnboundedSender<MonitorEvent>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                config,
                events,
            }),
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    /// Starts polling every `interval`. A running loop is stopped first.
    pub async fn start_monitoring(&self, interval: Duration) {
        self.stop_monitoring().await;

        let interval = interval.max(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor_loop(
            Arc::clone(&self.shared),
            interval,
            cancel.clone(),
        ));

        let mut inner = self.inner.lock().await;
        inner.cancel = Some(cancel);
        inner.task = Some(task);

        info!(
            source = %self.shared.config.source_dir.display(),
            interval_ms = interval.as_millis() as u64,
            "folder monitor started"
        );
    }

    /// Stops polling. Waits for an in-flight upload to finish.
    pub async fn stop_monitoring(&self) {
        let (cancel, task) = {
            let mut inner = self.inner.lock().await;
            (inner.cancel.take(), inner.task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
            info!("folder monitor stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.cancel.is_some()
    }
}

async fn monitor_loop(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    // Files uploaded whose backup move failed; retried without re-uploading.
    let mut awaiting_backup = HashSet::new();

    loop {
        let (uploaded, failed) = run_pass(&shared, &cancel, &mut awaiting_backup).await;
        if uploaded > 0 || failed > 0 {
            debug!(uploaded, failed, "monitor pass finished");
        }
        shared.emit(MonitorEvent::PassCompleted { uploaded, failed });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn run_pass(
    shared: &Shared,
    cancel: &CancellationToken,
    awaiting_backup: &mut HashSet<PathBuf>,
) -> (usize, usize) {
    let listing_timeout = shared.client.config().timeout();
    let files = match tokio::time::timeout(listing_timeout, list_source(&shared.config)).await {
        Ok(Ok(files)) => files,
        Ok(Err(e)) => {
            warn!(source = %shared.config.source_dir.display(), "cannot list source: {e}");
            return (0, 0);
        }
        Err(_) => {
            warn!(source = %shared.config.source_dir.display(), "listing source timed out");
            return (0, 0);
        }
    };

    let (mut uploaded, mut failed) = (0, 0);
    for path in files {
        if cancel.is_cancelled() {
            break;
        }

        if !awaiting_backup.contains(&path) {
            match shared.client.upload_file(&path, None).await {
                Ok(bytes) => {
                    uploaded += 1;
                    let remote = shared.client.remote_path_for(&path).unwrap_or_default();
                    shared.emit(MonitorEvent::Uploaded {
                        path: path.clone(),
                        remote,
                        bytes,
                    });
                }
                Err(e) => {
                    failed += 1;
                    shared.emit(MonitorEvent::Failed {
                        path: path.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            }
        }

        match backup(&path, &shared.config.backup_dir).await {
            Ok(dest) => {
                awaiting_backup.remove(&path);
                shared.emit(MonitorEvent::BackedUp { path, backup: dest });
            }
            Err(e) => {
                warn!(path = %path.display(), "backup move failed: {e}");
                shared.emit(MonitorEvent::BackupFailed {
                    path: path.clone(),
                    error: e.to_string(),
                });
                awaiting_backup.insert(path);
            }
        }
    }
    (uploaded, failed)
}

/// Regular files directly under the source directory, sorted by name.
async fn list_source(config: &MonitorConfig) -> std::io::Result<Vec<PathBuf>> {
    let mut dir = tokio::fs::read_dir(&config.source_dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if matches_extension(&path, &config.extensions) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

async fn backup(path: &Path, backup_dir: &Path) -> std::io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    relocate_unique(path, &backup_dir.join(name)).await
}

/// Returns `dest` when nothing lives there, otherwise the first free
/// `<stem> (n).<ext>` sibling.
pub async fn unoccupied_path(dest: &Path) -> PathBuf {
    if !tokio::fs::try_exists(dest).await.unwrap_or(false) {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest.extension().map(|e| e.to_string_lossy().into_owned());
    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dest.with_file_name(name);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// [`relocate`] into [`unoccupied_path`]`(dest)`. Returns where the file
/// ended up. An existing file at `dest` is never replaced.
pub async fn relocate_unique(src: &Path, dest: &Path) -> std::io::Result<PathBuf> {
    let dest = unoccupied_path(dest).await;
    relocate(src, &dest).await?;
    Ok(dest)
}

/// Moves `src` to `dest`, falling back to copy-then-remove across
/// filesystems. On failure the source is left in place.
pub async fn relocate(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    if let Err(e) = tokio::fs::copy(src, dest).await {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(e);
    }
    tokio::fs::remove_file(src).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClientConfig, FtpServer, PortRange, ServerConfig};

    async fn start_server(root: &Path) -> (FtpServer, u16) {
        let server = FtpServer::new(ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            root: root.to_path_buf(),
            passive_ports: PortRange(50400, 50500),
            ..Default::default()
        })
        .unwrap();
        let addr = server.start().await.unwrap();
        (server, addr.port())
    }

    fn client(port: u16) -> Arc<FtpClient> {
        Arc::new(
            FtpClient::new(ClientConfig {
                host: "127.0.0.1".into(),
                port,
                timeout_secs: 5,
                retry_times: 0,
                retry_delay_secs: 0,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    async fn wait_for_pass(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let done = matches!(event, MonitorEvent::PassCompleted { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[test]
    fn extension_filter() {
        let exts = vec!["jpg".to_string(), ".PNG".to_string()];
        assert!(matches_extension(Path::new("a.JPG"), &exts));
        assert!(matches_extension(Path::new("b.png"), &exts));
        assert!(!matches_extension(Path::new("c.txt"), &exts));
        assert!(!matches_extension(Path::new("noext"), &exts));
        assert!(matches_extension(Path::new("c.txt"), &[]));
    }

    #[tokio::test]
    async fn relocate_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.jpg");
        std::fs::write(&src, b"abc").unwrap();
        let dest = dir.path().join("backup").join("nested").join("a.jpg");

        relocate(&src, &dest).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn relocate_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = relocate(&dir.path().join("nope"), &dir.path().join("out")).await;
        assert!(result.is_err());
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn backup_avoids_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = dir.path().join("backup");
        std::fs::create_dir(&backup_dir).unwrap();
        std::fs::write(backup_dir.join("a.jpg"), b"old").unwrap();
        let src = dir.path().join("a.jpg");
        std::fs::write(&src, b"new").unwrap();

        let dest = backup(&src, &backup_dir).await.unwrap();
        assert_eq!(dest, backup_dir.join("a (1).jpg"));
        assert_eq!(std::fs::read(backup_dir.join("a.jpg")).unwrap(), b"old");
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
    }

    #[tokio::test]
    async fn unoccupied_path_counts_up() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("raw");
        assert_eq!(unoccupied_path(&dest).await, dest);

        std::fs::write(&dest, b"1").unwrap();
        std::fs::write(dir.path().join("raw (1)"), b"2").unwrap();
        assert_eq!(unoccupied_path(&dest).await, dir.path().join("raw (2)"));

        let photo = dir.path().join("img.tar.gz");
        std::fs::write(&photo, b"x").unwrap();
        assert_eq!(
            unoccupied_path(&photo).await,
            dir.path().join("img.tar (1).gz")
        );
    }

    #[tokio::test]
    async fn uploads_then_moves_to_backup() {
        let server_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let source = work.path().join("outbox");
        let backup_dir = work.path().join("backup");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("a.jpg"), b"aaa").unwrap();
        std::fs::write(source.join("b.jpg"), b"bbbb").unwrap();
        std::fs::write(source.join("notes.txt"), b"skip me").unwrap();

        let (server, port) = start_server(server_dir.path()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = FolderMonitor::new(
            client(port),
            MonitorConfig {
                source_dir: source.clone(),
                backup_dir: backup_dir.clone(),
                extensions: vec!["jpg".into()],
            },
            Some(tx),
        );

        monitor.start_monitoring(Duration::from_millis(50)).await;
        assert!(monitor.is_running().await);
        let events = wait_for_pass(&mut rx).await;
        monitor.stop_monitoring().await;
        assert!(!monitor.is_running().await);

        assert_eq!(
            events.last(),
            Some(&MonitorEvent::PassCompleted {
                uploaded: 2,
                failed: 0
            })
        );
        let uploaded = server_dir.path().join("upload");
        assert_eq!(std::fs::read(uploaded.join("a.jpg")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(uploaded.join("b.jpg")).unwrap(), b"bbbb");
        assert!(!uploaded.join("notes.txt").exists());

        assert!(!source.join("a.jpg").exists());
        assert!(backup_dir.join("a.jpg").exists());
        assert!(backup_dir.join("b.jpg").exists());
        assert!(source.join("notes.txt").exists());

        server.stop().await;
    }

    #[tokio::test]
    async fn failed_upload_keeps_source() {
        let work = tempfile::tempdir().unwrap();
        let source = work.path().join("outbox");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("a.jpg"), b"aaa").unwrap();

        // Bind and drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = FolderMonitor::new(
            client(port),
            MonitorConfig {
                source_dir: source.clone(),
                backup_dir: work.path().join("backup"),
                extensions: Vec::new(),
            },
            Some(tx),
        );

        monitor.start_monitoring(Duration::from_millis(50)).await;
        let events = wait_for_pass(&mut rx).await;
        monitor.stop_monitoring().await;

        assert!(matches!(events[0], MonitorEvent::Failed { .. }));
        assert!(source.join("a.jpg").exists());
        assert!(!work.path().join("backup").exists());
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let monitor = FolderMonitor::new(client(21), MonitorConfig::default(), None);
        monitor.stop_monitoring().await;
        assert!(!monitor.is_running().await);
    }
}
