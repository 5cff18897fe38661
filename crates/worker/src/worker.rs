//! Background worker loop.
//!
//! The worker owns no queue. It pulls from a [`TaskSource`] until the
//! source runs dry or the worker is stopped, and reports exactly one
//! [`TaskOutcome`] for every task it pulled.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ferry_ftp::{ClientConfig, FtpClient, FtpError};
use ferry_hasher::HashAlgorithm;
use ferry_upload::{TaskId, TaskOutcome, TaskSource, UploadTask};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::copy::copy_verified;
use crate::progress::{ProgressGate, fraction};
use crate::scan::check_path_accessible;
use crate::space::{DiskGuard, free_space_percent};
use crate::{DEFAULT_IO_TIMEOUT, DEFAULT_PROBE_TIMEOUT, DEFAULT_RECHECK_INTERVAL, WorkerError};

const SKIP_SOURCE_MISSING: &str = "source file missing";
const SKIP_TARGET_EXISTS: &str = "target already exists";

/// Where task targets live.
#[derive(Debug, Clone)]
pub enum Destination {
    /// File-share copy. Task targets are local paths under `root`, which is
    /// checked before every task.
    Local {
        root: PathBuf,
        verify_digest: Option<HashAlgorithm>,
    },
    /// Task targets are remote paths on this server.
    Ftp(ClientConfig),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub destination: Destination,
    /// Bound for each read, write or remote operation.
    pub io_timeout: Duration,
    /// Bound for source and destination existence probes.
    pub probe_timeout: Duration,
    /// Stop pulling tasks while the destination is unreachable and pick up
    /// again once it answers.
    pub auto_pause: bool,
    pub disk_guard: Option<DiskGuard>,
    /// How often a held worker re-checks.
    pub recheck_interval: Duration,
}

impl WorkerConfig {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            io_timeout: DEFAULT_IO_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            auto_pause: false,
            disk_guard: None,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
        }
    }
}

/// Why a worker stopped pulling tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum HoldReason {
    Unreachable,
    LowSpace { path: PathBuf, free_percent: f64 },
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::Unreachable => f.write_str("destination unreachable"),
            HoldReason::LowSpace { path, free_percent } => write!(
                f,
                "only {free_percent:.1}% free on the volume of {}",
                path.display()
            ),
        }
    }
}

/// Events emitted by the worker loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Log(String),
    TaskStarted {
        task: TaskId,
        source: PathBuf,
    },
    /// Per-file progress, at most once per 5 % step.
    FileProgress {
        task: TaskId,
        source: PathBuf,
        fraction: f64,
    },
    TaskFinished {
        task: TaskId,
        source: PathBuf,
        outcome: TaskOutcome,
    },
    /// Destination reachability changed.
    Reachability(bool),
    /// The worker stopped pulling tasks and paused its source.
    Held(HoldReason),
    /// The hold ended and the source was resumed.
    Released,
    Stopped {
        processed: usize,
    },
}

enum Transport {
    Local {
        root: PathBuf,
        verify: Option<HashAlgorithm>,
    },
    Ftp(FtpClient),
}

enum Delivery {
    Transferred(u64),
    TargetExists,
}

struct Shared {
    transport: Transport,
    io_timeout: Duration,
    probe_timeout: Duration,
    auto_pause: bool,
    disk_guard: Option<DiskGuard>,
    recheck_interval: Duration,
    free_space: fn(&Path) -> Option<f64>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    reachable: Mutex<Option<bool>>,
}

#[derive(Default)]
struct WorkerInner {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<usize>>,
}

/// Pull-based transfer worker. One task in flight at a time.
pub struct Worker {
    shared: Arc<Shared>,
    events_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let transport = match config.destination {
            Destination::Local {
                root,
                verify_digest,
            } => Transport::Local {
                root,
                verify: verify_digest,
            },
            Destination::Ftp(client) => Transport::Ftp(FtpClient::new(client)?),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                io_timeout: config.io_timeout,
                probe_timeout: config.probe_timeout,
                auto_pause: config.auto_pause,
                disk_guard: config.disk_guard,
                recheck_interval: config.recheck_interval,
                free_space: free_space_percent,
                events_tx,
                reachable: Mutex::new(None),
            }),
            events_rx: Some(events_rx),
            inner: Mutex::new(WorkerInner::default()),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerEvent>> {
        self.events_rx.take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker loop over `source`.
    pub fn start(&self, source: Arc<dyn TaskSource>) -> Result<(), WorkerError> {
        let mut inner = self.lock();
        if inner.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(WorkerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        inner.task = Some(tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            source,
            cancel.clone(),
        )));
        inner.cancel = Some(cancel);
        info!("worker started");
        Ok(())
    }

    /// Requests termination. The in-flight task finishes and is reported first.
    pub fn stop(&self) {
        if let Some(cancel) = &self.lock().cancel {
            cancel.cancel();
        }
    }

    /// Waits for the loop to exit. Returns the number of tasks it handled.
    pub async fn join(&self) -> usize {
        let task = {
            let mut inner = self.lock();
            inner.cancel = None;
            inner.task.take()
        };
        match task {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "worker loop aborted");
                0
            }),
            None => 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    source: Arc<dyn TaskSource>,
    cancel: CancellationToken,
) -> usize {
    let mut processed = 0;
    while !cancel.is_cancelled() {
        if !shared.wait_until_ready(source.as_ref(), &cancel).await {
            break;
        }
        let Some(task) = source.next_task() else {
            debug!("task source drained");
            break;
        };

        let outcome = shared.process(source.as_ref(), &task).await;
        source.report(&task, outcome.clone());
        shared.emit(WorkerEvent::TaskFinished {
            task: task.id(),
            source: task.source_path().to_path_buf(),
            outcome,
        });
        processed += 1;
    }

    info!(processed, cancelled = cancel.is_cancelled(), "worker stopped");
    shared.emit(WorkerEvent::Stopped { processed });
    processed
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_reachable(&self, reachable: bool) {
        let mut current = self.reachable.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != Some(reachable) {
            *current = Some(reachable);
            drop(current);
            if reachable {
                info!("destination reachable");
            } else {
                warn!("destination unreachable");
            }
            self.emit(WorkerEvent::Reachability(reachable));
        }
    }

    fn last_reachable(&self) -> Option<bool> {
        *self.reachable.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keeps the loop from pulling while [`hold_reason`](Self::hold_reason)
    /// reports something, with `source` paused for the duration. Returns
    /// false when cancelled while held.
    async fn wait_until_ready(&self, source: &dyn TaskSource, cancel: &CancellationToken) -> bool {
        let mut held = false;
        while let Some(reason) = self.hold_reason().await {
            if !held {
                warn!(%reason, "holding transfers");
                source.set_held(true);
                self.emit(WorkerEvent::Held(reason));
                held = true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    source.set_held(false);
                    return false;
                }
                _ = tokio::time::sleep(self.recheck_interval) => {}
            }
        }
        if held {
            info!("hold cleared, resuming transfers");
            source.set_held(false);
            self.emit(WorkerEvent::Released);
        }
        true
    }

    async fn hold_reason(&self) -> Option<HoldReason> {
        if self.auto_pause && self.last_reachable() == Some(false) {
            let reachable = self.check_destination().await;
            self.set_reachable(reachable);
            if !reachable {
                return Some(HoldReason::Unreachable);
            }
        }

        let guard = self.disk_guard.as_ref()?;
        for path in &guard.paths {
            let measure = self.free_space;
            let owned = path.clone();
            let free = tokio::task::spawn_blocking(move || measure(&owned))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "free space check aborted");
                    None
                });
            match free {
                Some(free_percent) if free_percent < guard.min_free_percent => {
                    return Some(HoldReason::LowSpace {
                        path: path.clone(),
                        free_percent,
                    });
                }
                Some(_) => {}
                None => debug!(path = %path.display(), "free space unknown, not holding"),
            }
        }
        None
    }

    async fn check_destination(&self) -> bool {
        match &self.transport {
            Transport::Local { root, .. } => check_path_accessible(root, self.probe_timeout).await,
            Transport::Ftp(client) => {
                let config = client.config();
                let connect = TcpStream::connect((config.host.as_str(), config.port));
                matches!(timeout(self.probe_timeout, connect).await, Ok(Ok(_)))
            }
        }
    }

    fn report_progress(
        &self,
        source: &dyn TaskSource,
        task: &UploadTask,
        gate: &mut ProgressGate,
        done: u64,
        total: u64,
    ) {
        let fraction = fraction(done, total);
        if gate.admit(fraction) {
            source.progress(task, fraction, done);
            self.emit(WorkerEvent::FileProgress {
                task: task.id(),
                source: task.source_path().to_path_buf(),
                fraction,
            });
        }
    }

    async fn process(&self, source: &dyn TaskSource, task: &UploadTask) -> TaskOutcome {
        let src = task.source_path();
        self.emit(WorkerEvent::TaskStarted {
            task: task.id(),
            source: src.to_path_buf(),
        });

        let size = match timeout(self.probe_timeout, tokio::fs::metadata(src)).await {
            Ok(Ok(meta)) if meta.is_file() => meta.len(),
            Ok(Ok(_)) => {
                return TaskOutcome::Failure(format!("{} is not a regular file", src.display()));
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(task = %task.id(), source = %src.display(), "source vanished, skipping");
                return TaskOutcome::Skipped(SKIP_SOURCE_MISSING.into());
            }
            Ok(Err(e)) => return TaskOutcome::Failure(WorkerError::Io(e).to_string()),
            Err(_) => return TaskOutcome::Failure(WorkerError::Timeout.to_string()),
        };

        let delivery = match &self.transport {
            Transport::Local { root, verify } => {
                self.copy_local(source, task, root, *verify, size).await
            }
            Transport::Ftp(client) => self.upload_ftp(source, task, client, size).await,
        };

        match delivery {
            Ok(Delivery::Transferred(bytes)) => {
                info!(
                    task = %task.id(),
                    source = %src.display(),
                    target = %task.target_path().display(),
                    bytes,
                    "transfer verified"
                );
                self.backup(task).await;
                TaskOutcome::Success
            }
            Ok(Delivery::TargetExists) => {
                info!(task = %task.id(), target = %task.target_path().display(), "target exists, skipping");
                TaskOutcome::Skipped(SKIP_TARGET_EXISTS.into())
            }
            Err(e) => {
                warn!(task = %task.id(), source = %src.display(), error = %e, "transfer failed");
                TaskOutcome::Failure(e.to_string())
            }
        }
    }

    async fn copy_local(
        &self,
        source: &dyn TaskSource,
        task: &UploadTask,
        root: &Path,
        verify: Option<HashAlgorithm>,
        size: u64,
    ) -> Result<Delivery, WorkerError> {
        if !check_path_accessible(root, self.probe_timeout).await {
            self.set_reachable(false);
            return Err(WorkerError::Unreachable(root.to_path_buf()));
        }
        self.set_reachable(true);

        let target = task.target_path();
        if timeout(self.probe_timeout, tokio::fs::try_exists(target)).await?? {
            return Ok(Delivery::TargetExists);
        }

        let mut gate = ProgressGate::default();
        let copied = copy_verified(
            task.source_path(),
            target,
            size,
            self.io_timeout,
            verify,
            |done, total| self.report_progress(source, task, &mut gate, done, total),
        )
        .await?;
        Ok(Delivery::Transferred(copied))
    }

    async fn upload_ftp(
        &self,
        source: &dyn TaskSource,
        task: &UploadTask,
        client: &FtpClient,
        size: u64,
    ) -> Result<Delivery, WorkerError> {
        let remote = task
            .target_path()
            .to_str()
            .ok_or_else(|| WorkerError::InvalidTarget(task.target_path().to_path_buf()))?;

        let mut gate = ProgressGate::default();
        self.report_progress(source, task, &mut gate, 0, size);

        let (progress_tx, mut progress_rx) = mpsc::channel(32);
        let upload =
            client.upload_file_with_progress(task.source_path(), Some(remote), Some(progress_tx));
        tokio::pin!(upload);

        let result = loop {
            tokio::select! {
                biased;
                result = &mut upload => break result,
                Some(p) = progress_rx.recv() => {
                    self.report_progress(source, task, &mut gate, p.bytes_sent, p.total_bytes);
                }
            }
        };

        match result {
            Ok(bytes) => {
                self.set_reachable(true);
                if bytes != size {
                    return Err(WorkerError::SizeMismatch {
                        expected: size,
                        actual: bytes,
                    });
                }
                self.report_progress(source, task, &mut gate, size, size);
                Ok(Delivery::Transferred(bytes))
            }
            Err(e) => {
                if matches!(e, FtpError::Io(_) | FtpError::Timeout) {
                    self.set_reachable(false);
                } else if !e.is_local() {
                    self.set_reachable(true);
                }
                Err(e.into())
            }
        }
    }

    /// Moves the source into its backup location. A file already at that
    /// location is kept and the source lands beside it as `<stem> (n).<ext>`.
    /// Failure leaves the source in place and does not change the outcome.
    async fn backup(&self, task: &UploadTask) {
        let Some(backup) = task.backup_path() else {
            return;
        };
        let src = task.source_path();

        match ferry_ftp::relocate_unique(src, backup).await {
            Ok(stored) => {
                if stored != backup {
                    info!(source = %src.display(), backup = %stored.display(), "backup name taken, stored beside it");
                } else {
                    debug!(source = %src.display(), backup = %stored.display(), "source backed up");
                }
            }
            Err(e) => {
                warn!(source = %src.display(), backup = %backup.display(), error = %e, "backup move failed, source left in place");
                self.emit(WorkerEvent::Log(format!(
                    "backup of {} failed: {e}",
                    src.display()
                )));
            }
        }
    }
}
