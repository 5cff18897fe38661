//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ferry_dedup::DedupService;
use ferry_ftp::{FolderMonitor, FtpClient, FtpServer, MonitorConfig, MonitorEvent};
use ferry_upload::{TaskState, UploadEvent, UploadManager, UploadResult, UploadTask};
use ferry_worker::{DEFAULT_IO_TIMEOUT, Destination, Worker, WorkerConfig, WorkerEvent, scan_files};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::UploadArgs;
use crate::config::FerryConfig;

/// One scan → dedup → enqueue → transfer pass.
pub async fn upload(config: FerryConfig, args: UploadArgs) -> anyhow::Result<()> {
    let general = &config.general;
    let source_root = args.source.unwrap_or_else(|| general.source_folder.clone());

    let scan = scan_files(&source_root, &general.extensions, config.probe_timeout()).await?;
    let mut files = tokio::task::spawn_blocking(move || scan.iter().collect::<Vec<_>>()).await?;
    files.sort();
    info!(source = %source_root.display(), files = files.len(), "source scanned");

    let (destination, target_root) = if args.ftp {
        (Destination::Ftp(config.ftp_client.clone()), None)
    } else {
        let root = args.target.unwrap_or_else(|| general.target_folder.clone());
        let verify_digest = general.verify_copies.then_some(general.hash_algorithm);
        (
            Destination::Local {
                root: root.clone(),
                verify_digest,
            },
            Some(root),
        )
    };

    if args.dedup || general.enable_deduplication {
        match &target_root {
            Some(root) => {
                let mut dedup = DedupService::new();
                dedup.enable_deduplication(true, general.hash_algorithm);
                let root = root.clone();
                let before = files.len();
                files = tokio::task::spawn_blocking(move || dedup.filter_duplicates(&files, &root))
                    .await??;
                info!(dropped = before - files.len(), "duplicates filtered");
            }
            None => info!("deduplication needs a local target, skipped"),
        }
    }

    let sized = tokio::task::spawn_blocking(move || {
        files
            .into_iter()
            .map(|file| {
                let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
                (file, size)
            })
            .collect::<Vec<_>>()
    })
    .await?;

    let mut manager = UploadManager::new();
    let upload_events = manager.take_events().context("upload events already taken")?;
    let manager = Arc::new(manager);

    let backup_root = (general.enable_backup && !args.no_backup).then(|| general.backup_folder.clone());
    for (file, size) in &sized {
        let rel = file.strip_prefix(&source_root).unwrap_or(file);
        let target = match &target_root {
            Some(root) => root.join(rel),
            None => PathBuf::from(remote_path(&config.ftp_client.remote_path, rel)),
        };
        let mut task = UploadTask::new(file, target)
            .with_max_retries(config.max_retries())
            .with_size(*size);
        if let Some(backup) = &backup_root {
            task = task.with_backup(backup.join(rel));
        }
        manager.add_task(task)?;
    }

    let guarded: Vec<PathBuf> = target_root.iter().chain(backup_root.iter()).cloned().collect();
    let mut worker = Worker::new(WorkerConfig {
        io_timeout: DEFAULT_IO_TIMEOUT,
        probe_timeout: config.probe_timeout(),
        auto_pause: general.network_auto_pause,
        disk_guard: config.disk_guard(guarded),
        ..WorkerConfig::new(destination)
    })?;
    let worker_events = worker.take_events().context("worker events already taken")?;
    let worker = Arc::new(worker);

    manager.start_session()?;
    let watcher = tokio::spawn(watch_upload_events(
        upload_events,
        Arc::clone(&manager),
        Arc::clone(&worker),
    ));
    let logger = tokio::spawn(log_worker_events(worker_events));
    let interrupt = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing the current file");
                worker.stop();
            }
        })
    };

    worker.start(manager.clone())?;
    let processed = worker.join().await;
    interrupt.abort();
    debug!(processed, "worker finished");

    let result = manager.end_session();
    let _ = watcher.await;
    let _ = logger.await;

    print_summary(&result, manager.queue_size());
    Ok(())
}

/// `<remote_root>/<relative path with forward slashes>`.
fn remote_path(remote_root: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy().replace('\\', "/");
    format!("{}/{}", remote_root.trim_end_matches('/'), rel)
}

async fn watch_upload_events(
    mut rx: mpsc::UnboundedReceiver<UploadEvent>,
    manager: Arc<UploadManager>,
    worker: Arc<Worker>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::Log(message) => info!("{message}"),
            UploadEvent::Started(task) => {
                debug!(source = %task.source_path().display(), attempt = task.retry_count() + 1, "uploading");
            }
            UploadEvent::Requeued { task, error } => {
                warn!(source = %task.source_path().display(), retry = task.retry_count(), error = %error, "will retry");
            }
            UploadEvent::Completed { task, .. } => {
                if task.state() == TaskState::Failed && manager.should_pause() {
                    warn!(
                        failures = manager.consecutive_failures(),
                        "too many consecutive failures, stopping"
                    );
                    worker.stop();
                }
            }
            UploadEvent::OverallProgress(fraction) => {
                debug!(percent = (fraction * 100.0).round() as u32, "overall progress");
            }
            UploadEvent::Progress { .. } | UploadEvent::Stats(_) => {}
            UploadEvent::SessionEnded(_) => break,
        }
    }
}

async fn log_worker_events(mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            WorkerEvent::FileProgress {
                source, fraction, ..
            } => {
                debug!(source = %source.display(), percent = (fraction * 100.0).round() as u32, "file progress");
            }
            WorkerEvent::Reachability(reachable) => info!(reachable, "destination reachability changed"),
            WorkerEvent::Held(reason) => warn!(%reason, "transfers paused"),
            WorkerEvent::Released => info!("transfers resumed"),
            WorkerEvent::Log(message) => warn!("{message}"),
            WorkerEvent::Stopped { .. } => break,
            WorkerEvent::TaskStarted { .. } | WorkerEvent::TaskFinished { .. } => {}
        }
    }
}

fn print_summary(result: &UploadResult, pending: usize) {
    println!(
        "{} uploaded, {} failed, {} skipped, {} not attempted (of {})",
        result.success_files.len(),
        result.failed_files.len(),
        result.skipped_files.len(),
        pending,
        result.total_files
    );
    if let Some(duration) = result.duration() {
        println!(
            "{} bytes in {:.1}s ({:.2} MiB/s)",
            result.transferred_bytes,
            duration.num_milliseconds() as f64 / 1000.0,
            result.average_speed_mbps()
        );
    }
    for (path, error) in &result.failed_files {
        println!("  failed: {} ({error})", path.display());
    }
}

pub async fn serve(config: FerryConfig) -> anyhow::Result<()> {
    let server = FtpServer::new(config.ftp_server)?;
    let addr = server.start().await?;
    info!(%addr, "serving, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}

pub async fn monitor(config: FerryConfig, interval: Option<u64>) -> anyhow::Result<()> {
    let client = Arc::new(FtpClient::new(config.ftp_client.clone())?);
    let report = client.test_connection().await;
    if !report.ok {
        warn!(message = %report.message, "server not reachable yet, monitoring anyway");
    }

    let interval = interval
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.upload_interval());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = FolderMonitor::new(
        client,
        MonitorConfig {
            source_dir: config.general.source_folder.clone(),
            backup_dir: config.general.backup_folder.clone(),
            extensions: config.general.extensions.clone(),
        },
        Some(tx),
    );

    let logger = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                MonitorEvent::Uploaded { path, remote, bytes } => {
                    info!(path = %path.display(), remote = %remote, bytes, "uploaded");
                }
                MonitorEvent::Failed { path, error } => {
                    warn!(path = %path.display(), error = %error, "upload failed");
                }
                MonitorEvent::BackupFailed { path, error } => {
                    warn!(path = %path.display(), error = %error, "backup failed");
                }
                MonitorEvent::BackedUp { .. } => {}
                MonitorEvent::PassCompleted { uploaded, failed } => {
                    if uploaded + failed > 0 {
                        info!(uploaded, failed, "pass completed");
                    }
                }
            }
        }
    });

    monitor.start_monitoring(interval).await;
    tokio::signal::ctrl_c().await?;
    info!("stopping, waiting for the current upload");
    monitor.stop_monitoring().await;
    logger.abort();
    Ok(())
}

pub async fn test_connection(config: FerryConfig) -> anyhow::Result<()> {
    let client = FtpClient::new(config.ftp_client)?;
    let report = client.test_connection().await;
    if !report.ok {
        anyhow::bail!("connection test failed: {}", report.message);
    }
    println!("{}", report.message);
    Ok(())
}
