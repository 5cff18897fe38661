//! FTP server role.
//!
//! Binds the control port, admits connections against a global and a
//! per-peer ceiling, and runs one [`Session`](crate::session) task per
//! admitted peer. Rejected peers receive a distinct `421` reply and are
//! disconnected immediately.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::FtpError;
use crate::reply::{Reply, write_reply};
use crate::session::{Session, SessionContext};

/// Point-in-time server status.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub address: Option<SocketAddr>,
    pub connections: usize,
    pub root: PathBuf,
    pub tls_enabled: bool,
    pub max_cons: usize,
    pub max_cons_per_ip: usize,
}

/// The FTP server.
pub struct FtpServer {
    config: Arc<ServerConfig>,
    acceptor: Option<TlsAcceptor>,
    tracker: Arc<ConnectionTracker>,
    inner: Mutex<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    cancel: Option<CancellationToken>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl FtpServer {
    /// Validates the configuration and loads TLS material when enabled.
    pub fn new(config: ServerConfig) -> Result<Self, FtpError> {
        config.validate()?;
        let acceptor = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) if config.enable_tls => {
                Some(crate::stream::load_acceptor(cert, key)?)
            }
            _ => None,
        };
        let tracker = Arc::new(ConnectionTracker::new(
            config.max_cons,
            config.max_cons_per_ip,
        ));
        Ok(Self {
            config: Arc::new(config),
            acceptor,
            tracker,
            inner: Mutex::new(ServerInner::default()),
        })
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, ServerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the control port and starts accepting connections.
    ///
    /// Bind failures are returned as-is; the server never retries.
    pub async fn start(&self) -> Result<SocketAddr, FtpError> {
        if self.is_running() {
            return Err(FtpError::AlreadyRunning);
        }

        tokio::fs::create_dir_all(&self.config.root).await?;
        let root = tokio::fs::canonicalize(&self.config.root).await?;

        let port = self.config.port;
        let listener = TcpListener::bind((self.config.host.as_str(), port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => FtpError::PermissionDenied { port },
                std::io::ErrorKind::AddrInUse => FtpError::PortInUse { port },
                _ => FtpError::Io(e),
            })?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(SessionContext {
            config: Arc::clone(&self.config),
            acceptor: self.acceptor.clone(),
            root,
        });
        let cancel = CancellationToken::new();

        let mut inner = self.inner();
        if inner.cancel.is_some() {
            return Err(FtpError::AlreadyRunning);
        }
        inner.task = Some(tokio::spawn(accept_loop(
            listener,
            ctx,
            Arc::clone(&self.tracker),
            cancel.clone(),
        )));
        inner.cancel = Some(cancel);
        inner.local_addr = Some(local_addr);
        drop(inner);

        info!(
            %local_addr,
            root = %self.config.root.display(),
            tls = self.acceptor.is_some(),
            "FTP server listening"
        );
        Ok(local_addr)
    }

    /// Closes every session and releases the listening port.
    ///
    /// Does nothing when the server is not running.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut inner = self.inner();
            inner.local_addr = None;
            (inner.cancel.take(), inner.task.take())
        };
        let Some(cancel) = cancel else {
            debug!("stop requested but server is not running");
            return;
        };
        cancel.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("FTP server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner().cancel.is_some()
    }

    /// Bound address, available while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner().local_addr
    }

    /// Number of currently admitted connections.
    pub fn connection_count(&self) -> usize {
        self.tracker.total()
    }

    pub fn status(&self) -> ServerStatus {
        let inner = self.inner();
        ServerStatus {
            running: inner.cancel.is_some(),
            address: inner.local_addr,
            connections: self.tracker.total(),
            root: self.config.root.clone(),
            tls_enabled: self.acceptor.is_some(),
            max_cons: self.config.max_cons,
            max_cons_per_ip: self.config.max_cons_per_ip,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    tracker: Arc<ConnectionTracker>,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            result = listener.accept() => match result {
                Ok((stream, peer)) => match tracker.try_admit(peer.ip()) {
                    Ok(guard) => {
                        debug!(%peer, connections = tracker.total(), "connection admitted");
                        let session = Session::new(Arc::clone(&ctx), peer, cancel.child_token());
                        sessions.spawn(async move {
                            let _guard = guard;
                            if let Err(e) = session.run(stream).await {
                                warn!(%peer, "session ended with error: {e}");
                            }
                        });
                    }
                    Err(rejection) => {
                        warn!(%peer, %rejection, "connection rejected");
                        sessions.spawn(reject(stream, rejection));
                    }
                },
                Err(e) => {
                    warn!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    // Release the port before waiting for sessions to wind down.
    drop(listener);
    while sessions.join_next().await.is_some() {}
}

async fn reject(mut stream: TcpStream, rejection: Rejection) {
    let reply = rejection.reply();
    let _ = tokio::time::timeout(Duration::from_secs(5), write_reply(&mut stream, &reply)).await;
    let _ = stream.shutdown().await;
}

/// Why a connection was refused at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    Global,
    PerPeer,
}

impl Rejection {
    fn reply(self) -> Reply {
        match self {
            Rejection::Global => Reply::new(421, "Too many connections."),
            Rejection::PerPeer => Reply::new(421, "Too many connections from this IP."),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Global => f.write_str("global connection limit reached"),
            Rejection::PerPeer => f.write_str("per-peer connection limit reached"),
        }
    }
}

/// Counts admitted connections, globally and per peer address.
pub(crate) struct ConnectionTracker {
    max_total: usize,
    max_per_ip: usize,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

impl ConnectionTracker {
    pub(crate) fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            max_total,
            max_per_ip,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn total(&self) -> usize {
        self.state().total
    }

    pub(crate) fn try_admit(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionGuard, Rejection> {
        let mut state = self.state();
        if state.total >= self.max_total {
            return Err(Rejection::Global);
        }
        let count = state.per_ip.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(Rejection::PerPeer);
        }
        *count += 1;
        state.total += 1;
        Ok(ConnectionGuard {
            tracker: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut state = self.state();
        state.total = state.total.saturating_sub(1);
        if let Some(count) = state.per_ip.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                state.per_ip.remove(&ip);
            }
        }
    }
}

/// Releases its admission slot on drop.
pub(crate) struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.ip);
    }
}
