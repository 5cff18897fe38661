//! Server-side handling of one control connection.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{Command, format_host_port};
use crate::config::ServerConfig;
use crate::error::FtpError;
use crate::reply::{Reply, read_line, write_reply};
use crate::stream::{BoxedIo, accept_tls};
use crate::{DATA_CONNECT_TIMEOUT, TRANSFER_BUFFER_SIZE};

/// Shared, read-only state for all sessions of one server run.
pub(crate) struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub acceptor: Option<TlsAcceptor>,
    /// Canonical upload root.
    pub root: PathBuf,
}

type Control = BufReader<BoxedIo>;

enum DataSetup {
    None,
    Passive(TcpListener),
    Active(SocketAddr),
}

/// Distinguishes temporary `STOR` files of concurrent sessions.
static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// `STOR`: received into a stage, renamed over the target when complete.
    Replace,
    /// `APPE`: appended to the target in place; bytes received before an
    /// abort stay.
    Append,
}

enum Flow {
    Continue,
    StartTls,
    Quit,
}

enum Input {
    Line(String),
    Eof,
    Idle,
    Shutdown,
}

pub(crate) struct Session {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    cancel: CancellationToken,
    local_ip: Option<IpAddr>,
    pending_user: Option<String>,
    authenticated: bool,
    tls_active: bool,
    protect_data: bool,
    /// Virtual working directory, always absolute.
    cwd: String,
    data: DataSetup,
    /// Source accepted by the `RNFR` immediately preceding.
    rename_from: Option<(String, PathBuf)>,
}

impl Session {
    pub(crate) fn new(ctx: Arc<SessionContext>, peer: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            peer,
            cancel,
            local_ip: None,
            pending_user: None,
            authenticated: false,
            tls_active: false,
            protect_data: false,
            cwd: "/".into(),
            data: DataSetup::None,
            rename_from: None,
        }
    }

    pub(crate) async fn run(mut self, stream: TcpStream) -> Result<(), FtpError> {
        self.local_ip = Some(stream.local_addr()?.ip());
        let peer = self.peer;
        let mut control: Control = BufReader::new(Box::new(stream));
        write_reply(&mut control, &Reply::new(220, self.ctx.config.banner.clone())).await?;

        let idle = self.ctx.config.idle_timeout();
        loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Input::Shutdown,
                result = timeout(idle, read_line(&mut control)) => match result {
                    Err(_) => Input::Idle,
                    Ok(line) => match line? {
                        Some(line) => Input::Line(line),
                        None => Input::Eof,
                    },
                },
            };

            let line = match input {
                Input::Line(line) => line,
                Input::Eof => {
                    debug!(%peer, "client closed control connection");
                    return Ok(());
                }
                Input::Idle => {
                    info!(%peer, "closing idle control connection");
                    let reply = Reply::new(421, "Idle timeout, closing control connection.");
                    let _ = write_reply(&mut control, &reply).await;
                    return Ok(());
                }
                Input::Shutdown => {
                    let reply = Reply::new(421, "Server shutting down.");
                    let _ = write_reply(&mut control, &reply).await;
                    return Ok(());
                }
            };

            if line.len() >= 4 && line[..4].eq_ignore_ascii_case("PASS") {
                debug!(%peer, "<- PASS ****");
            } else {
                debug!(%peer, "<- {line}");
            }

            match self.dispatch(Command::parse(&line), &mut control).await? {
                Flow::Continue => {}
                Flow::Quit => return Ok(()),
                Flow::StartTls => {
                    let Some(acceptor) = self.ctx.acceptor.clone() else {
                        continue;
                    };
                    let io = control.into_inner();
                    let tls = timeout(DATA_CONNECT_TIMEOUT, accept_tls(&acceptor, io)).await??;
                    control = BufReader::new(tls);
                    self.tls_active = true;
                    debug!(%peer, "control connection upgraded to TLS");
                }
            }
        }
    }

    async fn dispatch(&mut self, command: Command, control: &mut Control) -> Result<Flow, FtpError> {
        if !self.authenticated && !command.allowed_before_login() {
            let reply = Reply::new(530, "Please login with USER and PASS.");
            write_reply(control, &reply).await?;
            return Ok(Flow::Continue);
        }

        let tls_enabled = self.ctx.acceptor.is_some();
        let rename_from = self.rename_from.take();
        let reply = match command {
            Command::User(name) => {
                if tls_enabled && !self.tls_active {
                    Reply::new(534, "Policy requires AUTH TLS before login.")
                } else {
                    self.authenticated = false;
                    self.pending_user = Some(name);
                    Reply::new(331, "Password required.")
                }
            }
            Command::Pass(password) => self.login(password),
            Command::Auth(mechanism) => {
                let mechanism = mechanism.to_ascii_uppercase();
                if !tls_enabled {
                    Reply::new(502, "TLS is not enabled on this server.")
                } else if self.tls_active {
                    Reply::new(503, "TLS is already active.")
                } else if matches!(mechanism.as_str(), "TLS" | "TLS-C" | "SSL") {
                    write_reply(control, &Reply::new(234, "AUTH TLS successful.")).await?;
                    return Ok(Flow::StartTls);
                } else {
                    Reply::new(504, "Unsupported AUTH mechanism.")
                }
            }
            Command::Pbsz(_) if self.tls_active => Reply::new(200, "PBSZ=0"),
            Command::Pbsz(_) => Reply::new(503, "PBSZ requires AUTH first."),
            Command::Prot(level) => match (self.tls_active, level.to_ascii_uppercase().as_str()) {
                (false, _) => Reply::new(503, "PROT requires AUTH first."),
                (true, "P") => {
                    self.protect_data = true;
                    Reply::new(200, "Protection level set to Private.")
                }
                (true, "C") => {
                    self.protect_data = false;
                    Reply::new(200, "Protection level set to Clear.")
                }
                _ => Reply::new(504, "Unsupported protection level."),
            },
            Command::Feat => {
                let mut lines = vec!["Features:".to_string()];
                if tls_enabled {
                    lines.extend([" AUTH TLS".into(), " PBSZ".into(), " PROT".into()]);
                }
                lines.extend([" PASV".into(), " SIZE".into(), " UTF8".into(), "End".into()]);
                Reply::multiline(211, lines)
            }
            Command::Syst => Reply::new(215, "UNIX Type: L8"),
            Command::Noop => Reply::new(200, "NOOP ok."),
            Command::Quit => {
                write_reply(control, &Reply::new(221, "Goodbye.")).await?;
                return Ok(Flow::Quit);
            }
            Command::Type(kind) => match kind.to_ascii_uppercase().as_str() {
                "I" | "L 8" => Reply::new(200, "Switching to Binary mode."),
                "A" | "A N" => Reply::new(200, "Switching to ASCII mode."),
                _ => Reply::new(504, "Unsupported type."),
            },
            Command::Mode(mode) if mode.eq_ignore_ascii_case("S") => {
                Reply::new(200, "Mode set to S.")
            }
            Command::Mode(_) => Reply::new(504, "Unsupported transfer mode."),
            Command::Stru(stru) if stru.eq_ignore_ascii_case("F") => {
                Reply::new(200, "Structure set to F.")
            }
            Command::Stru(_) => Reply::new(504, "Unsupported file structure."),
            Command::Pwd => Reply::new(257, format!("\"{}\" is the current directory.", self.cwd)),
            Command::Cwd(path) => self.change_dir(&path).await,
            Command::Cdup => self.change_dir("..").await,
            Command::Mkd(path) => self.make_dir(&path).await,
            Command::Size(path) => self.size(&path).await,
            Command::Pasv => self.enter_passive().await,
            Command::Port(addr) => self.set_active(addr),
            Command::Stor(path) => self.store(&path, WriteMode::Replace, control).await?,
            Command::Appe(path) => self.store(&path, WriteMode::Append, control).await?,
            Command::Dele(path) => self.delete(&path).await,
            Command::Rnfr(path) => self.rename_source(&path).await,
            Command::Rnto(path) => self.rename_target(rename_from, &path).await,
            Command::Nlst(path) => self.list(path.as_deref(), false, control).await?,
            Command::List(path) => self.list(path.as_deref(), true, control).await?,
            Command::Malformed(verb) => {
                Reply::new(501, format!("Syntax error in parameters for {verb}."))
            }
            Command::Unknown(verb) => Reply::new(502, format!("Command {verb} not implemented.")),
        };

        write_reply(control, &reply).await?;
        Ok(Flow::Continue)
    }

    fn login(&mut self, password: String) -> Reply {
        let config = &self.ctx.config;
        match self.pending_user.take() {
            None => Reply::new(503, "Login with USER first."),
            Some(user) if user == config.username && password == config.password => {
                self.authenticated = true;
                info!(peer = %self.peer, %user, "login successful");
                Reply::new(230, "Login successful.")
            }
            Some(user) => {
                warn!(peer = %self.peer, %user, "login failed");
                Reply::new(530, "Login incorrect.")
            }
        }
    }

    /// Maps a client path onto the upload root.
    ///
    /// Returns the normalized virtual path and the real path. Paths that
    /// would climb above the root are refused rather than clamped.
    fn resolve(&self, arg: &str) -> Result<(String, PathBuf), FtpError> {
        if arg.contains('\0') || arg.contains('\\') {
            return Err(FtpError::InvalidPath(format!("illegal character in {arg:?}")));
        }
        let joined = if arg.starts_with('/') {
            arg.to_string()
        } else {
            format!("{}/{}", self.cwd, arg)
        };

        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if parts.pop().is_none() {
                        return Err(FtpError::InvalidPath(format!(
                            "{arg} escapes the upload root"
                        )));
                    }
                }
                part => {
                    let mut components = Path::new(part).components();
                    if !matches!(
                        (components.next(), components.next()),
                        (Some(Component::Normal(_)), None)
                    ) {
                        return Err(FtpError::InvalidPath(format!("illegal component {part:?}")));
                    }
                    parts.push(part);
                }
            }
        }

        let virtual_path = format!("/{}", parts.join("/"));
        let mut real = self.ctx.root.clone();
        real.extend(&parts);
        Ok((virtual_path, real))
    }

    async fn change_dir(&mut self, arg: &str) -> Reply {
        let Ok((virtual_path, real)) = self.resolve(arg) else {
            return Reply::new(550, "No such directory.");
        };
        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_dir() => {
                let reply = Reply::new(250, format!("Directory changed to {virtual_path}."));
                self.cwd = virtual_path;
                reply
            }
            _ => Reply::new(550, "No such directory."),
        }
    }

    async fn make_dir(&self, arg: &str) -> Reply {
        let Ok((virtual_path, real)) = self.resolve(arg) else {
            return Reply::new(553, "Directory name not allowed.");
        };
        match tokio::fs::create_dir(&real).await {
            Ok(()) => {
                debug!(peer = %self.peer, path = %virtual_path, "directory created");
                Reply::new(257, format!("\"{virtual_path}\" created."))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Reply::new(550, "Directory already exists.")
            }
            Err(e) => {
                warn!(peer = %self.peer, path = %virtual_path, "mkdir failed: {e}");
                Reply::new(550, "Create directory operation failed.")
            }
        }
    }

    async fn size(&self, arg: &str) -> Reply {
        let Ok((_, real)) = self.resolve(arg) else {
            return Reply::new(550, "Could not get file size.");
        };
        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => Reply::new(213, meta.len().to_string()),
            _ => Reply::new(550, "Could not get file size."),
        }
    }

    async fn enter_passive(&mut self) -> Reply {
        // Drop any previously opened listener first so its port is reusable.
        self.data = DataSetup::None;

        let ip = match self.local_ip {
            Some(IpAddr::V4(ip)) => ip,
            Some(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
                Some(ip) => ip,
                None => return Reply::new(425, "Passive mode requires IPv4."),
            },
            None => return Reply::new(425, "Can't open passive connection."),
        };

        for port in self.ctx.config.passive_ports.iter() {
            if let Ok(listener) = TcpListener::bind((ip, port)).await {
                debug!(peer = %self.peer, port, "passive listener bound");
                self.data = DataSetup::Passive(listener);
                let addr = format_host_port(SocketAddrV4::new(ip, port));
                return Reply::new(227, format!("Entering Passive Mode ({addr})."));
            }
        }

        warn!(peer = %self.peer, "no free port in passive range");
        Reply::new(425, "Can't open passive connection: no free port in range.")
    }

    fn set_active(&mut self, addr: SocketAddrV4) -> Reply {
        // Refuse third-party targets (FTP bounce).
        let same_peer = match self.peer.ip() {
            IpAddr::V4(ip) => ip == *addr.ip(),
            IpAddr::V6(ip) => ip.to_ipv4_mapped() == Some(*addr.ip()),
        };
        if !same_peer {
            return Reply::new(501, "Rejected PORT address.");
        }
        self.data = DataSetup::Active(SocketAddr::V4(addr));
        Reply::new(200, "PORT command successful.")
    }

    async fn open_data(&mut self) -> Result<BoxedIo, FtpError> {
        let stream = match std::mem::replace(&mut self.data, DataSetup::None) {
            DataSetup::Passive(listener) => {
                let (stream, addr) = timeout(DATA_CONNECT_TIMEOUT, listener.accept()).await??;
                if addr.ip() != self.peer.ip() {
                    return Err(FtpError::Protocol(format!(
                        "data connection from unexpected peer {addr}"
                    )));
                }
                stream
            }
            DataSetup::Active(addr) => {
                timeout(DATA_CONNECT_TIMEOUT, TcpStream::connect(addr)).await??
            }
            DataSetup::None => {
                return Err(FtpError::Protocol("no data connection prepared".into()));
            }
        };

        let io: BoxedIo = Box::new(stream);
        match &self.ctx.acceptor {
            Some(acceptor) if self.protect_data => {
                timeout(DATA_CONNECT_TIMEOUT, accept_tls(acceptor, io)).await?
            }
            _ => Ok(io),
        }
    }

    async fn store(
        &mut self,
        arg: &str,
        mode: WriteMode,
        control: &mut Control,
    ) -> Result<Reply, FtpError> {
        let Ok((virtual_path, real)) = self.resolve(arg) else {
            self.data = DataSetup::None;
            return Ok(Reply::new(553, "File name not allowed."));
        };
        if matches!(self.data, DataSetup::None) {
            return Ok(Reply::new(425, "Use PORT or PASV first."));
        }

        let written = match mode {
            WriteMode::Replace => stage_path(&real),
            WriteMode::Append => real.clone(),
        };
        let opened = match mode {
            WriteMode::Replace => tokio::fs::File::create(&written).await,
            WriteMode::Append => {
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&written)
                    .await
            }
        };
        let mut file = match opened {
            Ok(file) => file,
            Err(e) => {
                warn!(peer = %self.peer, path = %virtual_path, "cannot create file: {e}");
                self.data = DataSetup::None;
                return Ok(Reply::new(553, "Could not create file."));
            }
        };

        write_reply(control, &Reply::new(150, "Ok to send data.")).await?;

        let mut data = match self.open_data().await {
            Ok(data) => data,
            Err(e) => {
                warn!(peer = %self.peer, "data connection failed: {e}");
                drop(file);
                if mode == WriteMode::Replace {
                    discard_stage(&written).await;
                }
                return Ok(Reply::new(425, "Can't open data connection."));
            }
        };

        let received = self.receive(&mut data, &mut file).await;
        drop(file);
        match received {
            Ok(bytes) => {
                if mode == WriteMode::Replace
                    && let Err(e) = tokio::fs::rename(&written, &real).await
                {
                    warn!(peer = %self.peer, path = %virtual_path, "cannot move upload into place: {e}");
                    discard_stage(&written).await;
                    return Ok(Reply::new(451, "Could not store file."));
                }
                info!(peer = %self.peer, path = %virtual_path, bytes, "file stored");
                Ok(Reply::new(226, "Transfer complete."))
            }
            Err(e) => {
                warn!(peer = %self.peer, path = %virtual_path, "upload aborted: {e}");
                if mode == WriteMode::Replace {
                    discard_stage(&written).await;
                }
                Ok(Reply::new(426, "Connection closed; transfer aborted."))
            }
        }
    }

    async fn delete(&self, arg: &str) -> Reply {
        let Ok((virtual_path, real)) = self.resolve(arg) else {
            return Reply::new(550, "File name not allowed.");
        };
        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => match tokio::fs::remove_file(&real).await {
                Ok(()) => {
                    debug!(peer = %self.peer, path = %virtual_path, "file deleted");
                    Reply::new(250, "Delete operation successful.")
                }
                Err(e) => {
                    warn!(peer = %self.peer, path = %virtual_path, "delete failed: {e}");
                    Reply::new(550, "Delete operation failed.")
                }
            },
            _ => Reply::new(550, "No such file."),
        }
    }

    async fn rename_source(&mut self, arg: &str) -> Reply {
        let Ok((virtual_path, real)) = self.resolve(arg) else {
            return Reply::new(550, "File name not allowed.");
        };
        if virtual_path == "/" || !tokio::fs::try_exists(&real).await.unwrap_or(false) {
            return Reply::new(550, "No such file or directory.");
        }
        self.rename_from = Some((virtual_path, real));
        Reply::new(350, "Ready for RNTO.")
    }

    async fn rename_target(&self, from: Option<(String, PathBuf)>, arg: &str) -> Reply {
        let Some((from_virtual, from_real)) = from else {
            return Reply::new(503, "RNFR required first.");
        };
        let Ok((to_virtual, to_real)) = self.resolve(arg) else {
            return Reply::new(553, "File name not allowed.");
        };
        if to_virtual == "/" {
            return Reply::new(553, "File name not allowed.");
        }
        match tokio::fs::rename(&from_real, &to_real).await {
            Ok(()) => {
                debug!(peer = %self.peer, from = %from_virtual, to = %to_virtual, "renamed");
                Reply::new(250, "Rename successful.")
            }
            Err(e) => {
                warn!(peer = %self.peer, from = %from_virtual, to = %to_virtual, "rename failed: {e}");
                Reply::new(550, "Rename failed.")
            }
        }
    }

    async fn receive(&self, data: &mut BoxedIo, file: &mut tokio::fs::File) -> Result<u64, FtpError> {
        let idle = self.ctx.config.idle_timeout();
        let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FtpError::Cancelled),
                result = timeout(idle, data.read(&mut buf)) => result??,
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        file.flush().await?;
        Ok(total)
    }

    async fn list(
        &mut self,
        arg: Option<&str>,
        long: bool,
        control: &mut Control,
    ) -> Result<Reply, FtpError> {
        let Ok((_, real)) = self.resolve(arg.unwrap_or(".")) else {
            self.data = DataSetup::None;
            return Ok(Reply::new(550, "No such file or directory."));
        };
        if matches!(self.data, DataSetup::None) {
            return Ok(Reply::new(425, "Use PORT or PASV first."));
        }
        let listing = match render_listing(&real, long).await {
            Ok(listing) => listing,
            Err(_) => {
                self.data = DataSetup::None;
                return Ok(Reply::new(550, "No such file or directory."));
            }
        };

        write_reply(control, &Reply::new(150, "Here comes the directory listing.")).await?;
        let mut data = match self.open_data().await {
            Ok(data) => data,
            Err(e) => {
                warn!(peer = %self.peer, "data connection failed: {e}");
                return Ok(Reply::new(425, "Can't open data connection."));
            }
        };
        let sent = async {
            data.write_all(listing.as_bytes()).await?;
            data.shutdown().await
        };
        match sent.await {
            Ok(()) => Ok(Reply::new(226, "Directory send OK.")),
            Err(e) => {
                warn!(peer = %self.peer, "listing transfer failed: {e}");
                Ok(Reply::new(426, "Connection closed; transfer aborted."))
            }
        }
    }
}

/// Hidden sibling a `STOR` into `real` is received into.
fn stage_path(real: &Path) -> PathBuf {
    let name = real
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    real.with_file_name(format!(".{name}.{n}.incoming"))
}

async fn discard_stage(stage: &Path) {
    if let Err(e) = tokio::fs::remove_file(stage).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(stage = %stage.display(), "cannot remove aborted upload: {e}");
    }
}

async fn render_listing(path: &Path, long: bool) -> std::io::Result<String> {
    let meta = tokio::fs::metadata(path).await?;
    let mut entries = Vec::new();
    if meta.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        entries.push((name, meta));
    } else {
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((name, entry.metadata().await?));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    let mut out = String::new();
    for (name, meta) in entries {
        if long {
            let kind = if meta.is_dir() { 'd' } else { '-' };
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            out.push_str(&format!(
                "{kind}rw-r--r-- 1 ftp ftp {:>12} {} {name}\r\n",
                meta.len(),
                modified.format("%b %d %H:%M"),
            ));
        } else {
            out.push_str(&name);
            out.push_str("\r\n");
        }
    }
    Ok(out)
}
