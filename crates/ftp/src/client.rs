//! FTP client role.
//!
//! Every public operation opens its own control connection and closes it
//! before returning, so no connection outlives the call that created it.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::TRANSFER_BUFFER_SIZE;
use crate::command::{format_host_port, parse_pasv_reply};
use crate::config::ClientConfig;
use crate::error::FtpError;
use crate::reply::{Reply, read_reply};
use crate::stream::{BoxedIo, build_connector, connect_tls, server_name};

/// Client connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Outcome of [`FtpClient::test_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionReport {
    pub ok: bool,
    pub message: String,
}

/// Bytes sent so far for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_sent as f64 / self.total_bytes as f64
        }
    }
}

/// FTP upload client.
pub struct FtpClient {
    config: ClientConfig,
    connector: Option<TlsConnector>,
    state: Mutex<ConnectionState>,
}

impl FtpClient {
    pub fn new(config: ClientConfig) -> Result<Self, FtpError> {
        config.validate()?;
        let connector = if config.enable_tls {
            Some(build_connector(config.ca_file.as_deref())?)
        } else {
            None
        };
        Ok(Self {
            config,
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Default remote location for a local file: `<remote_path>/<file name>`.
    pub fn remote_path_for(&self, local_path: &Path) -> Result<String, FtpError> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FtpError::local(
                    local_path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "no usable file name"),
                )
            })?;
        let root = self.config.remote_path.trim_end_matches('/');
        Ok(format!("{root}/{name}"))
    }

    /// Connects, logs in, lists the remote directory and disconnects.
    pub async fn test_connection(&self) -> ConnectionReport {
        let mut conn = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                return ConnectionReport {
                    ok: false,
                    message: format!("connection failed: {e}"),
                };
            }
        };
        let listing = self.list_names(&mut conn, None).await;
        conn.quit().await;

        match listing {
            Ok(names) => {
                self.set_state(ConnectionState::Disconnected);
                ConnectionReport {
                    ok: true,
                    message: format!(
                        "connected to {}:{} ({} entries)",
                        self.config.host,
                        self.config.port,
                        names.len()
                    ),
                }
            }
            Err(e) => {
                self.set_state(ConnectionState::Faulted);
                ConnectionReport {
                    ok: false,
                    message: format!("listing failed: {e}"),
                }
            }
        }
    }

    /// Lists names in a remote directory (`NLST`).
    pub async fn list(&self, dir: Option<&str>) -> Result<Vec<String>, FtpError> {
        let mut conn = self.connect().await?;
        let result = self.list_names(&mut conn, dir).await;
        conn.quit().await;
        self.finish(&result);
        result
    }

    /// Uploads one file. `remote_path` defaults to [`remote_path_for`](Self::remote_path_for).
    ///
    /// The file is staged remotely as `.<name>.part` and renamed into place
    /// when complete. An interrupted upload leaves the stage behind and the
    /// next upload of the same file resumes from it.
    ///
    /// Returns the size of the stored file.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: Option<&str>,
    ) -> Result<u64, FtpError> {
        self.upload_file_with_progress(local_path, remote_path, None)
            .await
    }

    /// Like [`upload_file`](Self::upload_file), reporting progress on `progress_tx`.
    ///
    /// Progress is sent with `try_send`; a full channel drops updates
    /// instead of slowing the transfer.
    pub async fn upload_file_with_progress(
        &self,
        local_path: &Path,
        remote_path: Option<&str>,
        progress_tx: Option<mpsc::Sender<TransferProgress>>,
    ) -> Result<u64, FtpError> {
        // Local problems surface before any network activity.
        let mut file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| FtpError::local(local_path, e))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| FtpError::local(local_path, e))?;
        if !meta.is_file() {
            return Err(FtpError::local(
                local_path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let remote = match remote_path {
            Some(path) => path.to_string(),
            None => self.remote_path_for(local_path)?,
        };

        let mut conn = self.connect().await?;
        let upload = Upload {
            local_path,
            remote: &remote,
            total: meta.len(),
            progress_tx: progress_tx.as_ref(),
        };
        let result = self.store(&mut conn, &mut file, &upload).await;
        conn.quit().await;
        self.finish(&result);

        match &result {
            Ok(bytes) => info!(
                local = %local_path.display(),
                %remote,
                bytes,
                "upload complete"
            ),
            Err(e) => warn!(local = %local_path.display(), %remote, "upload failed: {e}"),
        }
        result
    }

    fn finish<T>(&self, result: &Result<T, FtpError>) {
        self.set_state(match result {
            Ok(_) => ConnectionState::Disconnected,
            Err(_) => ConnectionState::Faulted,
        });
    }

    /// Opens and authenticates a control connection, retrying `retry_times`
    /// extra times with a linearly growing delay.
    async fn connect(&self) -> Result<ControlConnection, FtpError> {
        self.set_state(ConnectionState::Connecting);
        let attempts = self.config.retry_times + 1;
        let mut last_err = FtpError::Timeout;

        for attempt in 1..=attempts {
            match self.connect_once().await {
                Ok(conn) => {
                    self.set_state(ConnectionState::Connected);
                    debug!(host = %self.config.host, port = self.config.port, attempt, "FTP connected");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(attempt, attempts, "FTP connection failed: {e}");
                    let give_up = matches!(e, FtpError::AuthFailed(_) | FtpError::Tls(_));
                    last_err = e;
                    if give_up {
                        break;
                    }
                    if attempt < attempts {
                        let delay = self.config.retry_delay_secs * u64::from(attempt);
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Faulted);
        Err(last_err)
    }

    async fn connect_once(&self) -> Result<ControlConnection, FtpError> {
        let io_timeout = self.config.timeout();
        let host = self.config.host.as_str();
        let tcp = timeout(io_timeout, TcpStream::connect((host, self.config.port))).await??;
        let peer = tcp.peer_addr()?;
        let local = tcp.local_addr()?;

        let mut conn = ControlConnection {
            stream: BufReader::new(Box::new(tcp)),
            io_timeout,
            peer,
            local,
            tls: false,
        };

        let greeting = conn.reply().await?;
        if !greeting.is_completion() {
            return Err(FtpError::from_reply(&greeting));
        }

        if let Some(connector) = &self.connector {
            let reply = conn.command("AUTH TLS").await?;
            if reply.code != 234 {
                return Err(FtpError::Tls(format!(
                    "server refused AUTH TLS: {} {}",
                    reply.code,
                    reply.text()
                )));
            }
            conn = conn.upgrade(connector, host).await?;
        }

        let user = conn
            .command(&format!("USER {}", self.config.username))
            .await?;
        match user.code {
            230 => {}
            331 => {
                conn.expect(&format!("PASS {}", self.config.password), |c| {
                    c == 230 || c == 202
                })
                .await?;
            }
            _ => return Err(FtpError::from_reply(&user)),
        }

        if conn.tls {
            conn.expect("PBSZ 0", |c| c == 200).await?;
            conn.expect("PROT P", |c| c == 200).await?;
        }
        conn.expect("TYPE I", |c| c == 200).await?;
        Ok(conn)
    }

    /// Opens a data connection for `command` and waits for the preliminary reply.
    async fn open_data(
        &self,
        conn: &mut ControlConnection,
        command: &str,
    ) -> Result<BoxedIo, FtpError> {
        let io_timeout = self.config.timeout();
        let stream = if self.config.passive_mode {
            let reply = conn.expect("PASV", |c| c == 227).await?;
            let advertised = parse_pasv_reply(&reply.text())
                .ok_or_else(|| FtpError::Protocol(format!("unparsable PASV reply: {}", reply.text())))?;
            let target = if advertised.ip().is_unspecified() {
                SocketAddr::new(conn.peer.ip(), advertised.port())
            } else {
                SocketAddr::V4(advertised)
            };
            let data = timeout(io_timeout, TcpStream::connect(target)).await??;
            conn.expect_preliminary(command).await?;
            data
        } else {
            let listener = TcpListener::bind((conn.local.ip(), 0)).await?;
            let SocketAddr::V4(local) = listener.local_addr()? else {
                return Err(FtpError::Protocol("active mode requires IPv4".into()));
            };
            conn.expect(&format!("PORT {}", format_host_port(local)), |c| c == 200)
                .await?;
            conn.expect_preliminary(command).await?;
            let (data, _) = timeout(io_timeout, listener.accept()).await??;
            data
        };

        let io: BoxedIo = Box::new(stream);
        match &self.connector {
            Some(connector) if conn.tls => {
                let name = server_name(&self.config.host)?;
                timeout(io_timeout, connect_tls(connector, name, io)).await?
            }
            _ => Ok(io),
        }
    }

    async fn list_names(
        &self,
        conn: &mut ControlConnection,
        dir: Option<&str>,
    ) -> Result<Vec<String>, FtpError> {
        let command = match dir {
            Some(dir) => format!("NLST {dir}"),
            None => "NLST".to_string(),
        };
        let mut data = self.open_data(conn, &command).await?;
        let mut raw = Vec::new();
        timeout(self.config.timeout(), data.read_to_end(&mut raw)).await??;
        drop(data);

        let done = conn.reply().await?;
        if !done.is_completion() {
            return Err(FtpError::from_reply(&done));
        }
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Creates every component of `dir`, ignoring "already exists" replies.
    async fn ensure_remote_dir(
        &self,
        conn: &mut ControlConnection,
        dir: &str,
    ) -> Result<(), FtpError> {
        let absolute = dir.starts_with('/');
        let mut path = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if absolute || !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            let reply = conn.command(&format!("MKD {path}")).await?;
            if !matches!(reply.code, 257 | 521 | 550) {
                return Err(FtpError::from_reply(&reply));
            }
        }
        Ok(())
    }

    /// Uploads through the `.<name>.part` stage beside the target with
    /// `APPE`, resuming from whatever an earlier attempt left there, and
    /// renames the stage over the target once its size matches.
    async fn store(
        &self,
        conn: &mut ControlConnection,
        file: &mut tokio::fs::File,
        upload: &Upload<'_>,
    ) -> Result<u64, FtpError> {
        if let Some((dir, _)) = upload.remote.rsplit_once('/')
            && !dir.is_empty()
        {
            self.ensure_remote_dir(conn, dir).await?;
        }

        let stage = stage_name(upload.remote);
        let offset = self.resume_offset(conn, &stage, upload.total).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| FtpError::local(upload.local_path, e))?;
            info!(remote = %upload.remote, offset, "resuming upload");
        }

        let mut data = self.open_data(conn, &format!("APPE {stage}")).await?;
        let sent = self.send_file(&mut data, file, upload, offset).await?;
        drop(data);

        let done = conn.reply().await?;
        if !matches!(done.code, 226 | 250) {
            return Err(FtpError::from_reply(&done));
        }

        let stored = offset + sent;
        // Servers without SIZE support answer 5xx; skip the check then.
        let size = conn.command(&format!("SIZE {stage}")).await?;
        if size.code == 213
            && let Ok(remote_len) = size.text().trim().parse::<u64>()
            && remote_len != stored
        {
            return Err(FtpError::Protocol(format!(
                "size mismatch after upload: sent {stored} bytes, server reports {remote_len}"
            )));
        }

        conn.expect(&format!("RNFR {stage}"), |c| c == 350).await?;
        conn.expect(&format!("RNTO {}", upload.remote), |c| c == 250)
            .await?;
        Ok(stored)
    }

    /// Bytes of `stage` already on the server that can be kept. A stage
    /// longer than the local file is deleted.
    async fn resume_offset(
        &self,
        conn: &mut ControlConnection,
        stage: &str,
        total: u64,
    ) -> Result<u64, FtpError> {
        let reply = conn.command(&format!("SIZE {stage}")).await?;
        let existing = (reply.code == 213)
            .then(|| reply.text().trim().parse::<u64>().ok())
            .flatten();
        match existing {
            Some(len) if len <= total => Ok(len),
            Some(len) => {
                debug!(%stage, len, total, "remote stage larger than file, restarting");
                conn.expect(&format!("DELE {stage}"), |c| c == 250).await?;
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn send_file(
        &self,
        data: &mut BoxedIo,
        file: &mut tokio::fs::File,
        upload: &Upload<'_>,
        offset: u64,
    ) -> Result<u64, FtpError> {
        let io_timeout = self.config.timeout();
        let mut buf = vec![0u8; TRANSFER_BUFFER_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| FtpError::local(upload.local_path, e))?;
            if n == 0 {
                break;
            }
            timeout(io_timeout, data.write_all(&buf[..n])).await??;
            sent += n as u64;
            if let Some(tx) = upload.progress_tx {
                let _ = tx.try_send(TransferProgress {
                    bytes_sent: offset + sent,
                    total_bytes: upload.total,
                });
            }
        }
        timeout(io_timeout, data.shutdown()).await??;
        Ok(sent)
    }
}

/// Remote staging name for `remote`: `.<name>.part` in the same directory.
pub fn stage_name(remote: &str) -> String {
    match remote.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/.{name}.part"),
        None => format!(".{remote}.part"),
    }
}

struct Upload<'a> {
    local_path: &'a Path,
    remote: &'a str,
    total: u64,
    progress_tx: Option<&'a mpsc::Sender<TransferProgress>>,
}

/// An authenticated control connection.
struct ControlConnection {
    stream: BufReader<BoxedIo>,
    io_timeout: Duration,
    peer: SocketAddr,
    local: SocketAddr,
    tls: bool,
}

impl ControlConnection {
    async fn send(&mut self, line: &str) -> Result<(), FtpError> {
        if line.starts_with("PASS ") {
            debug!("-> PASS ****");
        } else {
            debug!("-> {line}");
        }
        let raw = format!("{line}\r\n");
        let stream = self.stream.get_mut();
        timeout(self.io_timeout, async {
            stream.write_all(raw.as_bytes()).await?;
            stream.flush().await
        })
        .await??;
        Ok(())
    }

    async fn reply(&mut self) -> Result<Reply, FtpError> {
        let reply = timeout(self.io_timeout, read_reply(&mut self.stream)).await??;
        debug!(code = reply.code, "<- {}", reply.text());
        Ok(reply)
    }

    async fn command(&mut self, line: &str) -> Result<Reply, FtpError> {
        self.send(line).await?;
        self.reply().await
    }

    async fn expect(
        &mut self,
        line: &str,
        accept: impl Fn(u16) -> bool,
    ) -> Result<Reply, FtpError> {
        let reply = self.command(line).await?;
        if accept(reply.code) {
            Ok(reply)
        } else {
            Err(FtpError::from_reply(&reply))
        }
    }

    async fn expect_preliminary(&mut self, line: &str) -> Result<Reply, FtpError> {
        let reply = self.command(line).await?;
        if reply.is_preliminary() {
            Ok(reply)
        } else {
            Err(FtpError::from_reply(&reply))
        }
    }

    async fn upgrade(self, connector: &TlsConnector, host: &str) -> Result<Self, FtpError> {
        let Self {
            stream,
            io_timeout,
            peer,
            local,
            ..
        } = self;
        let name = server_name(host)?;
        let tls = timeout(io_timeout, connect_tls(connector, name, stream.into_inner())).await??;
        Ok(Self {
            stream: BufReader::new(tls),
            io_timeout,
            peer,
            local,
            tls: true,
        })
    }

    /// Sends `QUIT` and closes, ignoring errors.
    async fn quit(mut self) {
        let _ = self.command("QUIT").await;
        let _ = self.stream.get_mut().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FtpServer, PortRange, ServerConfig};

    async fn start_server(root: &Path) -> (FtpServer, u16) {
        let server = FtpServer::new(ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            root: root.to_path_buf(),
            passive_ports: PortRange(50200, 50300),
            ..Default::default()
        })
        .unwrap();
        let addr = server.start().await.unwrap();
        (server, addr.port())
    }

    fn client_config(port: u16) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port,
            timeout_secs: 5,
            retry_times: 0,
            retry_delay_secs: 0,
            ..Default::default()
        }
    }

    fn local_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn remote_path_defaults_to_remote_root() {
        let client = FtpClient::new(ClientConfig {
            remote_path: "/incoming/".into(),
            ..client_config(21)
        })
        .unwrap();
        assert_eq!(
            client.remote_path_for(Path::new("/data/a.jpg")).unwrap(),
            "/incoming/a.jpg"
        );
    }

    #[test]
    fn progress_fraction() {
        let p = TransferProgress {
            bytes_sent: 25,
            total_bytes: 100,
        };
        assert!((p.fraction() - 0.25).abs() < f64::EPSILON);
        let empty = TransferProgress {
            bytes_sent: 0,
            total_bytes: 0,
        };
        assert_eq!(empty.fraction(), 1.0);
    }

    #[tokio::test]
    async fn passive_upload_lands_under_root() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
        let path = local_file(local_dir.path(), "a.jpg", &data);

        let client = FtpClient::new(client_config(port)).unwrap();
        let sent = client.upload_file(&path, None).await.unwrap();
        assert_eq!(sent, data.len() as u64);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let stored = std::fs::read(server_dir.path().join("upload").join("a.jpg")).unwrap();
        assert_eq!(stored, data);
        server.stop().await;
    }

    #[tokio::test]
    async fn active_upload_into_nested_directory() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        let path = local_file(local_dir.path(), "b.png", b"png data");

        let client = FtpClient::new(ClientConfig {
            passive_mode: false,
            ..client_config(port)
        })
        .unwrap();
        client
            .upload_file(&path, Some("/2024/06/b.png"))
            .await
            .unwrap();

        let stored = server_dir.path().join("2024").join("06").join("b.png");
        assert_eq!(std::fs::read(stored).unwrap(), b"png data");
        server.stop().await;
    }

    #[tokio::test]
    async fn empty_file_uploads() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        let path = local_file(local_dir.path(), "empty.txt", b"");

        let client = FtpClient::new(client_config(port)).unwrap();
        assert_eq!(client.upload_file(&path, None).await.unwrap(), 0);
        assert!(server_dir.path().join("upload").join("empty.txt").exists());
        server.stop().await;
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        let data = vec![7u8; TRANSFER_BUFFER_SIZE * 3 + 5];
        let path = local_file(local_dir.path(), "big.bin", &data);

        let client = FtpClient::new(client_config(port)).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        client
            .upload_file_with_progress(&path, None, Some(tx))
            .await
            .unwrap();

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.bytes_sent, data.len() as u64);
        assert_eq!(last.total_bytes, data.len() as u64);
        server.stop().await;
    }

    #[test]
    fn stage_sits_beside_remote_target() {
        assert_eq!(stage_name("/2024/06/b.png"), "/2024/06/.b.png.part");
        assert_eq!(stage_name("/a.jpg"), "/.a.jpg.part");
        assert_eq!(stage_name("a.jpg"), ".a.jpg.part");
    }

    #[tokio::test]
    async fn resumes_from_remote_stage() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;

        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();
        let path = local_file(local_dir.path(), "a.jpg", &data);
        let remote_dir = server_dir.path().join("upload");
        std::fs::create_dir(&remote_dir).unwrap();
        std::fs::write(remote_dir.join(".a.jpg.part"), &data[..120_000]).unwrap();

        let client = FtpClient::new(client_config(port)).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let stored = client
            .upload_file_with_progress(&path, None, Some(tx))
            .await
            .unwrap();
        assert_eq!(stored, data.len() as u64);
        assert_eq!(std::fs::read(remote_dir.join("a.jpg")).unwrap(), data);
        assert!(!remote_dir.join(".a.jpg.part").exists());

        let first = rx.try_recv().unwrap();
        assert!(first.bytes_sent > 120_000);
        server.stop().await;
    }

    #[tokio::test]
    async fn oversized_remote_stage_is_restarted() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        let path = local_file(local_dir.path(), "a.jpg", b"fresh");
        let remote_dir = server_dir.path().join("upload");
        std::fs::create_dir(&remote_dir).unwrap();
        std::fs::write(remote_dir.join(".a.jpg.part"), b"leftover from a bigger file").unwrap();
        std::fs::write(remote_dir.join("a.jpg"), b"previous version").unwrap();

        let client = FtpClient::new(client_config(port)).unwrap();
        assert_eq!(client.upload_file(&path, None).await.unwrap(), 5);
        assert_eq!(std::fs::read(remote_dir.join("a.jpg")).unwrap(), b"fresh");
        assert!(!remote_dir.join(".a.jpg.part").exists());
        server.stop().await;
    }

    fn testdata(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    #[tokio::test]
    async fn explicit_tls_upload_round_trip() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let server = FtpServer::new(ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            root: server_dir.path().to_path_buf(),
            passive_ports: PortRange(50200, 50300),
            enable_tls: true,
            tls_cert: Some(testdata("server.pem")),
            tls_key: Some(testdata("server.key")),
            ..Default::default()
        })
        .unwrap();
        let port = server.start().await.unwrap().port();

        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 199) as u8).collect();
        let path = local_file(local_dir.path(), "secret.jpg", &data);

        let client = FtpClient::new(ClientConfig {
            enable_tls: true,
            ca_file: Some(testdata("ca.pem")),
            ..client_config(port)
        })
        .unwrap();
        assert!(client.test_connection().await.ok);
        let stored = client.upload_file(&path, None).await.unwrap();
        assert_eq!(stored, data.len() as u64);
        assert_eq!(
            std::fs::read(server_dir.path().join("upload").join("secret.jpg")).unwrap(),
            data
        );

        // Without AUTH TLS the server refuses the login.
        let plain = FtpClient::new(client_config(port)).unwrap();
        assert!(plain.upload_file(&path, None).await.is_err());

        // A client that does not trust the server's issuer fails the handshake.
        let untrusting = FtpClient::new(ClientConfig {
            enable_tls: true,
            ca_file: Some(testdata("server.pem")),
            ..client_config(port)
        })
        .unwrap();
        assert!(matches!(
            untrusting.upload_file(&path, None).await,
            Err(FtpError::Tls(_))
        ));
        server.stop().await;
    }

    #[tokio::test]
    async fn missing_local_file_is_a_local_error() {
        let local_dir = tempfile::tempdir().unwrap();
        // Nothing listens here; a local error must come first.
        let client = FtpClient::new(client_config(1)).unwrap();
        let err = client
            .upload_file(&local_dir.path().join("gone.jpg"), None)
            .await
            .unwrap_err();
        assert!(err.is_local());
        assert!(!err.is_retryable());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wrong_password_is_auth_failure() {
        let server_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        let path = local_file(local_dir.path(), "a.jpg", b"x");

        let client = FtpClient::new(ClientConfig {
            password: "wrong".into(),
            retry_times: 2,
            ..client_config(port)
        })
        .unwrap();
        let err = client.upload_file(&path, None).await.unwrap_err();
        assert!(matches!(err, FtpError::AuthFailed(_)));
        assert_eq!(client.state(), ConnectionState::Faulted);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connection_reports_both_outcomes() {
        let server_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        std::fs::write(server_dir.path().join("existing.jpg"), b"x").unwrap();

        let client = FtpClient::new(client_config(port)).unwrap();
        let report = client.test_connection().await;
        assert!(report.ok, "{}", report.message);
        assert!(report.message.contains("1 entries"));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // The connection test released its connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
        let report = client.test_connection().await;
        assert!(!report.ok);
        assert!(report.message.starts_with("connection failed"));
        assert_eq!(client.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn listing_names() {
        let server_dir = tempfile::tempdir().unwrap();
        let (server, port) = start_server(server_dir.path()).await;
        std::fs::create_dir(server_dir.path().join("upload")).unwrap();
        std::fs::write(server_dir.path().join("upload").join("x.jpg"), b"1").unwrap();
        std::fs::write(server_dir.path().join("upload").join("y.jpg"), b"2").unwrap();

        let client = FtpClient::new(client_config(port)).unwrap();
        let names = client.list(Some("/upload")).await.unwrap();
        assert_eq!(names, vec!["x.jpg", "y.jpg"]);
        server.stop().await;
    }
}
