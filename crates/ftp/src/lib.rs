//! FTP transport roles.
//!
//! The server accepts uploads into a fixed root directory and enforces
//! global and per-peer connection ceilings. The client uploads single
//! files over passive or active data connections, optionally protected
//! with explicit TLS (`AUTH TLS`), and can poll a folder in the background.
//!
//! # Wire format
//!
//! RFC 959 control channel (CRLF-terminated commands, three-digit replies,
//! multi-line replies in `123-` / `123 ` form). See [`reply`] and [`command`].

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod monitor;
pub mod reply;
pub mod server;
mod session;
pub mod stream;

pub use client::{ConnectionReport, ConnectionState, FtpClient, TransferProgress};
pub use config::{ClientConfig, MonitorConfig, PortRange, ServerConfig};
pub use error::FtpError;
pub use monitor::{FolderMonitor, MonitorEvent, relocate, relocate_unique, unoccupied_path};
pub use reply::Reply;
pub use server::{FtpServer, ServerStatus};

use std::time::Duration;

/// Default control port.
pub const DEFAULT_PORT: u16 = 21;

/// Default passive data port range (inclusive).
pub const DEFAULT_PASSIVE_PORTS: PortRange = PortRange(50000, 50100);

/// Default global connection ceiling.
pub const DEFAULT_MAX_CONS: usize = 256;

/// Default per-peer connection ceiling.
pub const DEFAULT_MAX_CONS_PER_IP: usize = 5;

/// Idle control connections are closed after this long.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for establishing a data connection.
pub const DATA_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Data channel copy buffer size (64 KB).
pub const TRANSFER_BUFFER_SIZE: usize = 64 * 1024;

/// Longest control line accepted from a peer.
pub const MAX_LINE_LEN: usize = 4096;
