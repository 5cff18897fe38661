//! Server, client and folder-monitor settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FtpError;
use crate::{DEFAULT_MAX_CONS, DEFAULT_MAX_CONS_PER_IP, DEFAULT_PASSIVE_PORTS, DEFAULT_PORT};

/// Inclusive port range, serialized as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange(pub u16, pub u16);

impl PortRange {
    pub fn start(&self) -> u16 {
        self.0
    }

    pub fn end(&self) -> u16 {
        self.1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.0..=self.1).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.0..=self.1
    }

    fn validate(&self) -> Result<(), FtpError> {
        if self.0 == 0 || self.0 > self.1 {
            return Err(FtpError::Config(format!(
                "passive port range {}-{} is empty or invalid",
                self.0, self.1
            )));
        }
        Ok(())
    }
}

impl Default for PortRange {
    fn default() -> Self {
        DEFAULT_PASSIVE_PORTS
    }
}

/// FTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Control port (0 = OS-assigned).
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Uploaded files land under this directory.
    pub root: PathBuf,
    pub passive_ports: PortRange,
    pub enable_tls: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub max_cons: usize,
    pub max_cons_per_ip: usize,
    pub idle_timeout_secs: u64,
    pub banner: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            username: "upload_user".into(),
            password: "upload_pass".into(),
            root: PathBuf::from("shared"),
            passive_ports: PortRange::default(),
            enable_tls: false,
            tls_cert: None,
            tls_key: None,
            max_cons: DEFAULT_MAX_CONS,
            max_cons_per_ip: DEFAULT_MAX_CONS_PER_IP,
            idle_timeout_secs: crate::DEFAULT_IDLE_TIMEOUT.as_secs(),
            banner: "ferry FTP server ready.".into(),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), FtpError> {
        if self.username.is_empty() {
            return Err(FtpError::Config("username must not be empty".into()));
        }
        if self.max_cons == 0 || self.max_cons_per_ip == 0 {
            return Err(FtpError::Config(
                "connection ceilings must be at least 1".into(),
            ));
        }
        self.passive_ports.validate()?;
        if self.enable_tls && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(FtpError::Config(
                "TLS enabled but certificate or key path missing".into(),
            ));
        }
        Ok(())
    }
}

/// FTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote directory used when no explicit remote path is given.
    pub remote_path: String,
    pub passive_mode: bool,
    pub enable_tls: bool,
    /// PEM bundle of trusted CAs; web PKI roots when absent.
    pub ca_file: Option<PathBuf>,
    /// Per-operation timeout (connect, reply, data read/write).
    pub timeout_secs: u64,
    /// Extra attempts when establishing the control connection.
    pub retry_times: u32,
    /// Base delay between connection attempts; attempt `n` waits `n × delay`.
    pub retry_delay_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            username: "upload_user".into(),
            password: "upload_pass".into(),
            remote_path: "/upload".into(),
            passive_mode: true,
            enable_tls: false,
            ca_file: None,
            timeout_secs: 30,
            retry_times: 3,
            retry_delay_secs: 5,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), FtpError> {
        if self.host.trim().is_empty() {
            return Err(FtpError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(FtpError::Config("port must not be 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(FtpError::Config("timeout must be at least 1 second".into()));
        }
        Ok(())
    }
}

/// Folder polling settings for [`FolderMonitor`](crate::FolderMonitor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub source_dir: PathBuf,
    pub backup_dir: PathBuf,
    /// Lowercase extensions without the dot; empty matches everything.
    pub extensions: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("outbox"),
            backup_dir: PathBuf::from("outbox/backup"),
            extensions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 21);
        assert_eq!(config.passive_ports, PortRange(50000, 50100));
        assert_eq!(config.max_cons, 256);
        assert_eq!(config.max_cons_per_ip, 5);
        assert!(!config.enable_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn server_rejects_bad_ranges() {
        let config = ServerConfig {
            passive_ports: PortRange(50100, 50000),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FtpError::Config(_))));

        let config = ServerConfig {
            max_cons_per_ip: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_tls_requires_key_material() {
        let config = ServerConfig {
            enable_tls: true,
            tls_cert: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_defaults_and_validation() {
        let config = ClientConfig::default();
        assert!(config.passive_mode);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_times, 3);
        assert!(config.validate().is_err());

        let config = ClientConfig {
            host: "127.0.0.1".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn port_range_serializes_as_pair() {
        let json = serde_json::to_string(&PortRange(50000, 50100)).unwrap();
        assert_eq!(json, "[50000,50100]");
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 2121, "passive_ports": [60000, 60010]}"#).unwrap();
        assert_eq!(config.port, 2121);
        assert_eq!(config.passive_ports.iter().count(), 11);
        assert_eq!(config.username, "upload_user");
    }
}
