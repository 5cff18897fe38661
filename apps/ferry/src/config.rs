//! Application configuration.
//!
//! Reads JSON from `ferry/config.json` under `$XDG_CONFIG_HOME` (falling
//! back to `~/.config`, or `%APPDATA%` on Windows) unless a path is given.
//! Every field has a default; a missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use ferry_ftp::{ClientConfig, ServerConfig};
use ferry_hasher::HashAlgorithm;
use ferry_worker::DiskGuard;
use serde::{Deserialize, Serialize};

/// Source/target/backup layout and upload policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub source_folder: PathBuf,
    /// Local share root, used when uploading without `--ftp`.
    pub target_folder: PathBuf,
    pub backup_folder: PathBuf,
    pub enable_backup: bool,
    /// Seconds between monitor passes.
    pub upload_interval: u64,
    /// Retries per file after the first attempt.
    pub retry_count: i64,
    pub extensions: Vec<String>,
    pub enable_deduplication: bool,
    pub hash_algorithm: HashAlgorithm,
    /// Compare digests after local copies.
    pub verify_copies: bool,
    pub probe_timeout_secs: u64,
    /// Hold transfers while the destination is unreachable and resume
    /// when it answers again.
    pub network_auto_pause: bool,
    /// Hold transfers while the target or backup volume has less free
    /// space than this percentage. 0 disables the check.
    pub disk_threshold_percent: f64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            source_folder: PathBuf::from("outbox"),
            target_folder: PathBuf::from("share"),
            backup_folder: PathBuf::from("outbox-backup"),
            enable_backup: true,
            upload_interval: 30,
            retry_count: 3,
            extensions: ["jpg", "jpeg", "png", "bmp", "tiff", "gif", "raw"]
                .into_iter()
                .map(String::from)
                .collect(),
            enable_deduplication: false,
            hash_algorithm: HashAlgorithm::default(),
            verify_copies: false,
            probe_timeout_secs: 5,
            network_auto_pause: true,
            disk_threshold_percent: 10.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub general: GeneralConfig,
    pub ftp_server: ServerConfig,
    pub ftp_client: ClientConfig,
}

impl FerryConfig {
    /// Loads and validates the configuration at `path`, or at the default
    /// location when `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_file_path()?,
        };

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<FerryConfig>(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            FerryConfig::default()
        };

        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let general = &self.general;
        if general.retry_count < 0 {
            bail!("retry_count must be >= 0, got {}", general.retry_count);
        }
        if u32::try_from(general.retry_count).is_err() {
            bail!("retry_count {} is too large", general.retry_count);
        }
        if general.extensions.iter().all(|e| e.trim().is_empty()) {
            bail!("extensions must not be empty");
        }
        if general.upload_interval == 0 {
            bail!("upload_interval must be at least 1 second");
        }
        if general.probe_timeout_secs == 0 {
            bail!("probe_timeout_secs must be at least 1 second");
        }
        if !(0.0..=100.0).contains(&general.disk_threshold_percent) {
            bail!(
                "disk_threshold_percent must be between 0 and 100, got {}",
                general.disk_threshold_percent
            );
        }
        if self.ftp_server.port == 0 {
            bail!("ftp_server.port must not be 0");
        }
        self.ftp_server.validate()?;
        if self.ftp_client.port == 0 {
            bail!("ftp_client.port must not be 0");
        }
        Ok(())
    }

    pub fn max_retries(&self) -> u32 {
        u32::try_from(self.general.retry_count).unwrap_or(0)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.general.probe_timeout_secs)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.general.upload_interval)
    }

    /// Free-space guard over `paths`, or `None` when the threshold is 0.
    pub fn disk_guard(&self, paths: Vec<PathBuf>) -> Option<DiskGuard> {
        let percent = self.general.disk_threshold_percent;
        (percent > 0.0 && !paths.is_empty()).then(|| DiskGuard::new(percent, paths))
    }
}

fn config_file_path() -> anyhow::Result<PathBuf> {
    let dir = config_dir()
        .context("no configuration directory found (set XDG_CONFIG_HOME or HOME, or pass --config)")?;
    Ok(dir.join("ferry").join("config.json"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().filter(|v| !v.is_empty()).map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        unix_config_dir(
            std::env::var("XDG_CONFIG_HOME").ok(),
            std::env::var("HOME").ok(),
        )
    }
}

/// `$XDG_CONFIG_HOME`, else `$HOME/.config`. Empty values count as unset.
#[cfg_attr(target_os = "windows", allow(dead_code))]
fn unix_config_dir(xdg_config_home: Option<String>, home: Option<String>) -> Option<PathBuf> {
    xdg_config_home
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            home.filter(|h| !h.is_empty())
                .map(|h| PathBuf::from(h).join(".config"))
        })
}
