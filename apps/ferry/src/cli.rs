use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Reliable file relay over unstable networks.
#[derive(Parser, Debug)]
#[command(name = "ferry", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.config/ferry/config.json)
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan the source folder once and upload every new file
    Upload(UploadArgs),

    /// Run the FTP server until interrupted
    Serve,

    /// Poll the source folder and upload to the configured FTP server until interrupted
    Monitor {
        /// Seconds between passes (overrides upload_interval)
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },

    /// Connect to the configured FTP server, list the remote folder and disconnect
    TestConnection,
}

#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    /// Source folder (overrides source_folder)
    #[arg(long, value_name = "PATH")]
    pub source: Option<PathBuf>,

    /// Local target folder (overrides target_folder)
    #[arg(long, value_name = "PATH", conflicts_with = "ftp")]
    pub target: Option<PathBuf>,

    /// Upload to the configured FTP server instead of a local folder
    #[arg(long)]
    pub ftp: bool,

    /// Skip files whose content already exists at the target
    #[arg(long)]
    pub dedup: bool,

    /// Leave sources in place after a successful upload
    #[arg(long)]
    pub no_backup: bool,
}
