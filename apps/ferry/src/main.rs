mod cli;
mod commands;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::FerryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ferry=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = FerryConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Upload(args) => commands::upload(config, args).await,
        Command::Serve => commands::serve(config).await,
        Command::Monitor { interval } => commands::monitor(config, interval).await,
        Command::TestConnection => commands::test_connection(config).await,
    }
}
