//! Relay broker binary
//!
//! Loads configuration, wires the dependency graph, launches auto-start
//! servers, and supervises until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use relay_config::{ConfigLoader, RelayConfig};
use relay_server::AppContext;

#[derive(Parser)]
#[command(author, version, about = "Aggregating MCP broker", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Data directory (overrides configuration)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(config: &RelayConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.include_targets)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new().load(cli.config.as_ref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = Some(data_dir);
    }

    if cli.print_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    init_tracing(&config);

    let context = AppContext::init(config).await?;
    let started = context.auto_start().await;
    tracing::info!(
        servers = context.manager.snapshot().await.len(),
        auto_started = started,
        data_dir = %context.paths.root().display(),
        "relay broker ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    context.shutdown().await;
    Ok(())
}
