//! chronodb node binary

use anyhow::Context;
use chronodb::common::logging::init_logging;
use chronodb::common::StorageConfig;
use chronodb::storage::backend_from_config;
use chronodb::transport::HttpTransport;
use chronodb::{Config, Node, NodeOptions, BUILD_INFO};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chronod")]
#[command(about = "chronodb time-series database node")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "chronodb.toml")]
    config: PathBuf,

    /// Print version information and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Reset the root user's password to the default once joined
    #[arg(long)]
    reset_root: bool,

    /// Write the process id to this file
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Repair every shard store before starting
    #[arg(long)]
    repair: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        // Report the configured backend; fall back to the default one
        let storage = Config::load(&cli.config)
            .map(|c| c.storage)
            .unwrap_or_else(|_| StorageConfig::default());
        let backend = backend_from_config(&storage)?;
        println!("{} ({} {})", BUILD_INFO, backend.name(), backend.version());
        return Ok(());
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&config.log_level, &config.log_file)?;

    if let Some(pidfile) = &cli.pidfile {
        std::fs::write(pidfile, std::process::id().to_string())
            .with_context(|| format!("writing pidfile {}", pidfile.display()))?;
    }

    tracing::info!("{} starting as node {}", BUILD_INFO, config.node_id);

    let transport = Arc::new(HttpTransport::new(
        config.raft.rpc_timeout(),
        config.cluster.replica_timeout(),
    )?);
    let options = NodeOptions {
        repair: cli.repair,
        reset_root: cli.reset_root,
    };
    let node = Node::open(config, options, transport)?;
    let _bootstrap = node.start();

    let served = node.serve().await;
    node.shutdown()?;
    if let Some(pidfile) = &cli.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    served?;
    Ok(())
}
