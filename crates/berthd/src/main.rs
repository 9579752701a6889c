//! Berth daemon
//!
//! Watches the domains, policies and applications directories and keeps the
//! deployed set in line with what is on disk until interrupted.
//!
//! ## Configuration
//!
//! A TOML file (`--config` / `BERTH_CONFIG`) provides the full configuration;
//! `--home` / `BERTH_HOME` roots the artifact and work directories under one
//! folder, and the remaining flags override single settings.

mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use berth_core::{
    init_tracing, BerthConfig, DeploymentService, DirectoryWatcher, RepositoryConfig, ScanReport,
};
use clap::Parser;
use tracing::info;

use crate::runtime::LoggingRuntimeBuilder;

#[derive(Parser, Debug)]
#[command(name = "berthd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Berth artifact deployment daemon", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding domains/, policies/, apps/ and work/
    #[arg(long, env = "BERTH_HOME")]
    home: Option<PathBuf>,

    /// Interval between repository scans
    #[arg(long, env = "BERTH_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Deploy only these applications (colon separated) and do not monitor
    #[arg(long, value_delimiter = ':')]
    app: Vec<String>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Run one deployment pass, print its report and exit
    #[arg(long)]
    once: bool,
}

fn load_config(cli: &Cli) -> Result<BerthConfig> {
    let mut config = match &cli.config {
        Some(path) => BerthConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BerthConfig::default(),
    };

    if let Some(home) = &cli.home {
        config.repository = RepositoryConfig::under(home);
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.watcher.poll_interval_ms = ms;
    }
    if !cli.app.is_empty() {
        config.watcher.fixed_artifacts = Some(cli.app.clone());
    }
    if cli.json {
        config.logging.json = true;
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// One scan pass, then stop everything that pass deployed.
async fn run_once(service: Arc<DeploymentService>) -> Result<ScanReport> {
    let repository = service.repository();
    repository
        .ensure_layout()
        .context("Failed to prepare repository")?;
    repository
        .clear_anchors()
        .context("Failed to clear stale anchors")?;

    let report = DirectoryWatcher::new(service.clone()).scan().await;
    service.shutdown().await;
    Ok(report)
}

async fn run(service: Arc<DeploymentService>) -> Result<()> {
    let handle = DirectoryWatcher::new(service.clone())
        .start()
        .await
        .context("Failed to start directory watcher")?;
    let initial = handle.initial_scan();
    info!(
        deployed = initial.deployed.len(),
        failed = initial.failed.len(),
        monitoring = handle.is_monitoring(),
        "berthd started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");

    handle.stop().await;
    service.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging);

    let service = Arc::new(DeploymentService::new(
        config,
        Arc::new(LoggingRuntimeBuilder),
    ));

    if cli.once {
        let report = run_once(service).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    run(service).await
}
