//! runbox — control plane for ephemeral sandboxes

mod doctor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runbox_core::{Runbox, RunboxConfig};
use runbox_gateway::GatewayServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "runbox", author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/runbox/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway and background tasks
    Serve {
        /// Override `gateway.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the effective configuration
    Config {
        /// Write the defaults to the config path instead of printing
        #[arg(long)]
        init: bool,
    },
    /// Check that the container runtime, proxy and workspace root are usable
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve { bind } => serve(cli.config.as_deref(), bind).await,
        Commands::Config { init } => config(cli.config.as_deref(), init),
        Commands::Doctor => check_host(cli.config.as_deref()).await,
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn serve(config_path: Option<&Path>, bind: Option<String>) -> Result<()> {
    let config = RunboxConfig::load_or_default(config_path).context("Failed to load config")?;
    info!("runbox v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Workspaces in {}, at most {} live sandbox(es)",
        config.workspace_root.display(),
        config.max_live_sandboxes
    );

    let runbox = Arc::new(Runbox::from_config(config));
    let reaper = runbox.spawn_background_tasks();

    let mut server = GatewayServer::new(runbox.clone());
    if let Some(bind) = bind {
        server = server.with_bind(bind);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        on_signal.cancel();
    });

    let result = server.start(cancel).await;
    runbox.shutdown();
    if let Err(e) = reaper.await {
        warn!("Session reaper ended abnormally: {}", e);
    }
    result
}

fn config(config_path: Option<&Path>, init: bool) -> Result<()> {
    if !init {
        let config = RunboxConfig::load_or_default(config_path)?;
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => RunboxConfig::default_path().context("No config directory on this system")?,
    };
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, RunboxConfig::default().to_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn check_host(config_path: Option<&Path>) -> Result<()> {
    let config = RunboxConfig::load_or_default(config_path)?;
    let report = doctor::run_doctor(&config).await;
    for check in &report.checks {
        println!("  [{}] {}: {}", check.status, check.name, check.message);
        if let Some(hint) = &check.fix_hint
            && check.status != doctor::CheckStatus::Pass
        {
            println!("         fix: {}", hint);
        }
    }
    println!("{}", report.summary());
    if !report.is_healthy() {
        anyhow::bail!("doctor found problems");
    }
    Ok(())
}
