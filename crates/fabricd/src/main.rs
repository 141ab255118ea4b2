//! fabricd entry point
//!
//! Loads the configuration, sets up logging and runs the per-family
//! reconciliation loops until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fabric_common::IpCommandKernel;
use fabricd::{Daemon, FabricConfig, LogFormat, DEFAULT_CONFIG_PATH};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Pod network fabric node daemon
#[derive(Parser, Debug)]
#[command(name = "fabricd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Node name (overrides the configuration file and NODE_NAME)
    #[arg(short, long)]
    node_name: Option<String>,

    /// Desired-state file (overrides the configuration file)
    #[arg(short, long)]
    state_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = FabricConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(name) = args.node_name {
        config.node.name = name;
    }
    if let Some(path) = args.state_file {
        config.sync.state_file = path;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("invalid configuration")?;

    init_logging(&config)?;

    info!(
        node = %config.node.name,
        state_file = %config.sync.state_file.display(),
        "fabricd: Starting"
    );

    let kernel = Arc::new(IpCommandKernel::new());
    let daemon = Daemon::new(&config, kernel);

    if args.once {
        let reports = daemon.run_once().await?;
        let failures: usize = reports.iter().map(|r| r.failure_count()).sum();
        if failures > 0 {
            warn!(failures, "fabricd: Single pass finished with failures");
        } else {
            info!("fabricd: Single pass converged");
        }
        return Ok(());
    }

    let shutdown = setup_signal_handlers()?;
    if let Err(e) = daemon.run(shutdown).await {
        error!(error = %e, "fabricd: Daemon exiting with error");
        return Err(e.into());
    }

    info!("fabricd: Graceful shutdown complete");
    Ok(())
}

/// Initialize structured logging
fn init_logging(config: &FabricConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let result = match config.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.compact().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to set logger: {}", e))
}

/// Cancel the returned token on SIGINT or SIGTERM
fn setup_signal_handlers() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = unix_signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("fabricd: Received SIGINT"),
            _ = sigterm.recv() => info!("fabricd: Received SIGTERM"),
        }
        cancel.cancel();
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["fabricd"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.once);
        assert!(args.node_name.is_none());
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "fabricd",
            "--node-name",
            "worker-1",
            "--state-file",
            "/tmp/state.json",
            "--once",
        ]);
        assert_eq!(args.node_name.as_deref(), Some("worker-1"));
        assert_eq!(args.state_file, Some(PathBuf::from("/tmp/state.json")));
        assert!(args.once);
    }
}
