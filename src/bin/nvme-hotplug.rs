//! nvme-hotplug - vfio-user NVMe hot-plug bridge daemon
//!
//! Serves the control socket and attaches/detaches controllers on the
//! configured QEMU instance.
//!
//! ## Usage
//!
//! ```sh
//! nvme-hotplug --config /etc/nvme-hotplug.yaml
//! nvme-hotplug --config /etc/nvme-hotplug.yaml --log-level debug
//! nvme-hotplug --version
//! ```
//!
//! `RUST_LOG` overrides the configured log level when set.

use anyhow::Context;
use nvme_hotplug::{BridgeConfig, ControlServer, HotplugServer, JsonRpcEngine, ResourceStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run {
        config: PathBuf,
        log_level: Option<String>,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    let mut config = None;
    let mut log_level = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires <path>")?;
                config = Some(PathBuf::from(path));
            }
            "--log-level" => {
                i += 1;
                let level = args.get(i).ok_or("--log-level requires <level>")?;
                log_level = Some(level.clone());
            }
            "--version" | "-V" => return Ok(Command::Version),
            "--help" | "-h" => return Ok(Command::Help),
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    match config {
        Some(config) => Ok(Command::Run { config, log_level }),
        None => Err("--config <path> is required".to_string()),
    }
}

fn cmd_help() {
    eprintln!(
        r#"nvme-hotplug {}
Hot-plug bridge for vfio-user NVMe controllers

USAGE:
    nvme-hotplug --config <path> [--log-level <level>]

OPTIONS:
    -c, --config <path>      Bridge configuration (YAML)
        --log-level <level>  error, warn, info, debug or trace
    -V, --version            Print version
    -h, --help               Print help
"#,
        env!("CARGO_PKG_VERSION")
    );
}

// =============================================================================
// Daemon
// =============================================================================

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let spdk_address = config
        .spdk_address
        .clone()
        .context("spdk_address is required")?;

    let store = Arc::new(ResourceStore::new());
    let engine = Arc::new(JsonRpcEngine::new(spdk_address));
    let hotplug = HotplugServer::new(store, engine, &config)
        .context("failed to initialise hot-plug server")?;
    info!(
        qmp = %config.qmp_address.display(),
        ctrlr_dir = %config.ctrlr_dir.display(),
        buses = config.buses.len(),
        "hot-plug server ready"
    );

    let server = ControlServer::bind(Arc::new(hotplug), &config.listen_address)
        .with_context(|| format!("failed to bind {}", config.listen_address.display()))?;
    server.serve(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let (config_path, log_level) = match parse_args() {
        Ok(Command::Run { config, log_level }) => (config, log_level),
        Ok(Command::Version) => {
            println!("nvme-hotplug {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Ok(Command::Help) => {
            cmd_help();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    let mut config = match BridgeConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(level) = log_level {
        config.log_level = level;
    }

    init_tracing(&config.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "nvme-hotplug starting"
    );

    match run(config).await {
        Ok(()) => {
            info!("nvme-hotplug stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "nvme-hotplug failed");
            ExitCode::FAILURE
        }
    }
}
