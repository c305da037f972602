// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Brummer daemon (brumd)
//!
//! Supervises project scripts, proxies their dev servers with telemetry
//! injection, and serves the instance's RPC surface. In hub mode it
//! aggregates every peer instance found in the rendezvous directory.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use brum_daemon::{lifecycle, Config, LifecycleError};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("brumd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("brumd {}", env!("CARGO_PKG_VERSION"));
                println!("Brummer daemon - supervises dev scripts and proxies their servers");
                println!();
                println!("USAGE:");
                println!("    brumd");
                println!();
                println!("Configuration is taken from the environment:");
                println!("    BRUM_STATE_DIR          state directory");
                println!("    BRUM_RPC_PORT           RPC port (0 = ephemeral)");
                println!("    BRUM_HUB                1 = aggregate peer instances");
                println!("    BRUM_PROXY_MODE         reverse (default) | full");
                println!("    BRUM_PROXY_PORT_RANGE   e.g. 20888-21887");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: brumd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let config = Config::load()?;
    rotate_log_if_needed(&config.log_path);
    let log_guard = setup_logging(&config)?;

    info!(name = %config.instance_name, hub = config.hub_mode, "starting brummer daemon");

    let daemon = match lifecycle::startup(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to start daemon: {}", e);
            drop(log_guard);
            return Err(e.into());
        }
    };

    info!(port = daemon.rpc_port, "daemon ready");

    // Signal ready for a parent process waiting on startup.
    println!("READY {}", daemon.rpc_port);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("received SIGINT, shutting down..."),
    }

    daemon.shutdown().await;
    Ok(())
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep (daemon.log.1, .2, .3).
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the daemon log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `daemon.log` → `daemon.log.1` → `daemon.log.2` → `daemon.log.3`,
/// deleting the oldest. Best-effort: rotation failures are ignored so the
/// daemon still starts.
fn rotate_log_if_needed(log_path: &std::path::Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }
    let log_str = log_path.display().to_string();
    for i in (1..MAX_ROTATED_LOGS).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

fn setup_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_appender = tracing_appender::rolling::never(
        config.log_path.parent().ok_or(LifecycleError::NoStateDir)?,
        config.log_path.file_name().ok_or(LifecycleError::NoStateDir)?,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
