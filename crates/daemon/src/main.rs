// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Photon Daemon (photond)
//!
//! Long-lived process hosting exactly one photon's instance: socket
//! server, dispatcher, method runner, lock manager, scheduler, and
//! channel bus.
//!
//! Typically started by the `photon` CLI; it listens on a Unix socket
//! derived from the photon name.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;

use photon_daemon::lifecycle::{self, Config, LifecycleError, StartupResult};
use photon_daemon::loader::Registry;
use photon_daemon::Listener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle info flags before any config/lock acquisition
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--version") | Some("-V") | Some("-v") => {
            println!("photond {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") | None => {
            println!("photond {}", env!("CARGO_PKG_VERSION"));
            println!("Photon daemon - hosts one photon's instance behind a Unix socket");
            println!();
            println!("USAGE:");
            println!("    photond <photon-name> [source-path]");
            println!();
            println!("The daemon is typically started by the `photon` CLI and should not");
            println!("be invoked directly. Registered photons: {:?}", Registry::builtin().names());
            println!();
            println!("OPTIONS:");
            println!("    -h, --help       Print help information");
            println!("    -v, --version    Print version information");
            return Ok(());
        }
        Some(name) if name.starts_with('-') => {
            eprintln!("error: unexpected argument '{name}'");
            eprintln!("Usage: photond <photon-name> [source-path]");
            std::process::exit(1);
        }
        Some(_) => {}
    }

    let photon_name = args[0].clone();
    let photon_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.ts", photon_name)));

    let registry = Registry::builtin();
    let loader = match registry.get(&photon_name) {
        Ok(loader) => loader,
        Err(_) => {
            eprintln!(
                "error: unknown photon '{}' (registered: {:?})",
                photon_name,
                registry.names()
            );
            std::process::exit(1);
        }
    };

    let config = Config::load(&photon_name, photon_path)?;

    // Rotate the log if it has grown too large, then write the startup
    // marker (before tracing setup, so the CLI can find this attempt).
    rotate_log_if_needed(&config.log_path);
    write_startup_marker(&config)?;
    let log_guard = setup_logging(&config)?;

    info!(photon = %photon_name, "starting daemon");

    let StartupResult { mut daemon, listener } = match lifecycle::startup(&config, loader).await {
        Ok(r) => r,
        Err(LifecycleError::LockFailed(_)) => {
            // Another daemon owns this photon; report it human-readably.
            let pid = std::fs::read_to_string(&config.pid_path)
                .unwrap_or_default()
                .trim()
                .to_string();
            eprintln!("photond is already running for '{}'", photon_name);
            if !pid.is_empty() {
                eprintln!("  pid: {pid}");
            }
            std::process::exit(1);
        }
        Err(e) => {
            // Write the error synchronously (tracing is non-blocking and
            // may not flush before exit).
            write_startup_error(&config, &e);
            error!("failed to start daemon: {}", e);
            drop(log_guard);
            return Err(e.into());
        }
    };

    // Accept loop
    let accept = tokio::spawn(Listener::new(listener, Arc::clone(&daemon.ctx)).run());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!("daemon ready, listening on {}", config.socket_path.display());

    // Signal ready for the parent process (CLI waiting for startup)
    println!("READY");

    tokio::select! {
        _ = daemon.ctx.shutdown.notified() => info!("shutdown requested"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("received SIGINT, shutting down..."),
    }

    // Stop accepting before the ordered teardown.
    accept.abort();
    daemon.shutdown().await;
    info!("daemon stopped");
    Ok(())
}

/// Maximum log file size before rotation (10 MB).
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep (daemon.log.1, .2, .3).
const MAX_ROTATED_LOGS: u32 = 3;

/// Rotate the daemon log file if it exceeds [`MAX_LOG_SIZE`].
///
/// Shifts `daemon.log` → `daemon.log.1` → `daemon.log.2` → `daemon.log.3`,
/// deleting the oldest. Best-effort: rotation failures are silently ignored
/// so the daemon still starts.
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

/// Startup marker prefix written to the log before anything else.
/// The CLI uses this to find where the current startup attempt begins.
const STARTUP_MARKER_PREFIX: &str = "--- photond: starting (pid: ";

fn write_startup_marker(config: &Config) -> Result<(), LifecycleError> {
    use std::io::Write;

    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)?;
    writeln!(file, "{}{}) ---\n", STARTUP_MARKER_PREFIX, std::process::id())?;
    Ok(())
}

/// Write a startup error synchronously so it is visible to the CLI even
/// if the process exits immediately.
fn write_startup_error(config: &Config, error: &LifecycleError) {
    use std::io::Write;

    let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
    else {
        return;
    };
    let _ = writeln!(file, "ERROR failed to start daemon: {}", error);
}

fn setup_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    if let Some(parent) = config.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = tracing_appender::rolling::never(
        config.log_path.parent().ok_or(LifecycleError::NoHomeDir)?,
        config.log_path.file_name().ok_or(LifecycleError::NoHomeDir)?,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
