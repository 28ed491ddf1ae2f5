//! hakc - main entry point.
//!
//! Reconciles a mounted PortaPack SD card with the latest Mayhem release:
//! - Firmware bundle, world map, themes
//! - Frequency manager files per country
//! - Optional backup of user data before anything is touched
//!
//! # Architecture
//!
//! - `cli/args` - Command-line argument definitions
//! - `cli/handlers` - Config overrides, run/check dispatch, output
//! - `hakc-update` - The reconciliation engine

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use hakc_cli::cli::{Cli, exit_code_for, run_cli};

/// Guard that flushes the log file when dropped.
struct LogFileGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Set up stderr logging, plus an optional plain-text log file.
fn setup_logging(cli: &Cli) -> Result<Option<LogFileGuard>> {
    let level = cli.effective_log_level().as_filter_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,hakc={level},hakc_cli={level},hakc_update={level},hakc_common={level}"
        ))
    });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match cli.log_file_path() {
        Some(path) => {
            let file = open_log_file(&path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(LogFileGuard { _guard: guard }))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current step...");
            on_interrupt.cancel();
        }
    });

    let code = match run_cli(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("{:?}", e);
            eprintln!("Error: {e:#}");
            exit_code_for(&e)
        }
    };

    drop(log_guard);
    std::process::exit(code);
}
