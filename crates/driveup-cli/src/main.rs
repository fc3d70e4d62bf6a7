//! driveup - resumable Google Drive uploads and downloads from the terminal.
//!
//! Results are printed to stdout as JSON; prompts, progress and logs go to
//! stderr so the output can be piped.

mod cli;
mod commands;
mod output;

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;

// ============================================================================
// Constants
// ============================================================================

/// Directory for daily rolling log files; file logging is off when unset
const ENV_LOG_DIR: &str = "DRIVEUP_LOG_DIR";

/// Prefix of the rolling log files
const LOG_FILE_PREFIX: &str = "driveup.log";

/// Filter used with `--verbose` when RUST_LOG is not set
const VERBOSE_FILTER: &str = "warn,driveup=debug,driveup_core=debug";

/// Exit status after Ctrl-C paused a transfer (128 + SIGINT)
const EXIT_INTERRUPTED: u8 = 130;

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { VERBOSE_FILTER } else { "warn" })
    });

    let (file_layer, guard) = match std::env::var_os(ENV_LOG_DIR) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn exit_code(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<driveup_core::Error>() {
        Some(driveup_core::Error::Cancelled { .. }) => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose);
    info!(version = env!("CARGO_PKG_VERSION"), "driveup starting");
    debug!(command = ?cli.command, "Parsed arguments");

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    }
}
