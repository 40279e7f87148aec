use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const DEFAULT_LOG_FILTER: &str = "info";
const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "blockflow.log";

/// Pick the effective tracing filter. Precedence, highest first:
/// explicit `--log-filter`, `-v`/`-vv` verbosity, `RUST_LOG`, default.
pub fn select_log_filter(
    verbose: u8,
    cli_log_filter: Option<&str>,
    rust_log_env: Option<&str>,
) -> String {
    if let Some(filter) = cli_log_filter {
        return filter.to_string();
    }

    match verbose {
        0 => rust_log_env
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn parse_env_filter(filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Initialize tracing with a console layer and, when a data directory is
/// available, a daily-rolling file sink under `<data_dir>/logs`. The
/// returned guard must be held for the process lifetime so buffered file
/// output is flushed.
pub fn init(
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> Option<WorkerGuard> {
    let filter = select_log_filter(
        verbose,
        cli_log_filter,
        std::env::var("RUST_LOG").ok().as_deref(),
    );

    let file_sink = data_dir.and_then(|dir| {
        let log_dir = dir.join(LOG_DIR_NAME);
        if let Err(error) = std::fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: cannot create log directory {}: {error}. Continuing with console-only logging.",
                log_dir.display()
            );
            return None;
        }

        let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
        Some(tracing_appender::non_blocking(appender))
    });

    match file_sink {
        Some((writer, guard)) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter(&filter)),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(parse_env_filter(&filter)),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter(&filter)),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
            None
        }
    }
}
