// src/logging.rs

//! Logging setup for `procfleet` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `PROCFLEET_LOG` environment variable (a level or a full `EnvFilter`
//!    directive such as `procfleet::minion=debug,info`)
//! 3. `log_level` from the config file
//! 4. default to `info`
//!
//! Logs go to STDERR; stdout is reserved for `--dry-run` output and status
//! dumps.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

pub const LOG_ENV_VAR: &str = "PROCFLEET_LOG";

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup. A second call (e.g. after a SIGHUP restart)
/// is rejected by `tracing` and reported as an error, which callers may
/// ignore.
pub fn init_logging(cli_level: Option<LogLevel>, config_level: Option<&str>) -> Result<()> {
    let filter = resolve_filter(cli_level, std::env::var(LOG_ENV_VAR).ok(), config_level);

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
        .context("installing global tracing subscriber")?;

    Ok(())
}

fn resolve_filter(
    cli_level: Option<LogLevel>,
    env_value: Option<String>,
    config_level: Option<&str>,
) -> EnvFilter {
    if let Some(lvl) = cli_level {
        return EnvFilter::new(level_from_log_level(lvl).as_str());
    }

    if let Some(filter) = env_value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
    {
        return filter;
    }

    let level = config_level
        .and_then(parse_level_str)
        .unwrap_or(tracing::Level::INFO);
    EnvFilter::new(level.as_str())
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

/// Parse a plain level name as written in the config file.
pub fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
