// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! Every flag here overrides the matching value from the config file; see
//! [`crate::config::loader::apply_cli_overrides`].

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::RegistryBackend;

/// Command-line arguments for `procfleet-minion`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "procfleet-minion",
    version,
    about = "Per-host agent that reconciles local processes against the cluster registry.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Procfleet.toml` in the current working directory. A missing
    /// default file means "use built-in defaults"; a missing explicit path is
    /// an error.
    #[arg(long, value_name = "PATH", env = "PROCFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PROCFLEET_LOG`, then the config file, then `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Directory holding the machine ID, process logs and working dirs.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory service commands are resolved against.
    #[arg(long, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    /// Registry key prefix, e.g. `/_procfleet`.
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// Registry backend: `etcd` (shared cluster) or `memory` (this host only).
    #[arg(long, value_enum, value_name = "BACKEND")]
    pub registry_backend: Option<RegistryBackend>,

    /// Comma-separated registry endpoints, e.g. `http://10.0.0.1:2379`.
    #[arg(long, value_name = "URLS", value_delimiter = ',', env = "PROCFLEET_REGISTRY")]
    pub registry_endpoints: Option<Vec<String>>,

    /// Public IP advertised for this host.
    #[arg(long, value_name = "IP")]
    pub host_ip: Option<String>,

    /// Host name advertised for this host (defaults to the IP).
    #[arg(long, value_name = "NAME")]
    pub host_name: Option<String>,

    #[arg(long, value_name = "REGION")]
    pub host_region: Option<String>,

    #[arg(long, value_name = "IDC")]
    pub host_idc: Option<String>,

    /// Liveness TTL for machine and process alive keys, e.g. `10s`.
    #[arg(long, value_name = "DURATION")]
    pub ttl: Option<String>,

    /// Parse + validate the configuration, print it, and exit.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overrides() {
        let args = CliArgs::try_parse_from([
            "procfleet-minion",
            "--data-dir",
            "/var/lib/procfleet",
            "--ttl",
            "20s",
            "--log-level",
            "debug",
            "--dry-run",
            "--registry-endpoints",
            "http://10.0.0.1:2379,http://10.0.0.2:2379",
        ])
        .expect("valid args");

        assert_eq!(args.data_dir, Some(PathBuf::from("/var/lib/procfleet")));
        assert_eq!(args.ttl.as_deref(), Some("20s"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert!(args.dry_run);
        assert!(args.host_ip.is_none());
        assert_eq!(
            args.registry_endpoints,
            Some(vec!["http://10.0.0.1:2379".to_string(), "http://10.0.0.2:2379".to_string()])
        );
        assert!(args.registry_backend.is_none());
    }
}
