// src/config/mod.rs

//! Configuration: raw TOML model, loading, CLI overrides and validation.
//!
//! The pipeline is `loader::load_config` -> `loader::apply_cli_overrides` ->
//! `validate::validate_config`, which yields the typed [`MinionConfig`] the
//! server is built from.

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

use std::path::PathBuf;
use std::time::Duration;

pub use model::{
    ConfigFile, HostSection, MinionSection, RegistryBackend, RegistrySection, SupervisorSection,
};

use crate::supervisor::StopPolicy;

/// Validated, fully typed minion configuration.
#[derive(Debug, Clone)]
pub struct MinionConfig {
    pub registry_backend: RegistryBackend,
    pub prefix: String,
    pub registry_endpoints: Vec<String>,
    pub request_timeout: Duration,
    pub data_dir: PathBuf,
    pub root_dir: PathBuf,
    pub ttl: Duration,
    pub reconcile_interval: Duration,
    pub monitor_interval: Duration,
    pub shutdown_timeout: Duration,
    pub publish_queue_capacity: usize,
    pub host: HostConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    pub ip: Option<String>,
    pub name: Option<String>,
    pub region: String,
    pub idc: String,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub stop: StopPolicy,
    pub stdout_template: String,
    pub stderr_template: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let raw = SupervisorSection::default();
        Self {
            stop: StopPolicy::default(),
            stdout_template: raw.stdout,
            stderr_template: raw.stderr,
        }
    }
}

impl MinionConfig {
    /// Defaults rooted at `data_dir`, used by tests and embedders that do not
    /// read a config file.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let registry = RegistrySection::default();
        Self {
            registry_backend: registry.backend,
            prefix: registry.prefix,
            registry_endpoints: registry.endpoints,
            request_timeout: Duration::from_millis(2500),
            data_dir: data_dir.into(),
            root_dir: PathBuf::from("."),
            ttl: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            publish_queue_capacity: 10,
            host: HostConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }

    /// Cadence of the publisher and heartbeat loops.
    pub fn half_ttl(&self) -> Duration {
        self.ttl / 2
    }

    /// Registry addresses as handed to supervised processes: scheme
    /// stripped, comma-joined.
    pub fn registry_addrs(&self) -> String {
        trim_addrs(&self.registry_endpoints)
    }
}

/// Strip `http://` / `https://` schemes and join with commas.
pub fn trim_addrs(endpoints: &[String]) -> String {
    endpoints
        .iter()
        .map(|e| {
            let e = e.trim();
            e.split_once("://").map(|(_, rest)| rest).unwrap_or(e)
        })
        .map(|e| e.trim_end_matches('/'))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_addrs_strips_schemes() {
        let eps = vec![
            "http://127.0.0.1:2379".to_string(),
            "https://10.0.0.2:4001/".to_string(),
            "10.0.0.3:2379".to_string(),
        ];
        assert_eq!(
            trim_addrs(&eps),
            "127.0.0.1:2379,10.0.0.2:4001,10.0.0.3:2379"
        );
    }

    #[test]
    fn half_ttl_of_default_is_five_seconds() {
        let cfg = MinionConfig::with_data_dir("/tmp/x");
        assert_eq!(cfg.half_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.registry_addrs(), "127.0.0.1:2379,127.0.0.1:4001");
    }
}
