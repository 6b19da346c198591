// src/config/model.rs

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// log_level = "debug"
///
/// [registry]
/// backend = "etcd"
/// prefix = "/_procfleet"
/// endpoints = ["http://127.0.0.1:2379"]
/// request_timeout = "2500ms"
///
/// [minion]
/// data_dir = "/var/lib/procfleet"
/// root_dir = "/opt/tidb"
/// ttl = "10s"
///
/// [host]
/// ip = "10.0.1.12"
/// region = "bj"
/// idc = "bj-1"
///
/// [supervisor]
/// interrupt_grace = "5000ms"
/// ```
///
/// All sections are optional and have reasonable defaults. Durations stay as
/// strings here; [`crate::config::validate::validate_config`] parses them into
/// a typed [`crate::config::MinionConfig`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Plain level name (`error`..`trace`), lowest logging priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub minion: MinionSection,

    #[serde(default)]
    pub host: HostSection,

    #[serde(default)]
    pub supervisor: SupervisorSection,
}

/// `[registry]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    #[serde(default)]
    pub backend: RegistryBackend,

    /// Root of every key the minion reads or writes.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Registry cluster addresses. The etcd backend connects to them, and
    /// they are advertised to supervised processes through the `ETCD_ADDR`
    /// template variable (scheme stripped, comma-joined).
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Per-request deadline for every registry call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

/// Where registry state lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Shared etcd cluster at `endpoints`.
    #[default]
    Etcd,
    /// Private in-process store; only useful for a single host.
    Memory,
}

/// `[minion]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MinionSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Liveness TTL; publisher and heartbeat tick at half of it.
    #[serde(default = "default_ttl")]
    pub ttl: String,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: String,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    /// Maximum number of changed-ID batches waiting for the publisher.
    #[serde(default = "default_publish_queue_capacity")]
    pub publish_queue_capacity: usize,
}

/// `[host]` section. Everything is optional; see [`crate::machine`] for the
/// detection fallbacks.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idc: Option<String>,
}

/// `[supervisor]` section: stop escalation timings and log file templates.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    #[serde(default = "default_interrupt_grace")]
    pub interrupt_grace: String,

    #[serde(default = "default_terminate_grace")]
    pub terminate_grace: String,

    #[serde(default = "default_kill_grace")]
    pub kill_grace: String,

    /// Stdout file name template, relative to `<data_dir>/logs`.
    #[serde(default = "default_stdout_template")]
    pub stdout: String,

    #[serde(default = "default_stderr_template")]
    pub stderr: String,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            prefix: default_prefix(),
            endpoints: default_endpoints(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for MinionSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            root_dir: default_root_dir(),
            ttl: default_ttl(),
            reconcile_interval: default_reconcile_interval(),
            monitor_interval: default_monitor_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            publish_queue_capacity: default_publish_queue_capacity(),
        }
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            interrupt_grace: default_interrupt_grace(),
            terminate_grace: default_terminate_grace(),
            kill_grace: default_kill_grace(),
            stdout: default_stdout_template(),
            stderr: default_stderr_template(),
        }
    }
}

fn default_prefix() -> String {
    "/_procfleet".to_string()
}

fn default_endpoints() -> Vec<String> {
    vec![
        "http://127.0.0.1:2379".to_string(),
        "http://127.0.0.1:4001".to_string(),
    ]
}

fn default_request_timeout() -> String {
    "2500ms".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_ttl() -> String {
    "10s".to_string()
}

fn default_reconcile_interval() -> String {
    "5s".to_string()
}

fn default_monitor_interval() -> String {
    "1s".to_string()
}

fn default_shutdown_timeout() -> String {
    "1m".to_string()
}

fn default_publish_queue_capacity() -> usize {
    10
}

fn default_interrupt_grace() -> String {
    "5000ms".to_string()
}

fn default_terminate_grace() -> String {
    "5000ms".to_string()
}

fn default_kill_grace() -> String {
    "1000ms".to_string()
}

fn default_stdout_template() -> String {
    "$SERVICE_$PROCID_$RUN.out".to_string()
}

fn default_stderr_template() -> String {
    "$SERVICE_$PROCID_$RUN.err".to_string()
}
