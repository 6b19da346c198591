// src/config/validate.rs

use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::config::duration::parse_duration;
use crate::config::model::ConfigFile;
use crate::config::{HostConfig, MinionConfig, SupervisorConfig};
use crate::supervisor::StopPolicy;

/// Run semantic validation against a loaded configuration and produce the
/// typed [`MinionConfig`].
///
/// This checks:
/// - the registry prefix is absolute and endpoints are present
/// - every duration string parses and is non-zero
/// - the TTL is at least 2s, so the half-TTL cadence is at least 1s
/// - log file templates are non-empty
/// - `publish_queue_capacity >= 1`
pub fn validate_config(cfg: &ConfigFile) -> Result<MinionConfig> {
    validate_registry(cfg)?;

    let request_timeout = duration_field("registry.request_timeout", &cfg.registry.request_timeout)?;
    let ttl = duration_field("minion.ttl", &cfg.minion.ttl)?;
    if ttl < Duration::from_secs(2) {
        return Err(anyhow!("[minion].ttl must be at least 2s (got {:?})", ttl));
    }
    let reconcile_interval =
        duration_field("minion.reconcile_interval", &cfg.minion.reconcile_interval)?;
    let monitor_interval = duration_field("minion.monitor_interval", &cfg.minion.monitor_interval)?;
    let shutdown_timeout = duration_field("minion.shutdown_timeout", &cfg.minion.shutdown_timeout)?;

    if cfg.minion.publish_queue_capacity == 0 {
        return Err(anyhow!(
            "[minion].publish_queue_capacity must be >= 1 (got 0)"
        ));
    }

    let supervisor = validate_supervisor(cfg)?;

    Ok(MinionConfig {
        registry_backend: cfg.registry.backend,
        prefix: cfg.registry.prefix.trim_end_matches('/').to_string(),
        registry_endpoints: cfg.registry.endpoints.clone(),
        request_timeout,
        data_dir: cfg.minion.data_dir.clone(),
        root_dir: cfg.minion.root_dir.clone(),
        ttl,
        reconcile_interval,
        monitor_interval,
        shutdown_timeout,
        publish_queue_capacity: cfg.minion.publish_queue_capacity,
        host: HostConfig {
            ip: non_empty(&cfg.host.ip),
            name: non_empty(&cfg.host.name),
            region: cfg.host.region.clone().unwrap_or_default(),
            idc: cfg.host.idc.clone().unwrap_or_default(),
        },
        supervisor,
    })
}

fn validate_registry(cfg: &ConfigFile) -> Result<()> {
    let prefix = cfg.registry.prefix.trim();
    if prefix.is_empty() || !prefix.starts_with('/') || prefix == "/" {
        return Err(anyhow!(
            "[registry].prefix must be an absolute key path like \"/_procfleet\" (got {:?})",
            cfg.registry.prefix
        ));
    }
    if cfg.registry.endpoints.iter().all(|e| e.trim().is_empty()) {
        return Err(anyhow!("[registry].endpoints must list at least one address"));
    }
    Ok(())
}

fn validate_supervisor(cfg: &ConfigFile) -> Result<SupervisorConfig> {
    let raw = &cfg.supervisor;
    let stop = StopPolicy {
        interrupt_grace: duration_field("supervisor.interrupt_grace", &raw.interrupt_grace)?,
        terminate_grace: duration_field("supervisor.terminate_grace", &raw.terminate_grace)?,
        kill_grace: duration_field("supervisor.kill_grace", &raw.kill_grace)?,
    };

    for (name, template) in [("stdout", &raw.stdout), ("stderr", &raw.stderr)] {
        if template.trim().is_empty() {
            return Err(anyhow!("[supervisor].{name} log template must not be empty"));
        }
    }

    Ok(SupervisorConfig {
        stop,
        stdout_template: raw.stdout.clone(),
        stderr_template: raw.stderr.clone(),
    })
}

fn duration_field(name: &str, value: &str) -> Result<Duration> {
    let d = parse_duration(value)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("invalid {name}"))?;
    if d.is_zero() {
        return Err(anyhow!("{name} must be greater than zero"));
    }
    Ok(d)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = validate_config(&ConfigFile::default()).unwrap();
        assert_eq!(cfg.ttl, Duration::from_secs(10));
        assert_eq!(cfg.request_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(cfg.supervisor.stop, StopPolicy::default());
        assert_eq!(cfg.publish_queue_capacity, 10);
        assert!(cfg.host.ip.is_none());
    }

    #[test]
    fn rejects_relative_prefix() {
        let mut raw = ConfigFile::default();
        raw.registry.prefix = "procfleet".to_string();
        assert!(validate_config(&raw).is_err());
    }

    #[test]
    fn rejects_short_ttl() {
        let mut raw = ConfigFile::default();
        raw.minion.ttl = "1s".to_string();
        let err = validate_config(&raw).unwrap_err();
        assert!(err.to_string().contains("at least 2s"));
    }

    #[test]
    fn rejects_zero_queue_capacity_and_bad_durations() {
        let mut raw = ConfigFile::default();
        raw.minion.publish_queue_capacity = 0;
        assert!(validate_config(&raw).is_err());

        let mut raw = ConfigFile::default();
        raw.supervisor.kill_grace = "0ms".to_string();
        assert!(validate_config(&raw).is_err());

        let mut raw = ConfigFile::default();
        raw.minion.reconcile_interval = "soon".to_string();
        assert!(validate_config(&raw).is_err());
    }

    #[test]
    fn blank_host_fields_are_treated_as_unset() {
        let mut raw = ConfigFile::default();
        raw.host.ip = Some("  ".to_string());
        raw.host.region = Some("sh".to_string());
        let cfg = validate_config(&raw).unwrap();
        assert!(cfg.host.ip.is_none());
        assert_eq!(cfg.host.region, "sh");
    }
}
