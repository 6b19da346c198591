// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::cli::CliArgs;
use crate::config::MinionConfig;
use crate::config::model::ConfigFile;
use crate::config::validate::validate_config;

/// Load a configuration file from a given path and return the raw `ConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file at {:?}", path))?;

    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML config from {:?}", path))?;

    Ok(config)
}

/// Resolve which file to read.
///
/// - An explicit path must exist.
/// - Without one, [`default_config_path`] is used if present; otherwise the
///   built-in defaults apply.
pub fn load_config(explicit: Option<&Path>) -> Result<ConfigFile> {
    match explicit {
        Some(path) => load_from_path(path),
        None => {
            let path = default_config_path();
            if path.is_file() {
                load_from_path(&path)
            } else {
                Ok(ConfigFile::default())
            }
        }
    }
}

/// Overlay CLI flags onto the file configuration.
pub fn apply_cli_overrides(cfg: &mut ConfigFile, args: &CliArgs) {
    if let Some(dir) = &args.data_dir {
        cfg.minion.data_dir = dir.clone();
    }
    if let Some(dir) = &args.root_dir {
        cfg.minion.root_dir = dir.clone();
    }
    if let Some(backend) = args.registry_backend {
        cfg.registry.backend = backend;
    }
    if let Some(endpoints) = &args.registry_endpoints {
        cfg.registry.endpoints = endpoints.clone();
    }
    if let Some(prefix) = &args.prefix {
        cfg.registry.prefix = prefix.clone();
    }
    if let Some(ttl) = &args.ttl {
        cfg.minion.ttl = ttl.clone();
    }
    if let Some(ip) = &args.host_ip {
        cfg.host.ip = Some(ip.clone());
    }
    if let Some(name) = &args.host_name {
        cfg.host.name = Some(name.clone());
    }
    if let Some(region) = &args.host_region {
        cfg.host.region = Some(region.clone());
    }
    if let Some(idc) = &args.host_idc {
        cfg.host.idc = Some(idc.clone());
    }
}

/// Load, overlay CLI flags, and validate.
///
/// This is the recommended entry point for the binary. Returns both the
/// effective raw file (for `--dry-run` printing) and the typed config.
pub fn load_and_validate(args: &CliArgs) -> Result<(ConfigFile, MinionConfig)> {
    let mut raw = load_config(args.config.as_deref())?;
    apply_cli_overrides(&mut raw, args);
    let cfg = validate_config(&raw).context("validating configuration")?;
    Ok((raw, cfg))
}

/// `Procfleet.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Procfleet.toml")
}
