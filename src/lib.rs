// src/lib.rs

pub mod agent;
pub mod cli;
pub mod config;
pub mod errors;
pub mod logging;
pub mod machine;
pub mod minion;
pub mod model;
pub mod registry;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod template;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::cli::CliArgs;
use crate::config::MinionConfig;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::minion::MinionServer;
use crate::store::{KvStore, MemoryStore, open_store};

/// High-level entry point used by `main.rs`.
///
/// `file` and `cfg` are the already loaded configuration; a SIGHUP reloads
/// it from the same sources.
///
/// This wires together:
/// - the registry backend
/// - the minion server lifecycle
/// - signal handling (SIGINT/SIGTERM stop, SIGHUP restart, SIGUSR1 dump)
pub async fn run(args: CliArgs, file: ConfigFile, cfg: MinionConfig) -> Result<()> {
    if args.dry_run {
        print_dry_run(&file)?;
        return Ok(());
    }

    // With the memory backend, registry state survives SIGHUP restarts.
    let memory = Arc::new(MemoryStore::new());

    let mut server = start(cfg, &memory).await?;

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
            _ = server.wait() => {
                error!("minion stopped after a fatal error; shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received; restarting with reloaded config");
                let (_, reloaded) = load_and_validate(&args)
                    .context("reloading configuration")?;
                shutdown(&server).await;
                server = start(reloaded, &memory).await?;
            }
            _ = sigusr1.recv() => {
                match server.dump() {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "dumping status failed"),
                }
            }
        }
    }

    shutdown(&server).await;
    Ok(())
}

async fn start(cfg: MinionConfig, memory: &Arc<MemoryStore>) -> Result<MinionServer> {
    let store: Arc<dyn KvStore> = open_store(cfg.registry_backend, &cfg.registry_endpoints, memory)
        .context("opening registry backend")?;
    info!(backend = ?cfg.registry_backend, endpoints = ?cfg.registry_endpoints, "registry backend ready");
    let server = MinionServer::init(cfg, store)
        .await
        .context("initializing minion")?;
    server.run().await.context("starting minion")?;
    Ok(server)
}

/// Kill then purge. Failures are logged; shutdown continues regardless.
async fn shutdown(server: &MinionServer) {
    if server.is_running() {
        if let Err(e) = server.kill().await {
            error!(error = %e, "stopping minion workers failed");
        }
    }
    if let Err(e) = server.purge().await {
        error!(error = %e, "purging local processes failed");
    }
}

/// Print the effective configuration as TOML.
fn print_dry_run(file: &ConfigFile) -> Result<()> {
    let rendered = toml::to_string_pretty(file).context("rendering effective configuration")?;
    println!("# procfleet-minion dry-run: effective configuration");
    print!("{rendered}");
    Ok(())
}
