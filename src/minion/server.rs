// src/minion/server.rs

//! Minion lifecycle: `init` -> `run` -> `kill` -> `purge`.
//!
//! One [`MinionServer`] is the whole application context. Workers get what
//! they need from it by `Arc`, and every worker observes the same shutdown
//! token.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Heartbeat, Publisher, Reconciler};
use crate::agent::Agent;
use crate::config::MinionConfig;
use crate::errors::{Error, Result};
use crate::machine::{self, Machine, ProcfsSampler, StatSampler};
use crate::model::{MachineStatus, ProcessStatus};
use crate::registry::Registry;
use crate::service::ServiceCatalog;
use crate::store::KvStore;
use crate::supervisor::{ProcessManager, ProcessSnapshot, SupervisorSettings};

/// Builds the statistics sampler each time the server starts.
pub type SamplerFactory = Arc<dyn Fn() -> Box<dyn StatSampler> + Send + Sync>;

struct Running {
    shutdown: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

pub struct MinionServer {
    config: MinionConfig,
    agent: Arc<Agent>,
    reconciler: Arc<Reconciler>,
    publisher: Arc<Publisher>,
    heartbeat: Arc<Heartbeat>,
    sampler: SamplerFactory,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for MinionServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinionServer")
            .field("mach_id", &self.agent.machine().id())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct Dump<'a> {
    running: bool,
    machine: MachineStatus,
    local_processes: Vec<ProcessSnapshot>,
    cluster_processes: &'a [ProcessStatus],
}

impl MinionServer {
    /// Connect to the registry (bootstrapping it when needed), load the
    /// local machine identity, and wire up the workers. Nothing runs yet.
    pub async fn init(config: MinionConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let registry = Registry::new(
            store,
            &config.prefix,
            config.request_timeout,
            config.registry_addrs(),
        );
        if !registry.is_bootstrapped().await? {
            registry.bootstrap().await?;
            info!(prefix = %registry.prefix(), "registry bootstrapped");
        }

        let machine = Arc::new(Machine::load(&config.data_dir, &config.host).await?);
        let supervisor = Arc::new(ProcessManager::new(SupervisorSettings::from_config(&config)));
        let agent = Arc::new(Agent::new(
            registry,
            supervisor,
            machine,
            ServiceCatalog::with_builtins(),
            config.publish_queue_capacity,
            config.ttl,
        ));

        let data_dir = config.data_dir.clone();
        let sampler: SamplerFactory =
            Arc::new(move || Box::new(ProcfsSampler::new([data_dir.clone()])) as Box<dyn StatSampler>);

        info!(mach_id = %agent.machine().id(), "minion initialized");
        Ok(Self {
            reconciler: Arc::new(Reconciler::new(agent.clone(), config.reconcile_interval)),
            publisher: Arc::new(Publisher::new(agent.clone())),
            heartbeat: Arc::new(Heartbeat::new(agent.clone())),
            config,
            agent,
            sampler,
            running: Mutex::new(None),
        })
    }

    /// Replace the statistics sampler used from the next `run`.
    pub fn with_sampler(mut self, sampler: SamplerFactory) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &MinionConfig {
        &self.config
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Register the machine and spawn the reconciler, publisher, heartbeat
    /// and monitor workers. Returns once they are running.
    pub async fn run(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Conflict("minion is already running".into()));
        }

        self.agent.birth_cry().await?;
        let events = self.agent.registry().event_stream();
        let shutdown = CancellationToken::new();

        let mut workers: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::with_capacity(4);
        {
            let reconciler = self.reconciler.clone();
            let token = shutdown.clone();
            workers.push((
                "reconciler",
                tokio::spawn(async move { reconciler.run(events, token).await }),
            ));
        }
        {
            let publisher = self.publisher.clone();
            let token = shutdown.clone();
            workers.push(("publisher", tokio::spawn(async move { publisher.run(token).await })));
        }
        {
            let heartbeat = self.heartbeat.clone();
            let token = shutdown.clone();
            workers.push(("heartbeat", tokio::spawn(async move { heartbeat.run(token).await })));
        }
        {
            let mach = self.agent.machine().clone();
            let sampler = (self.sampler)();
            let interval = self.config.monitor_interval;
            let token = shutdown.clone();
            workers.push((
                "monitor",
                tokio::spawn(async move {
                    machine::monitor(mach, sampler, interval, token).await;
                    Ok(())
                }),
            ));
        }

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race against a concurrent run.
            shutdown.cancel();
            return Err(Error::Conflict("minion is already running".into()));
        }
        *running = Some(Running { shutdown, workers });
        info!(mach_id = %self.agent.machine().id(), "minion running");
        Ok(())
    }

    /// Resolves once shutdown was requested, by `kill` or by a worker that
    /// hit a fatal error. Immediately when not running.
    pub async fn wait(&self) {
        let token = self.running.lock().as_ref().map(|r| r.shutdown.clone());
        if let Some(token) = token {
            token.cancelled().await;
        }
    }

    /// Signal every worker to stop and wait for them, bounded by the
    /// configured shutdown timeout. Workers still busy after that are left
    /// to finish on their own.
    pub async fn kill(&self) -> Result<()> {
        let Some(Running { shutdown, workers }) = self.running.lock().take() else {
            return Err(Error::Conflict("minion is not running".into()));
        };
        shutdown.cancel();

        let timeout = self.config.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, async {
            for (name, handle) in workers {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(worker = name, error = %e, "worker exited with error"),
                    Err(e) => error!(worker = name, error = %e, "worker panicked"),
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(?timeout, "timed out waiting for workers to stop");
            return Err(Error::ShutdownTimeout(timeout));
        }
        info!("minion stopped");
        Ok(())
    }

    /// Stop and forget every locally supervised process.
    pub async fn purge(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Conflict("kill the minion before purging".into()));
        }
        let total = self.agent.supervisor().total();
        self.agent.supervisor().purge().await?;
        info!(purged = total, "local processes purged");
        Ok(())
    }

    /// JSON snapshot of the machine, local processes with their run history,
    /// and the cached cluster-wide process set.
    pub fn dump(&self) -> Result<String> {
        let cluster = self.agent.cached_processes();
        let dump = Dump {
            running: self.is_running(),
            machine: self.agent.machine().status(),
            local_processes: self
                .agent
                .supervisor()
                .all_processes()
                .iter()
                .map(|p| p.snapshot())
                .collect(),
            cluster_processes: &cluster,
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }
}
