// src/agent/mod.rs

//! The agent: shared context of one minion and the synchronous operations
//! offered to an API layer.
//!
//! It ties together the registry client, the local supervisor and machine,
//! and the service catalog. It also owns the two pieces of state the
//! workers share: the cached cluster-wide process snapshot (replaced
//! wholesale by every reconcile pass) and the publish queue of locally
//! changed process IDs.

mod queue;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::machine::Machine;
use crate::model::{MachineStatus, ProcessRunInfo, ProcessStatus};
use crate::registry::{Registry, RegistryEvent};
use crate::service::{RunInfoOverride, ServiceCatalog};
use crate::supervisor::ProcessManager;
use crate::types::ProcessState;

pub use queue::PublishQueue;

#[derive(Debug)]
pub struct Agent {
    registry: Registry,
    supervisor: Arc<ProcessManager>,
    machine: Arc<Machine>,
    services: ServiceCatalog,
    queue: PublishQueue,
    cache: RwLock<Arc<Vec<ProcessStatus>>>,
    ttl: Duration,
}

impl Agent {
    pub fn new(
        registry: Registry,
        supervisor: Arc<ProcessManager>,
        machine: Arc<Machine>,
        services: ServiceCatalog,
        queue_capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            machine,
            services,
            queue: PublishQueue::new(queue_capacity),
            cache: RwLock::new(Arc::new(Vec::new())),
            ttl,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ProcessManager> {
        &self.supervisor
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn services(&self) -> &ServiceCatalog {
        &self.services
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn publish_queue(&self) -> &PublishQueue {
        &self.queue
    }

    /// Hand a batch of locally changed process IDs to the publisher.
    pub fn subscribe(&self, proc_ids: Vec<String>) {
        debug!(count = proc_ids.len(), "queueing changed processes for publish");
        self.queue.push(proc_ids);
    }

    pub fn save_processes_to_cache(&self, procs: Vec<ProcessStatus>) {
        *self.cache.write() = Arc::new(procs);
    }

    /// Cluster-wide processes as of the last reconcile pass.
    pub fn cached_processes(&self) -> Arc<Vec<ProcessStatus>> {
        Arc::clone(&self.cache.read())
    }

    /// Register the local machine in the registry and mark it alive.
    pub async fn birth_cry(&self) -> Result<()> {
        self.registry
            .register_machine(self.machine.id(), self.machine.info(), self.ttl)
            .await?;
        self.announce(RegistryEvent::MachineStateChange).await;
        info!(mach_id = %self.machine.id(), "machine registered");
        Ok(())
    }

    /// Place a new process of `svc_name` on `mach_id`.
    ///
    /// The target machine must be registered and alive. Non-empty override
    /// fields replace the service defaults; endpoints are derived from the
    /// effective arguments, and endpoints without an IP get the target
    /// machine's address. Returns the allocated process ID.
    pub async fn start_new_process(
        &self,
        mach_id: &str,
        svc_name: &str,
        overrides: &RunInfoOverride,
    ) -> Result<String> {
        let mach = self.registry.machine(mach_id).await?;
        if !mach.is_alive {
            let reason = format!("machine {mach_id} is offline; refusing to place {svc_name}");
            error!(mach_id, svc = svc_name, "{reason}");
            return Err(Error::Unavailable(reason));
        }

        let svc = self.services.get(svc_name)?;
        let effective = svc.effective(overrides);
        let host_ip = mach.mach_info.public_ip.clone();
        let endpoints = effective
            .endpoints
            .into_iter()
            .map(|(name, mut ep)| {
                if ep.ip_addr.is_empty() {
                    ep.ip_addr = host_ip.clone();
                }
                (name, ep)
            })
            .collect();

        let run_info = ProcessRunInfo {
            host_ip,
            host_name: mach.mach_info.host_name,
            host_region: mach.mach_info.host_region,
            host_idc: mach.mach_info.host_idc,
            executor: effective.executor,
            command: effective.command,
            args: effective.args,
            environment: effective.environment,
            endpoints,
        };

        let proc_id = self
            .registry
            .new_process(mach_id, svc_name, &run_info)
            .await
            .inspect_err(|e| {
                error!(mach_id, svc = svc_name, error = %e, "creating new process in registry failed");
            })?;
        self.announce(RegistryEvent::ProcessTargetStateChange).await;
        Ok(proc_id)
    }

    /// Remove a process from the cluster. The owning minion stops and drops
    /// its local run on its next pass.
    pub async fn destroy_process(&self, proc_id: &str) -> Result<ProcessStatus> {
        let status = self.registry.delete_process(proc_id).await?;
        self.announce(RegistryEvent::ProcessTargetStateChange).await;
        Ok(status)
    }

    pub async fn start_process(&self, proc_id: &str) -> Result<()> {
        self.set_desired_state(proc_id, ProcessState::Started).await
    }

    pub async fn stop_process(&self, proc_id: &str) -> Result<()> {
        self.set_desired_state(proc_id, ProcessState::Stopped).await
    }

    async fn set_desired_state(&self, proc_id: &str, state: ProcessState) -> Result<()> {
        self.registry
            .update_process_desired_state(proc_id, state)
            .await?;
        self.announce(RegistryEvent::ProcessTargetStateChange).await;
        Ok(())
    }

    pub async fn list_all_processes(&self) -> Result<Vec<ProcessStatus>> {
        self.registry.processes().await
    }

    pub async fn list_processes_by_machine(&self, mach_id: &str) -> Result<Vec<ProcessStatus>> {
        self.registry.processes_on_machine(mach_id).await
    }

    pub async fn list_processes_by_service(&self, svc_name: &str) -> Result<Vec<ProcessStatus>> {
        self.registry.processes_of_service(svc_name).await
    }

    pub async fn process(&self, proc_id: &str) -> Result<ProcessStatus> {
        self.registry.process(proc_id).await
    }

    pub async fn list_all_machines(&self) -> Result<Vec<MachineStatus>> {
        self.registry.machines().await
    }

    pub async fn machine_status(&self, mach_id: &str) -> Result<MachineStatus> {
        self.registry.machine(mach_id).await
    }

    /// Best effort: the reconcile timer catches up if this write is lost.
    async fn announce(&self, event: RegistryEvent) {
        if let Err(e) = self.registry.announce(event).await {
            warn!(?event, error = %e, "announcing registry event failed");
        }
    }
}
