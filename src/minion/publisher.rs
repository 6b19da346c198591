// src/minion/publisher.rs

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::errors::Result;
use crate::supervisor::Process;

/// Writes local `current-state` and liveness back to the registry.
#[derive(Debug)]
pub struct Publisher {
    agent: Arc<Agent>,
}

impl Publisher {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    fn cadence(&self) -> Duration {
        self.agent.ttl() / 2
    }

    /// Publish everything every half TTL, and queued batches as they arrive.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(cadence = ?self.cadence(), "publisher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cadence()) => {
                    debug!("publishing all local processes");
                    if let Err(e) = self.publish_all().await {
                        if e.is_fatal() {
                            shutdown.cancel();
                            return Err(e);
                        }
                        error!(error = %e, "publishing all processes failed");
                    }
                }
                batch = self.agent.publish_queue().next() => {
                    debug!(?batch, "publishing changed processes");
                    if let Err(e) = self.publish(&batch).await {
                        if e.is_fatal() {
                            shutdown.cancel();
                            return Err(e);
                        }
                        error!(error = %e, "publishing changed processes failed");
                    }
                }
            }
        }
        info!("publisher stopped");
        Ok(())
    }

    /// Publish the given processes. IDs no longer supervised here are
    /// skipped.
    pub async fn publish(&self, proc_ids: &[String]) -> Result<()> {
        let supervisor = self.agent.supervisor();
        for proc_id in proc_ids {
            match supervisor.find_by_proc_id(proc_id) {
                Some(process) => self.publish_one(&process).await?,
                None => warn!(proc_id = %proc_id, "local process not found while publishing; skipping"),
            }
        }
        Ok(())
    }

    pub async fn publish_all(&self) -> Result<()> {
        for process in self.agent.supervisor().all_processes() {
            self.publish_one(&process).await?;
        }
        Ok(())
    }

    async fn publish_one(&self, process: &Process) -> Result<()> {
        debug!(proc_id = %process.proc_id(), state = %process.state(), alive = process.is_active(), "publishing process state");
        self.agent
            .registry()
            .update_process_state(
                process.proc_id(),
                self.agent.machine().id(),
                process.svc_name(),
                process.state(),
                process.is_active(),
                self.agent.ttl(),
            )
            .await
    }
}
