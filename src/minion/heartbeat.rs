// src/minion/heartbeat.rs

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::errors::Result;

/// Keeps the local machine's statistics and liveness fresh.
#[derive(Debug)]
pub struct Heartbeat {
    agent: Arc<Agent>,
}

impl Heartbeat {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let cadence = self.agent.ttl() / 2;
        info!(?cadence, "heartbeat started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(cadence) => {
                    if let Err(e) = self.beat().await {
                        error!(error = %e, code = e.code(), "heartbeat failed");
                    }
                }
            }
        }
        info!("heartbeat stopped");
        Ok(())
    }

    /// Refresh statistics and liveness. A machine entry that disappeared
    /// from the registry is registered again.
    pub async fn beat(&self) -> Result<()> {
        let machine = self.agent.machine();
        debug!(mach_id = %machine.short_id(), "heartbeat");
        match self
            .agent
            .registry()
            .refresh_machine(machine.id(), &machine.stat(), self.agent.ttl())
            .await
        {
            Err(e) if e.is_not_found() => {
                warn!(mach_id = %machine.id(), "machine entry missing; registering again");
                self.agent.birth_cry().await
            }
            other => other,
        }
    }
}
