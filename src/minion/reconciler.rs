// src/minion/reconciler.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::plan::{ReconcileAction, plan_reconcile};
use crate::agent::Agent;
use crate::errors::Result;
use crate::registry::EventStream;

/// Template variable carrying the registry connection string.
pub const REGISTRY_ADDR_VAR: &str = "ETCD_ADDR";

/// Drives local processes toward the cluster's desired state.
#[derive(Debug)]
pub struct Reconciler {
    agent: Arc<Agent>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(agent: Arc<Agent>, interval: Duration) -> Self {
        Self { agent, interval }
    }

    /// Reconcile on every registry event or after `interval` of quiet, until
    /// `shutdown` fires.
    ///
    /// A failed pass is logged and retried on the next trigger. A fatal
    /// error cancels `shutdown` and is returned.
    pub async fn run(&self, mut events: EventStream, shutdown: CancellationToken) -> Result<()> {
        info!(interval = ?self.interval, "reconciler started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.next(self.interval) => event,
            };
            match event {
                Some(event) => debug!(?event, "reconcile triggered by event"),
                None => debug!("reconcile triggered by tick"),
            }

            let started = Instant::now();
            match self.reconcile_once().await {
                Ok(changed) => {
                    let elapsed = started.elapsed();
                    if elapsed > self.interval {
                        warn!(?elapsed, interval = ?self.interval, "reconcile pass overran its interval");
                    } else {
                        debug!(?elapsed, changed = changed.len(), "reconcile pass completed");
                    }
                    self.agent.subscribe(changed);
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "reconciler hit an unrecoverable error; shutting down");
                    shutdown.cancel();
                    return Err(e);
                }
                Err(e) => error!(error = %e, code = e.code(), "reconcile pass failed"),
            }
        }
        info!("reconciler stopped");
        Ok(())
    }

    /// One pass. Returns the IDs of every local process it touched.
    ///
    /// Stops at the first failing action; earlier actions are not rolled
    /// back.
    pub async fn reconcile_once(&self) -> Result<Vec<String>> {
        let registry = self.agent.registry();
        let supervisor = self.agent.supervisor();
        let mach_id = self.agent.machine().id();

        let all = registry.processes().await?;
        self.agent.save_processes_to_cache(all.clone());

        let mut plan = plan_reconcile(&all, mach_id, &supervisor.states());
        plan.endpoints
            .insert(REGISTRY_ADDR_VAR.to_string(), registry.endpoints().to_string());

        let mut changed = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            let proc_id = action.proc_id();
            let applied = match action {
                ReconcileAction::Create(status) => supervisor
                    .create_process(status, &plan.endpoints)
                    .await
                    .map(|p| info!(proc_id, state = %p.state(), "local process created")),
                ReconcileAction::Start(_) => supervisor.start_process(proc_id, &plan.endpoints).await,
                ReconcileAction::Stop(_) => supervisor.stop_process(proc_id).await,
                ReconcileAction::Destroy(_) => supervisor
                    .destroy_process(proc_id)
                    .await
                    .map(|()| info!(proc_id, "local process destroyed")),
            };
            if let Err(e) = applied {
                error!(proc_id, ?action, error = %e, "reconcile action failed");
                return Err(e);
            }
            changed.push(proc_id.to_string());
        }

        Ok(changed)
    }
}
