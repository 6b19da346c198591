// src/minion/plan.rs

//! Pure reconcile planning.
//!
//! Given the cluster-wide process set and the state of the locally
//! supervised processes, decide what the supervisor must do. No IO happens
//! here; [`super::Reconciler`] applies the plan.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::ProcessStatus;
use crate::types::ProcessState;

/// One supervisor call the reconciler has to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Not supervised here yet; starts right away if desired Started.
    Create(ProcessStatus),
    Start(String),
    Stop(String),
    /// Supervised here but no longer placed on this machine.
    Destroy(String),
}

impl ReconcileAction {
    pub fn proc_id(&self) -> &str {
        match self {
            ReconcileAction::Create(status) => &status.proc_id,
            ReconcileAction::Start(id) | ReconcileAction::Stop(id) | ReconcileAction::Destroy(id) => {
                id
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Endpoint name -> comma-joined addresses across the whole cluster.
    pub endpoints: HashMap<String, String>,
    /// Creates, starts and stops in process order, then destroys.
    pub actions: Vec<ReconcileAction>,
}

/// Every endpoint of every process, grouped by endpoint name. Addresses keep
/// the order of `all`.
pub fn endpoint_map(all: &[ProcessStatus]) -> HashMap<String, String> {
    let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for status in all {
        for (name, ep) in &status.run_info.endpoints {
            grouped.entry(name.as_str()).or_default().push(ep.to_string());
        }
    }
    grouped
        .into_iter()
        .map(|(name, addrs)| (name.to_string(), addrs.join(",")))
        .collect()
}

pub fn plan_reconcile(
    all: &[ProcessStatus],
    local_mach_id: &str,
    local: &HashMap<String, ProcessState>,
) -> ReconcilePlan {
    let mut actions = Vec::new();
    let mut targeted = HashSet::new();

    for status in all.iter().filter(|p| p.mach_id == local_mach_id) {
        targeted.insert(status.proc_id.as_str());
        match local.get(&status.proc_id) {
            None => actions.push(ReconcileAction::Create(status.clone())),
            Some(&state) if state == status.desired_state => {}
            Some(_) => actions.push(match status.desired_state {
                ProcessState::Started => ReconcileAction::Start(status.proc_id.clone()),
                ProcessState::Stopped => ReconcileAction::Stop(status.proc_id.clone()),
            }),
        }
    }

    let mut stale: Vec<&String> = local
        .keys()
        .filter(|id| !targeted.contains(id.as_str()))
        .collect();
    stale.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    });
    actions.extend(stale.into_iter().map(|id| ReconcileAction::Destroy(id.clone())));

    ReconcilePlan {
        endpoints: endpoint_map(all),
        actions,
    }
}
