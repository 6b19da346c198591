// src/minion/mod.rs

//! The per-host minion: reconcile planner, the three registry-facing
//! workers, and the server that runs them.

mod heartbeat;
pub mod plan;
mod publisher;
mod reconciler;
mod server;

pub use heartbeat::Heartbeat;
pub use plan::{ReconcileAction, ReconcilePlan, endpoint_map, plan_reconcile};
pub use publisher::Publisher;
pub use reconciler::{REGISTRY_ADDR_VAR, Reconciler};
pub use server::{MinionServer, SamplerFactory};
