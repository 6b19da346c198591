// src/registry/event.rs

//! Change events published under `<prefix>/job/`.
//!
//! A leaf named `process-state` or `machine-state` changing below the job
//! root wakes the reconciler early. Nothing depends on an event arriving;
//! the reconcile timer is still the authoritative trigger.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::{JOB_DIR, Registry};
use crate::errors::Result;
use crate::store::{SetOptions, Watcher, base_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    ProcessTargetStateChange,
    MachineStateChange,
}

impl RegistryEvent {
    pub fn key_name(self) -> &'static str {
        match self {
            RegistryEvent::ProcessTargetStateChange => "process-state",
            RegistryEvent::MachineStateChange => "machine-state",
        }
    }

    pub fn from_key_name(name: &str) -> Option<Self> {
        match name {
            "process-state" => Some(RegistryEvent::ProcessTargetStateChange),
            "machine-state" => Some(RegistryEvent::MachineStateChange),
            _ => None,
        }
    }
}

/// Watch over the job root.
#[derive(Debug)]
pub struct EventStream {
    watcher: Watcher,
}

impl EventStream {
    /// Wait up to `timeout` for a recognised event. `None` on timeout.
    pub async fn next(&mut self, timeout: Duration) -> Option<RegistryEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.watcher.next()).await {
                Ok(Some(ev)) if !ev.dir => {
                    if let Some(event) = RegistryEvent::from_key_name(base_name(&ev.key)) {
                        debug!(?event, key = %ev.key, action = ?ev.action, "registry event");
                        return Some(event);
                    }
                    trace!(key = %ev.key, "ignoring unrecognised job key");
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    // Store gone: behave like a plain timer.
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
                Err(_) => return None,
            }
        }
    }
}

impl Registry {
    /// Subscribe to `<prefix>/job`. Only changes after this call are seen.
    pub fn event_stream(&self) -> EventStream {
        EventStream {
            watcher: self.store.watch(&self.key(&[JOB_DIR])),
        }
    }

    /// Touch the job key for `event` so event-stream consumers wake up.
    pub async fn announce(&self, event: RegistryEvent) -> Result<()> {
        let key = self.key(&[JOB_DIR, event.key_name()]);
        let stamp = chrono::Utc::now().to_rfc3339();
        self.call("announce event", self.store.set(&key, &stamp, SetOptions::default()))
            .await?;
        Ok(())
    }
}
