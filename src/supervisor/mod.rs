// src/supervisor/mod.rs

//! Local process supervision.
//!
//! [`ProcessManager`] owns the map of logical processes this minion runs.
//! The map lock is held only for lookups, inserts and removals. Starting
//! and stopping happen on a cloned `Arc<Process>` outside it, so a slow
//! termination never blocks readers.

mod logwriter;
mod process;
mod run;
mod stop;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::MinionConfig;
use crate::errors::{Error, Result};
use crate::model::ProcessStatus;
use crate::types::ProcessState;

pub use logwriter::{LogHandle, RING_BUFFER_CAPACITY, RingBuffer};
pub use process::{Process, ProcessSnapshot};
pub use run::{ExitInfo, ProcRun, RunEvent, RunSnapshot};
pub use stop::{StopPolicy, StopSignal, Terminate, escalate_stop};

/// Filesystem layout and stop timings shared by every supervised process.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Commands are resolved relative to this directory.
    pub root_dir: PathBuf,
    /// Working directory of every run; captured output goes to `logs/`.
    pub data_dir: PathBuf,
    pub stop: StopPolicy,
    pub stdout_template: String,
    pub stderr_template: String,
}

impl SupervisorSettings {
    pub fn from_config(config: &MinionConfig) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            data_dir: config.data_dir.clone(),
            stop: config.supervisor.stop,
            stdout_template: config.supervisor.stdout_template.clone(),
            stderr_template: config.supervisor.stderr_template.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ProcessManager {
    settings: SupervisorSettings,
    procs: RwLock<HashMap<String, Arc<Process>>>,
}

impl ProcessManager {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            procs: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Take over a process placed on this machine. Starts it right away when
    /// its desired state is Started.
    pub async fn create_process(
        &self,
        status: &ProcessStatus,
        endpoints: &HashMap<String, String>,
    ) -> Result<Arc<Process>> {
        if self.procs.read().contains_key(&status.proc_id) {
            return Err(Error::Conflict(format!(
                "process {} is already supervised",
                status.proc_id
            )));
        }

        let process = Arc::new(Process::new(status, &self.settings).await?);
        if status.desired_state == ProcessState::Started {
            process.start(endpoints).await?;
        }

        let raced = {
            let mut procs = self.procs.write();
            if procs.contains_key(&status.proc_id) {
                true
            } else {
                procs.insert(status.proc_id.clone(), Arc::clone(&process));
                false
            }
        };
        if raced {
            // Lost against a concurrent create; do not leak the run.
            if let Err(e) = process.stop().await {
                warn!(proc_id = %status.proc_id, error = %e, "failed to stop duplicate process");
            }
            return Err(Error::Conflict(format!(
                "process {} is already supervised",
                status.proc_id
            )));
        }

        info!(
            proc_id = %status.proc_id,
            svc = %status.svc_name,
            desired = %status.desired_state,
            "process created"
        );
        Ok(process)
    }

    pub async fn start_process(
        &self,
        proc_id: &str,
        endpoints: &HashMap<String, String>,
    ) -> Result<()> {
        let process = self.require(proc_id)?;
        if process.state() == ProcessState::Started {
            warn!(proc_id, "start requested but process is already started");
            return Ok(());
        }
        process.start(endpoints).await
    }

    pub async fn stop_process(&self, proc_id: &str) -> Result<()> {
        let process = self.require(proc_id)?;
        if process.state() == ProcessState::Stopped {
            warn!(proc_id, "stop requested but process is already stopped");
            return Ok(());
        }
        process.stop().await
    }

    /// Stop the process if it runs, then forget it.
    ///
    /// A failed stop leaves the process in the map so a later pass can
    /// retry.
    pub async fn destroy_process(&self, proc_id: &str) -> Result<()> {
        let process = self.require(proc_id)?;
        if process.state() == ProcessState::Started || process.is_active() {
            process.stop().await?;
        }
        self.procs.write().remove(proc_id);
        info!(proc_id, svc = %process.svc_name(), "process destroyed");
        Ok(())
    }

    /// Stop and remove every process. Errors are logged and the first one is
    /// returned after all processes were attempted.
    pub async fn purge(&self) -> Result<()> {
        let mut first_err = None;
        for process in self.all_processes() {
            if let Err(e) = self.destroy_process(process.proc_id()).await {
                warn!(proc_id = %process.proc_id(), error = %e, "failed to purge process");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// All supervised processes, ordered by ID.
    pub fn all_processes(&self) -> Vec<Arc<Process>> {
        let mut out: Vec<_> = self.procs.read().values().cloned().collect();
        out.sort_by(|a, b| compare_ids(a.proc_id(), b.proc_id()));
        out
    }

    /// Processes with an OS execution in flight.
    pub fn active_processes(&self) -> Vec<Arc<Process>> {
        let mut out = self.all_processes();
        out.retain(|p| p.is_active());
        out
    }

    pub fn total(&self) -> usize {
        self.procs.read().len()
    }

    pub fn total_active(&self) -> usize {
        self.procs.read().values().filter(|p| p.is_active()).count()
    }

    pub fn find_by_proc_id(&self, proc_id: &str) -> Option<Arc<Process>> {
        self.procs.read().get(proc_id).cloned()
    }

    pub fn find_by_svc_name(&self, svc_name: &str) -> Vec<Arc<Process>> {
        let mut out = self.all_processes();
        out.retain(|p| p.svc_name() == svc_name);
        out
    }

    /// Local state of every supervised process, keyed by ID.
    pub fn states(&self) -> HashMap<String, ProcessState> {
        self.procs
            .read()
            .iter()
            .map(|(id, p)| (id.clone(), p.state()))
            .collect()
    }

    fn require(&self, proc_id: &str) -> Result<Arc<Process>> {
        self.find_by_proc_id(proc_id)
            .ok_or_else(|| Error::NotFound(format!("local process {proc_id}")))
    }
}

/// Numeric order for numeric IDs, lexical otherwise.
fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProcessRunInfo;

    fn settings(dir: &std::path::Path) -> SupervisorSettings {
        SupervisorSettings {
            root_dir: PathBuf::from("/"),
            data_dir: dir.to_path_buf(),
            stop: StopPolicy::default(),
            stdout_template: "$SERVICE_$PROCID_$RUN.out".into(),
            stderr_template: "$SERVICE_$PROCID_$RUN.err".into(),
        }
    }

    fn status(proc_id: &str, command: &str, desired: ProcessState) -> ProcessStatus {
        ProcessStatus {
            proc_id: proc_id.into(),
            svc_name: "svc".into(),
            mach_id: "M1".into(),
            desired_state: desired,
            current_state: ProcessState::Stopped,
            is_alive: false,
            run_info: ProcessRunInfo {
                command: command.into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn ids_sort_numerically() {
        let mut ids = vec!["10010", "9999", "10002"];
        ids.sort_by(|a, b| compare_ids(a, b));
        assert_eq!(ids, vec!["9999", "10002", "10010"]);
    }

    #[tokio::test]
    async fn missing_executable_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessManager::new(settings(dir.path()));

        let err = mgr
            .create_process(
                &status("10000", "no/such/binary", ProcessState::Started),
                &HashMap::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "supervision_failure");
        assert_eq!(mgr.total(), 0);
    }

    #[tokio::test]
    async fn unknown_process_operations_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessManager::new(settings(dir.path()));

        assert!(mgr.destroy_process("42").await.unwrap_err().is_not_found());
        assert!(mgr.stop_process("42").await.unwrap_err().is_not_found());
        assert!(
            mgr.start_process("42", &HashMap::new())
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(mgr.total(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopped_process_is_created_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ProcessManager::new(settings(dir.path()));

        let p = mgr
            .create_process(&status("10000", "bin/sh", ProcessState::Stopped), &HashMap::new())
            .await
            .unwrap();

        assert_eq!(p.state(), ProcessState::Stopped);
        assert!(!p.is_active());
        assert_eq!(mgr.total(), 1);
        assert_eq!(mgr.total_active(), 0);

        let dup = mgr
            .create_process(&status("10000", "bin/sh", ProcessState::Stopped), &HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(dup.code(), "conflict");

        mgr.destroy_process("10000").await.unwrap();
        assert_eq!(mgr.total(), 0);
    }
}
