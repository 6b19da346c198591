// src/supervisor/process.rs

//! Per-process state machine: Stopped ⇄ Started.
//!
//! `state` and the active run live behind one `RwLock` per process, so
//! operations on different processes never contend. Start and stop are
//! additionally serialised per process by an async mutex held across the
//! (possibly slow) launch or termination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::SupervisorSettings;
use super::run::{ProcRun, RunSnapshot, RunSpec};
use super::stop::{StopPolicy, escalate_stop};
use crate::errors::{Error, Result};
use crate::model::ProcessStatus;
use crate::template;
use crate::types::ProcessState;

#[derive(Debug)]
pub struct Process {
    proc_id: String,
    svc_name: String,
    mach_id: String,
    executor: Vec<String>,
    command: PathBuf,
    args: Vec<String>,
    environment: HashMap<String, String>,
    metadata: HashMap<String, String>,
    pwd: PathBuf,
    log_dir: PathBuf,
    stdout_template: String,
    stderr_template: String,
    stop_policy: StopPolicy,
    inner: Arc<RwLock<ProcessInner>>,
    transition: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct ProcessInner {
    state: ProcessState,
    active: Option<Arc<ProcRun>>,
    runs: Vec<Arc<ProcRun>>,
    next_seq: u64,
}

/// Serializable view of a local process, used in status dumps.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub proc_id: String,
    pub svc_name: String,
    pub state: ProcessState,
    pub active: bool,
    pub runs: Vec<RunSnapshot>,
}

impl Process {
    /// Resolve the executable and prepare the log directory. The process
    /// starts out Stopped.
    pub(crate) async fn new(status: &ProcessStatus, settings: &SupervisorSettings) -> Result<Self> {
        let info = &status.run_info;
        if info.command.trim().is_empty() {
            return Err(Error::supervision(&status.proc_id, "no command configured"));
        }

        let command = settings.root_dir.join(&info.command);
        let is_file = tokio::fs::metadata(&command)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(Error::supervision(
                &status.proc_id,
                format!("executable {} not found", command.display()),
            ));
        }

        let pwd = settings.data_dir.clone();
        let log_dir = pwd.join("logs");
        tokio::fs::create_dir_all(&log_dir).await?;

        let metadata = HashMap::from([
            ("HOST_NAME".to_string(), info.host_name.clone()),
            ("HOST_IP".to_string(), info.host_ip.clone()),
            ("HOST_REGION".to_string(), info.host_region.clone()),
            ("HOST_IDC".to_string(), info.host_idc.clone()),
            ("SERVICE".to_string(), status.svc_name.clone()),
        ]);

        Ok(Self {
            proc_id: status.proc_id.clone(),
            svc_name: status.svc_name.clone(),
            mach_id: status.mach_id.clone(),
            executor: info.executor.clone(),
            command,
            args: info.args.clone(),
            environment: info.environment.clone(),
            metadata,
            pwd,
            log_dir,
            stdout_template: settings.stdout_template.clone(),
            stderr_template: settings.stderr_template.clone(),
            stop_policy: settings.stop,
            inner: Arc::new(RwLock::new(ProcessInner {
                state: ProcessState::Stopped,
                active: None,
                runs: Vec::new(),
                next_seq: 0,
            })),
            transition: tokio::sync::Mutex::new(()),
        })
    }

    pub fn proc_id(&self) -> &str {
        &self.proc_id
    }

    pub fn svc_name(&self) -> &str {
        &self.svc_name
    }

    pub fn mach_id(&self) -> &str {
        &self.mach_id
    }

    pub fn state(&self) -> ProcessState {
        self.inner.read().state
    }

    /// True while an OS execution is in flight.
    pub fn is_active(&self) -> bool {
        self.inner.read().active.is_some()
    }

    pub fn active_run(&self) -> Option<Arc<ProcRun>> {
        self.inner.read().active.clone()
    }

    /// Every run ever launched, oldest first.
    pub fn runs(&self) -> Vec<Arc<ProcRun>> {
        self.inner.read().runs.clone()
    }

    /// Launch a new run.
    ///
    /// Template variables, lowest precedence first: `PROCID`, `RUN`, `PWD`;
    /// host metadata and `SERVICE`; the declared environment; `endpoints`.
    pub async fn start(&self, endpoints: &HashMap<String, String>) -> Result<()> {
        let _transition = self.transition.lock().await;

        let seq = {
            let mut inner = self.inner.write();
            if inner.active.is_some() {
                return Err(Error::supervision(&self.proc_id, "process is already running"));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            seq
        };

        let vars = self.template_vars(seq, endpoints);
        let mut commandline = template::expand_all(&self.executor, &vars);
        commandline.push(template::expand(&self.command.to_string_lossy(), &vars));
        commandline.extend(template::expand_all(&self.args, &vars));

        let spec = RunSpec {
            proc_id: self.proc_id.clone(),
            seq,
            commandline,
            environment: self.environment.clone(),
            pwd: self.pwd.clone(),
            stdout_path: self.log_dir.join(template::expand(&self.stdout_template, &vars)),
            stderr_path: self.log_dir.join(template::expand(&self.stderr_template, &vars)),
        };
        let run = ProcRun::launch(spec).await?;

        {
            let mut inner = self.inner.write();
            inner.runs.push(Arc::clone(&run));
            inner.active = Some(Arc::clone(&run));
            inner.state = ProcessState::Started;
        }
        info!(proc_id = %self.proc_id, svc = %self.svc_name, run = seq, pid = run.pid(), "process started");

        let inner = Arc::clone(&self.inner);
        let proc_id = self.proc_id.clone();
        tokio::spawn(async move {
            let exit = run.wait().await;
            let mut guard = inner.write();
            if guard.active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &run)) {
                guard.active = None;
                warn!(proc_id = %proc_id, run = run.seq(), ?exit, "process exited on its own");
            }
        });

        Ok(())
    }

    /// Stop the active run, escalating signals as needed. Without an active
    /// run this only records the Stopped state.
    pub async fn stop(&self) -> Result<()> {
        let _transition = self.transition.lock().await;

        let Some(run) = self.active_run() else {
            self.inner.write().state = ProcessState::Stopped;
            debug!(proc_id = %self.proc_id, "no active run; marked stopped");
            return Ok(());
        };

        let signal = escalate_stop(run.as_ref(), &self.stop_policy).await?;

        let mut inner = self.inner.write();
        if inner.active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &run)) {
            inner.active = None;
        }
        inner.state = ProcessState::Stopped;
        info!(proc_id = %self.proc_id, run = run.seq(), ?signal, "process stopped");
        Ok(())
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let inner = self.inner.read();
        ProcessSnapshot {
            proc_id: self.proc_id.clone(),
            svc_name: self.svc_name.clone(),
            state: inner.state,
            active: inner.active.is_some(),
            runs: inner.runs.iter().map(|r| r.snapshot()).collect(),
        }
    }

    fn template_vars(&self, seq: u64, endpoints: &HashMap<String, String>) -> HashMap<String, String> {
        let mut vars = HashMap::from([
            ("PROCID".to_string(), self.proc_id.clone()),
            ("RUN".to_string(), seq.to_string()),
            ("PWD".to_string(), self.pwd.to_string_lossy().into_owned()),
        ]);
        vars.extend(self.metadata.clone());
        vars.extend(self.environment.clone());
        vars.extend(endpoints.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}
