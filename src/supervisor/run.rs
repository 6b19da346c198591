// src/supervisor/run.rs

//! One OS-level execution of a logical process.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

use super::logwriter::{LogHandle, LogSink, pump};
use super::stop::{StopSignal, Terminate};
use crate::errors::{Error, Result};

const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Timestamped entry of a run's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// How the OS process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: &std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Fully expanded launch parameters.
#[derive(Debug, Clone)]
pub(crate) struct RunSpec {
    pub proc_id: String,
    pub seq: u64,
    pub commandline: Vec<String>,
    pub environment: HashMap<String, String>,
    pub pwd: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

#[derive(Debug)]
pub struct ProcRun {
    seq: u64,
    proc_id: String,
    pid: u32,
    commandline: Vec<String>,
    started_at: DateTime<Utc>,
    stopped_at: Mutex<Option<DateTime<Utc>>>,
    events: Mutex<Vec<RunEvent>>,
    stdout: LogHandle,
    stderr: LogHandle,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    drained_rx: watch::Receiver<bool>,
}

/// Serializable view of a run, used in status dumps.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub seq: u64,
    pub pid: u32,
    pub commandline: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit: Option<ExitInfo>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub events: Vec<RunEvent>,
}

impl ProcRun {
    /// Spawn the OS process, wire its output, and start the exit watcher.
    ///
    /// Returns once the process is running; termination is observed in the
    /// background.
    pub(crate) async fn launch(spec: RunSpec) -> Result<Arc<ProcRun>> {
        let RunSpec {
            proc_id,
            seq,
            commandline,
            environment,
            pwd,
            stdout_path,
            stderr_path,
        } = spec;

        let (program, args) = commandline
            .split_first()
            .ok_or_else(|| Error::supervision(&proc_id, "empty command line"))?;

        let (stdout_sink, stdout) = LogSink::open(&stdout_path).await;
        let (stderr_sink, stderr) = LogSink::open(&stderr_path).await;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&environment)
            .current_dir(&pwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::supervision(&proc_id, format!("spawning {program:?} failed: {e}"))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::supervision(&proc_id, "spawned process has no pid"))?;

        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(out, stdout_sink, "stdout", proc_id.clone())));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(err, stderr_sink, "stderr", proc_id.clone())));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = watch::channel(false);
        let run = Arc::new(ProcRun {
            seq,
            proc_id,
            pid,
            commandline,
            started_at: Utc::now(),
            stopped_at: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            stdout,
            stderr,
            exit_rx,
            drained_rx,
        });
        run.record(format!("started pid {pid}: {}", run.commandline.join(" ")));
        info!(proc_id = %run.proc_id, run = seq, pid, "process launched");

        let watched = Arc::clone(&run);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from_status(&status),
                Err(e) => {
                    warn!(proc_id = %watched.proc_id, run = watched.seq, error = %e, "waiting on process failed");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            // Reaped: the pid is no longer ours to signal.
            *watched.stopped_at.lock() = Some(Utc::now());
            watched.record(format!("exited: {exit}"));
            info!(
                proc_id = %watched.proc_id,
                run = watched.seq,
                pid = watched.pid,
                code = ?exit.code,
                signal = ?exit.signal,
                "process exited"
            );
            exit_tx.send_replace(Some(exit));

            // Let the pumps drain what the process wrote before it exited.
            // Orphaned grandchildren may hold the pipes open, so this is
            // bounded.
            let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
            for handle in pumps {
                let _ = tokio::time::timeout_at(deadline, handle).await;
            }
            drained_tx.send_replace(true);
        });

        Ok(run)
    }

    fn record(&self, message: String) {
        self.events.lock().push(RunEvent {
            at: Utc::now(),
            message,
        });
    }

    /// Sequence number within the owning process, starting at 0.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn commandline(&self) -> &[String] {
        &self.commandline
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        *self.stopped_at.lock()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    pub fn exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    pub fn stdout(&self) -> &LogHandle {
        &self.stdout
    }

    pub fn stderr(&self) -> &LogHandle {
        &self.stderr
    }

    /// Wait for the process to exit and its output to be flushed.
    pub async fn wait(&self) -> Option<ExitInfo> {
        let mut drained = self.drained_rx.clone();
        let _ = drained.wait_for(|done| *done).await;
        let mut rx = self.exit_rx.clone();
        let waited = rx.wait_for(Option::is_some).await.map(|exit| *exit);
        match waited {
            Ok(exit) => exit,
            Err(_) => *rx.borrow(),
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            seq: self.seq,
            pid: self.pid,
            commandline: self.commandline.clone(),
            started_at: self.started_at,
            stopped_at: self.stopped_at(),
            exit: self.exit(),
            stdout: self.stdout.path().map(|p| p.to_path_buf()),
            stderr: self.stderr.path().map(|p| p.to_path_buf()),
            events: self.events(),
        }
    }
}

impl Terminate for ProcRun {
    fn proc_id(&self) -> &str {
        &self.proc_id
    }

    fn send_signal(&self, sig: StopSignal) -> std::io::Result<()> {
        if !self.is_running() {
            // Reaped already; the pid may belong to someone else now.
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| std::io::Error::other(format!("pid {} out of range", self.pid)))?;
        signal::kill(Pid::from_raw(pid), sig.as_nix()).map_err(std::io::Error::from)?;
        self.record(format!("sent {:?}", sig.as_nix()));
        Ok(())
    }

    fn wait_stopped(&self, timeout: Duration) -> impl Future<Output = bool> + Send {
        let mut rx = self.exit_rx.clone();
        async move {
            let waited = tokio::time::timeout(timeout, async {
                rx.wait_for(Option::is_some).await.map(|_| ())
            })
            .await;
            match waited {
                Ok(Ok(())) => true,
                Ok(Err(_)) => rx.borrow().is_some(),
                Err(_) => false,
            }
        }
    }
}
