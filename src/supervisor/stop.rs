// src/supervisor/stop.rs

//! Signal escalation for stopping a running process.
//!
//! SIGINT, then SIGTERM, then SIGKILL, each followed by a bounded wait for
//! the run to report termination. Surviving SIGKILL is a supervision
//! failure.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::{Error, Result};

/// How long to wait after each signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPolicy {
    pub interrupt_grace: Duration,
    pub terminate_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            interrupt_grace: Duration::from_millis(5000),
            terminate_grace: Duration::from_millis(5000),
            kill_grace: Duration::from_millis(1000),
        }
    }
}

impl StopPolicy {
    fn ladder(&self) -> [(StopSignal, Duration); 3] {
        [
            (StopSignal::Interrupt, self.interrupt_grace),
            (StopSignal::Terminate, self.terminate_grace),
            (StopSignal::Kill, self.kill_grace),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl StopSignal {
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Something that can be signalled and observed until it stops.
///
/// Implemented by [`super::ProcRun`]; tests substitute scripted fakes.
pub trait Terminate: Send + Sync {
    fn proc_id(&self) -> &str;

    fn send_signal(&self, signal: StopSignal) -> std::io::Result<()>;

    /// Resolve to `true` once the target has stopped, or `false` if it is
    /// still running after `timeout`.
    fn wait_stopped(&self, timeout: Duration) -> impl Future<Output = bool> + Send;
}

/// ESRCH: no such process, so there is nothing left to stop.
fn is_gone(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32)
}

/// Escalate until `target` stops. Returns the signal that did it.
pub async fn escalate_stop<T: Terminate>(target: &T, policy: &StopPolicy) -> Result<StopSignal> {
    for (signal, grace) in policy.ladder() {
        if let Err(e) = target.send_signal(signal) {
            if is_gone(&e) || target.wait_stopped(Duration::ZERO).await {
                info!(proc_id = %target.proc_id(), ?signal, "process already gone");
                return Ok(signal);
            }
            return Err(Error::supervision(
                target.proc_id(),
                format!("sending {signal:?} failed: {e}"),
            ));
        }

        if target.wait_stopped(grace).await {
            info!(proc_id = %target.proc_id(), ?signal, "process stopped");
            return Ok(signal);
        }
        warn!(proc_id = %target.proc_id(), ?signal, ?grace, "process still running; escalating");
    }

    Err(Error::supervision(
        target.proc_id(),
        "process survived SIGKILL",
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    /// Stops `delay` after receiving `stops_on`, or never.
    struct ScriptedTarget {
        stops_on: Option<StopSignal>,
        delay: Duration,
        sent: Mutex<Vec<StopSignal>>,
        stop_at: Mutex<Option<Instant>>,
        signal_fails: AtomicBool,
        vanished: AtomicBool,
    }

    impl ScriptedTarget {
        fn new(stops_on: Option<StopSignal>, delay: Duration) -> Self {
            Self {
                stops_on,
                delay,
                sent: Mutex::new(Vec::new()),
                stop_at: Mutex::new(None),
                signal_fails: AtomicBool::new(false),
                vanished: AtomicBool::new(false),
            }
        }

        fn sent(&self) -> Vec<StopSignal> {
            self.sent.lock().clone()
        }
    }

    impl Terminate for ScriptedTarget {
        fn proc_id(&self) -> &str {
            "10000"
        }

        fn send_signal(&self, signal: StopSignal) -> std::io::Result<()> {
            if self.signal_fails.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("EPERM"));
            }
            if self.vanished.load(Ordering::SeqCst) {
                return Err(std::io::Error::from_raw_os_error(nix::errno::Errno::ESRCH as i32));
            }
            self.sent.lock().push(signal);
            if self.stops_on == Some(signal) {
                *self.stop_at.lock() = Some(Instant::now() + self.delay);
            }
            Ok(())
        }

        fn wait_stopped(&self, timeout: Duration) -> impl Future<Output = bool> + Send {
            let stop_at = *self.stop_at.lock();
            async move {
                let deadline = Instant::now() + timeout;
                match stop_at {
                    Some(at) if at <= deadline => {
                        tokio::time::sleep_until(at).await;
                        true
                    }
                    _ => {
                        tokio::time::sleep_until(deadline).await;
                        false
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_is_enough_for_cooperative_process() {
        let t = ScriptedTarget::new(Some(StopSignal::Interrupt), Duration::from_millis(4900));
        let started = Instant::now();

        let sig = escalate_stop(&t, &StopPolicy::default()).await.unwrap();

        assert_eq!(sig, StopSignal::Interrupt);
        assert_eq!(t.sent(), vec![StopSignal::Interrupt]);
        assert_eq!(started.elapsed(), Duration::from_millis(4900));
    }

    #[tokio::test(start_paused = true)]
    async fn kill_stops_process_ignoring_int_and_term() {
        let t = ScriptedTarget::new(Some(StopSignal::Kill), Duration::from_millis(900));
        let started = Instant::now();

        let sig = escalate_stop(&t, &StopPolicy::default()).await.unwrap();

        assert_eq!(sig, StopSignal::Kill);
        assert_eq!(
            t.sent(),
            vec![StopSignal::Interrupt, StopSignal::Terminate, StopSignal::Kill]
        );
        assert_eq!(started.elapsed(), Duration::from_millis(10_900));
    }

    #[tokio::test(start_paused = true)]
    async fn surviving_kill_is_a_supervision_failure() {
        let t = ScriptedTarget::new(None, Duration::ZERO);

        let err = escalate_stop(&t, &StopPolicy::default()).await.unwrap_err();

        assert!(matches!(err, Error::Supervision { ref proc_id, .. } if proc_id == "10000"));
        assert_eq!(t.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_signal_on_running_process_is_an_error() {
        let t = ScriptedTarget::new(None, Duration::ZERO);
        t.signal_fails.store(true, Ordering::SeqCst);

        let err = escalate_stop(&t, &StopPolicy::default()).await.unwrap_err();
        assert_eq!(err.code(), "supervision_failure");
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_process_counts_as_stopped() {
        let t = ScriptedTarget::new(None, Duration::ZERO);
        t.vanished.store(true, Ordering::SeqCst);

        let sig = escalate_stop(&t, &StopPolicy::default()).await.unwrap();
        assert_eq!(sig, StopSignal::Interrupt);
        assert!(t.sent().is_empty());
    }
}
