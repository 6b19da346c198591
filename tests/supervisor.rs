// tests/supervisor.rs
#![cfg(unix)]

mod common;
use crate::common::builders::{ProcessStatusBuilder, RunInfoBuilder, endpoints};
use crate::common::fixtures::{process_manager, scratch_dir};
use crate::common::{eventually, init_tracing, with_timeout};

use std::collections::HashMap;
use std::error::Error;
use std::path::Path;
use std::time::Instant;

use procfleet::model::ProcessStatus;
use procfleet::supervisor::{ProcessManager, Terminate};
use procfleet::types::ProcessState;

type TestResult = Result<(), Box<dyn Error>>;

fn shell_process(proc_id: &str, script: &str) -> ProcessStatus {
    ProcessStatusBuilder::new(proc_id, "M1", "svc")
        .run_info(RunInfoBuilder::shell(script).build())
        .build()
}

fn log_path(data_dir: &Path, proc_id: &str, run: u64, ext: &str) -> std::path::PathBuf {
    data_dir.join("logs").join(format!("svc_{proc_id}_{run}.{ext}"))
}

fn log_contains(path: &Path, needle: &str) -> bool {
    std::fs::read_to_string(path)
        .map(|s| s.contains(needle))
        .unwrap_or(false)
}

#[tokio::test]
async fn start_and_stop_a_real_process() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());

    let p = mgr
        .create_process(&shell_process("10000", "exec sleep 30"), &HashMap::new())
        .await?;
    assert_eq!(p.state(), ProcessState::Started);
    assert!(p.is_active());
    assert_eq!(mgr.total_active(), 1);

    let run = p.active_run().ok_or("no active run")?;
    assert!(run.is_running());

    with_timeout(mgr.stop_process("10000")).await?;

    assert_eq!(p.state(), ProcessState::Stopped);
    assert!(!p.is_active());
    assert!(!run.is_running());
    assert_eq!(run.exit().and_then(|e| e.signal), Some(sigint()));
    assert_eq!(mgr.total(), 1);
    assert_eq!(mgr.total_active(), 0);

    // A restart launches a fresh run with the next sequence number.
    mgr.start_process("10000", &HashMap::new()).await?;
    let runs = p.runs();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].seq(), 1);
    assert_ne!(runs[0].pid(), runs[1].pid());

    with_timeout(mgr.destroy_process("10000")).await?;
    assert_eq!(mgr.total(), 0);
    assert!(!runs[1].is_running());
    Ok(())
}

fn sigint() -> i32 {
    nix::sys::signal::Signal::SIGINT as i32
}

#[tokio::test]
async fn repeated_start_and_stop_are_no_ops() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());
    let p = mgr
        .create_process(&shell_process("10000", "exec sleep 30"), &HashMap::new())
        .await?;

    mgr.start_process("10000", &HashMap::new()).await?;
    assert_eq!(p.runs().len(), 1);

    with_timeout(mgr.stop_process("10000")).await?;
    with_timeout(mgr.stop_process("10000")).await?;
    assert_eq!(p.state(), ProcessState::Stopped);
    assert_eq!(p.runs().len(), 1);
    Ok(())
}

#[tokio::test]
async fn stubborn_process_is_killed() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());
    let stdout = log_path(dir.path(), "10000", 0, "out");

    let p = mgr
        .create_process(
            &shell_process("10000", "trap '' INT TERM; echo ready; exec sleep 30"),
            &HashMap::new(),
        )
        .await?;
    assert!(eventually(|| log_contains(&stdout, "ready")).await);

    let run = p.active_run().ok_or("no active run")?;
    let started = Instant::now();
    with_timeout(mgr.stop_process("10000")).await?;

    assert_eq!(
        run.exit().and_then(|e| e.signal),
        Some(nix::sys::signal::Signal::SIGKILL as i32)
    );
    // Both graces of the fast stop policy were waited out.
    assert!(started.elapsed() >= std::time::Duration::from_millis(600));
    let events: Vec<String> = run.events().into_iter().map(|e| e.message).collect();
    assert!(events.iter().any(|m| m.contains("SIGKILL")), "{events:?}");
    assert_eq!(p.state(), ProcessState::Stopped);
    Ok(())
}

#[tokio::test]
async fn output_is_captured_per_run() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());

    let p = mgr
        .create_process(
            &shell_process("10000", "echo to-stdout; echo to-stderr >&2"),
            &HashMap::new(),
        )
        .await?;
    let run = p.active_run().ok_or("no active run")?;
    let exit = with_timeout(run.wait()).await.ok_or("no exit status")?;
    assert!(exit.success());

    assert_eq!(run.stdout().contents().await, "to-stdout\n");
    assert_eq!(run.stderr().contents().await, "to-stderr\n");
    assert_eq!(
        run.stdout().path(),
        Some(log_path(dir.path(), "10000", 0, "out").as_path())
    );
    assert_eq!(
        run.stderr().path(),
        Some(log_path(dir.path(), "10000", 0, "err").as_path())
    );
    Ok(())
}

#[tokio::test]
async fn self_exit_clears_active_but_keeps_state() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());

    let p = mgr
        .create_process(&shell_process("10000", "exit 3"), &HashMap::new())
        .await?;

    assert!(eventually(|| !p.is_active()).await);
    assert_eq!(p.state(), ProcessState::Started);
    assert_eq!(p.runs()[0].exit().and_then(|e| e.code), Some(3));
    assert!(mgr.active_processes().is_empty());

    // Stopping with nothing in flight only records the state.
    mgr.stop_process("10000").await?;
    assert_eq!(p.state(), ProcessState::Stopped);
    Ok(())
}

#[tokio::test]
async fn endpoints_and_environment_expand_into_args() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());

    let info = RunInfoBuilder::shell("echo ${PD_ADDR} $MODE ${PROCID} ${RUN} $SERVICE")
        .env("MODE", "fast")
        .build();
    let status = ProcessStatusBuilder::new("10007", "M1", "svc")
        .run_info(info)
        .build();
    let eps = endpoints(&[("PD_ADDR", "http://10.0.0.1:2379")]);

    let p = mgr.create_process(&status, &eps).await?;
    let run = p.active_run().ok_or("no active run")?;
    with_timeout(run.wait()).await;

    assert_eq!(
        run.stdout().contents().await,
        "http://10.0.0.1:2379 fast 10007 0 svc\n"
    );
    assert_eq!(run.commandline()[0], "/bin/sh");
    Ok(())
}

#[tokio::test]
async fn environment_reaches_the_child() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());

    let info = RunInfoBuilder::shell("env")
        .env("GREETING", "hello")
        .build();
    let status = ProcessStatusBuilder::new("10000", "M1", "svc")
        .run_info(info)
        .build();

    let p = mgr.create_process(&status, &HashMap::new()).await?;
    let run = p.active_run().ok_or("no active run")?;
    with_timeout(run.wait()).await;

    let env = run.stdout().contents().await;
    assert!(env.lines().any(|l| l == "GREETING=hello"), "{env}");
    Ok(())
}

#[tokio::test]
async fn destroying_an_unknown_process_leaves_the_set_unchanged() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());
    mgr.create_process(
        &ProcessStatusBuilder::new("10000", "M1", "svc")
            .desired(ProcessState::Stopped)
            .run_info(RunInfoBuilder::shell("true").build())
            .build(),
        &HashMap::new(),
    )
    .await?;

    let err = mgr.destroy_process("99999").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(mgr.total(), 1);
    assert!(mgr.find_by_proc_id("10000").is_some());
    Ok(())
}

#[tokio::test]
async fn lookups_by_service_and_purge() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr: ProcessManager = process_manager(dir.path());

    for (id, svc) in [("10002", "pd"), ("10000", "tidb"), ("10001", "tidb")] {
        let status = ProcessStatusBuilder::new(id, "M1", svc)
            .run_info(RunInfoBuilder::shell("exec sleep 30").build())
            .build();
        mgr.create_process(&status, &HashMap::new()).await?;
    }

    let ids = |v: Vec<std::sync::Arc<procfleet::supervisor::Process>>| -> Vec<String> {
        v.iter().map(|p| p.proc_id().to_string()).collect()
    };
    assert_eq!(ids(mgr.all_processes()), vec!["10000", "10001", "10002"]);
    assert_eq!(ids(mgr.find_by_svc_name("tidb")), vec!["10000", "10001"]);
    assert_eq!(mgr.total_active(), 3);

    let states = mgr.states();
    assert!(states.values().all(|s| *s == ProcessState::Started));

    with_timeout(mgr.purge()).await?;
    assert_eq!(mgr.total(), 0);
    Ok(())
}

#[tokio::test]
async fn proc_run_reports_its_id_for_signalling() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());
    let p = mgr
        .create_process(&shell_process("10000", "exec sleep 30"), &HashMap::new())
        .await?;
    let run = p.active_run().ok_or("no active run")?;

    assert_eq!(Terminate::proc_id(run.as_ref()), "10000");
    assert!(!run.wait_stopped(std::time::Duration::from_millis(50)).await);

    with_timeout(mgr.stop_process("10000")).await?;
    assert!(run.wait_stopped(std::time::Duration::ZERO).await);
    Ok(())
}

#[tokio::test]
async fn exit_during_interrupt_grace_with_lingering_child_is_a_stop() -> TestResult {
    init_tracing();
    let dir = scratch_dir();
    let mgr = process_manager(dir.path());
    let stdout = log_path(dir.path(), "10000", 0, "out");

    // The backgrounded sleep keeps the output pipes open after the shell
    // exits.
    let script = "trap 'sleep 0.15; exit 0' INT; sleep 30 & echo $!; while :; do sleep 0.02; done";
    let p = mgr
        .create_process(&shell_process("10000", script), &HashMap::new())
        .await?;
    assert!(eventually(|| log_contains(&stdout, "\n")).await);
    let run = p.active_run().ok_or("no active run")?;

    with_timeout(mgr.stop_process("10000")).await?;

    assert_eq!(p.state(), ProcessState::Stopped);
    assert_eq!(run.exit().and_then(|e| e.code), Some(0));
    let events: Vec<String> = run.events().into_iter().map(|e| e.message).collect();
    assert!(events.iter().any(|m| m.contains("SIGINT")), "{events:?}");
    assert!(!events.iter().any(|m| m.contains("SIGTERM")), "{events:?}");

    with_timeout(run.wait()).await;
    let lingering: i32 = run.stdout().contents().await.trim().parse()?;
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(lingering),
        nix::sys::signal::Signal::SIGKILL,
    );
    Ok(())
}
