// tests/etcd_store.rs

mod common;
use crate::common::builders::RunInfoBuilder;
use crate::common::fixtures::{TEST_PREFIX, scratch_dir, test_config};
use crate::common::{FakeSampler, TTL, init_tracing, register, with_timeout};

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use procfleet::minion::MinionServer;
use procfleet::registry::{FIRST_PROC_ID, Registry, RegistryEvent};
use procfleet::service::RunInfoOverride;
use procfleet::store::{EtcdStore, GetOptions, KvStore, SetOptions, StoreError};
use procfleet::types::ProcessState;
use procfleet_test_utils::fake_etcd::{FakeEtcd, dead_endpoint};

type TestResult = Result<(), Box<dyn Error>>;

fn etcd_registry(endpoints: &[String]) -> Registry {
    let store = EtcdStore::new(endpoints).expect("building etcd client");
    Registry::new(
        Arc::new(store) as Arc<dyn KvStore>,
        TEST_PREFIX,
        Duration::from_secs(2),
        "127.0.0.1:2379",
    )
}

async fn eventually_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn registry_round_trips_over_http() -> TestResult {
    init_tracing();
    let etcd = FakeEtcd::start().await;
    let reg = etcd_registry(&[etcd.endpoint()]);

    assert!(!reg.is_bootstrapped().await?);
    reg.bootstrap().await?;
    assert!(reg.is_bootstrapped().await?);

    let info = RunInfoBuilder::shell("exec sleep 30").env("MODE", "a b&c=d").build();
    let proc_id = reg.new_process("M1", "svc", &info).await?;
    assert_eq!(proc_id.parse::<u64>()?, FIRST_PROC_ID);

    let status = reg.process(&proc_id).await?;
    assert_eq!(status.run_info, info);
    assert_eq!(status.desired_state, ProcessState::Started);

    // The same state is visible to anyone reading the cluster.
    let key = format!("{TEST_PREFIX}/process/{proc_id}-M1-svc/current-state");
    let node = etcd.store().get(&key, GetOptions::quorum()).await?;
    assert_eq!(node.value, "StateStopped");

    reg.update_process_state(&proc_id, "M1", "svc", ProcessState::Started, true, TTL)
        .await?;
    reg.update_process_state(&proc_id, "M1", "svc", ProcessState::Started, true, TTL)
        .await?;
    let status = reg.process(&proc_id).await?;
    assert_eq!(status.current_state, ProcessState::Started);
    assert!(status.is_alive);

    reg.delete_process(&proc_id).await?;
    assert!(reg.process(&proc_id).await.unwrap_err().is_not_found());

    let requests = etcd.requests();
    assert!(requests.iter().any(|r| r.starts_with("PUT /v2/keys/_pf_test/max-process-id")));
    assert!(requests.iter().any(|r| r.starts_with("DELETE /v2/keys/_pf_test/process/")));
    Ok(())
}

#[tokio::test]
async fn failed_compare_reports_the_stored_value() -> TestResult {
    init_tracing();
    let etcd = FakeEtcd::start().await;
    let store = EtcdStore::new(&[etcd.endpoint()])?;

    store.set("/k", "a", SetOptions::default()).await?;
    let err = store.set("/k", "c", SetOptions::cas("b")).await.unwrap_err();
    assert_eq!(
        err,
        StoreError::TestFailed {
            key: "/k".into(),
            expected: "b".into(),
            actual: "a".into(),
        }
    );
    assert!(matches!(
        store.set("/k", "x", SetOptions::create()).await,
        Err(StoreError::NodeExists(_))
    ));
    assert!(matches!(
        store.get("/missing", GetOptions::default()).await,
        Err(StoreError::KeyNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoints_are_skipped() -> TestResult {
    init_tracing();
    let etcd = FakeEtcd::start().await;
    let reg = etcd_registry(&[dead_endpoint().await, etcd.endpoint()]);

    reg.bootstrap().await?;
    register(&reg, "M1", "10.0.0.1").await;
    assert!(reg.machine("M1").await?.is_alive);
    Ok(())
}

#[tokio::test]
async fn no_reachable_endpoint_is_unavailable() -> TestResult {
    init_tracing();
    let reg = etcd_registry(&[dead_endpoint().await]);

    let err = reg.is_bootstrapped().await.unwrap_err();
    assert_eq!(err.code(), "unavailable");
    assert!(!err.is_fatal());
    Ok(())
}

#[tokio::test]
async fn announcements_arrive_through_the_long_poll() -> TestResult {
    init_tracing();
    let etcd = FakeEtcd::start().await;
    let reg = etcd_registry(&[etcd.endpoint()]);
    reg.bootstrap().await?;
    let mut events = reg.event_stream();

    // A change made before the poll is parked is missed; keep announcing.
    let mut seen = None;
    for _ in 0..25 {
        reg.announce(RegistryEvent::ProcessTargetStateChange).await?;
        seen = events.next(Duration::from_millis(200)).await;
        if seen.is_some() {
            break;
        }
    }
    assert_eq!(seen, Some(RegistryEvent::ProcessTargetStateChange));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn minions_on_two_hosts_share_one_registry() -> TestResult {
    init_tracing();
    let etcd = FakeEtcd::start().await;
    let (dir_a, dir_b) = (scratch_dir(), scratch_dir());

    let mut server = Vec::new();
    for dir in [&dir_a, &dir_b] {
        let store = Arc::new(EtcdStore::new(&[etcd.endpoint()])?) as Arc<dyn KvStore>;
        let minion = MinionServer::init(test_config(dir.path()), store)
            .await?
            .with_sampler(FakeSampler::typical().factory());
        minion.run().await?;
        server.push(minion);
    }
    let (host_a, host_b) = (&server[0], &server[1]);
    let id_b = host_b.agent().machine().id().to_string();
    assert_ne!(host_a.agent().machine().id(), id_b);

    // Host A sees host B's registration and places work on it.
    let machines = host_a.agent().registry().machines().await?;
    assert_eq!(machines.len(), 2);
    let proc_id = host_a
        .agent()
        .start_new_process(
            &id_b,
            "TiDB",
            &RunInfoOverride {
                command: "bin/sh".into(),
                args: vec!["-c".into(), "exec sleep 30".into()],
                ..Default::default()
            },
        )
        .await?;

    let supervisor_b = host_b.agent().supervisor().clone();
    let registry_a = host_a.agent().registry().clone();
    let converged = eventually_async(|| {
        let registry = registry_a.clone();
        let proc_id = proc_id.clone();
        let supervisor = supervisor_b.clone();
        async move {
            supervisor.find_by_proc_id(&proc_id).is_some()
                && registry
                    .process(&proc_id)
                    .await
                    .is_ok_and(|p| p.current_state == ProcessState::Started && p.is_alive)
        }
    })
    .await;
    assert!(converged, "host B never ran {proc_id}");
    assert_eq!(host_a.agent().supervisor().total(), 0);

    for minion in &server {
        with_timeout(minion.kill()).await?;
        with_timeout(minion.purge()).await?;
    }
    Ok(())
}
