use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use procfleet::config::{HostConfig, MinionConfig};
use procfleet::registry::Registry;
use procfleet::store::{KvStore, MemoryStore};
use procfleet::supervisor::{ProcessManager, StopPolicy, SupervisorSettings};

pub const TEST_PREFIX: &str = "/_pf_test";

pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("creating scratch dir")
}

/// Stop policy with short graces so escalation tests stay fast.
pub fn fast_stop() -> StopPolicy {
    StopPolicy {
        interrupt_grace: Duration::from_millis(300),
        terminate_grace: Duration::from_millis(300),
        kill_grace: Duration::from_millis(1000),
    }
}

/// Minion config rooted at `data_dir` with commands resolved against `/`
/// and every interval shortened.
pub fn test_config(data_dir: &Path) -> MinionConfig {
    let mut cfg = MinionConfig::with_data_dir(data_dir);
    cfg.prefix = TEST_PREFIX.to_string();
    cfg.root_dir = "/".into();
    cfg.request_timeout = Duration::from_secs(1);
    cfg.ttl = Duration::from_secs(2);
    cfg.reconcile_interval = Duration::from_millis(200);
    cfg.monitor_interval = Duration::from_millis(100);
    cfg.shutdown_timeout = Duration::from_secs(5);
    cfg.host = HostConfig {
        ip: Some("127.0.0.1".into()),
        name: Some("test-host".into()),
        region: "test-region".into(),
        idc: "test-idc".into(),
    };
    cfg.supervisor.stop = fast_stop();
    cfg
}

pub fn supervisor_settings(data_dir: &Path) -> SupervisorSettings {
    SupervisorSettings::from_config(&test_config(data_dir))
}

pub fn process_manager(data_dir: &Path) -> ProcessManager {
    ProcessManager::new(supervisor_settings(data_dir))
}

/// Fresh in-memory store and a registry over it. Not bootstrapped.
pub fn memory_registry() -> (Arc<MemoryStore>, Registry) {
    let store = Arc::new(MemoryStore::new());
    let registry = Registry::new(
        store.clone() as Arc<dyn KvStore>,
        TEST_PREFIX,
        Duration::from_secs(1),
        "127.0.0.1:2379",
    );
    (store, registry)
}

/// Like [`memory_registry`], bootstrapped.
pub async fn bootstrapped_registry() -> (Arc<MemoryStore>, Registry) {
    let (store, registry) = memory_registry();
    registry.bootstrap().await.expect("bootstrapping registry");
    (store, registry)
}
