#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use procfleet::agent::Agent;
use procfleet::machine::Machine;
use procfleet::model::MachineInfo;
use procfleet::registry::Registry;
use procfleet::service::{ServiceCatalog, ServiceDefaults, ServiceDescriptor};
use procfleet::types::Endpoint;

pub use procfleet_test_utils::builders;
pub use procfleet_test_utils::fake_sampler::FakeSampler;
pub use procfleet_test_utils::fixtures;
pub use procfleet_test_utils::{eventually, init_tracing, with_timeout};

pub const TTL: Duration = Duration::from_secs(10);

pub fn machine_info(ip: &str) -> MachineInfo {
    MachineInfo {
        host_name: format!("host-{ip}"),
        host_region: "region-a".into(),
        host_idc: "idc-1".into(),
        public_ip: ip.into(),
    }
}

/// Register `mach_id` as an alive machine at `ip`.
pub async fn register(reg: &Registry, mach_id: &str, ip: &str) {
    reg.register_machine(mach_id, &machine_info(ip), TTL)
        .await
        .expect("registering machine");
}

/// Service that runs a `/bin/sh` script and advertises one endpoint
/// without an IP.
#[derive(Debug)]
pub struct ShellService {
    pub name: &'static str,
    pub script: &'static str,
}

impl ServiceDescriptor for ShellService {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "0.0.1"
    }

    fn defaults(&self) -> ServiceDefaults {
        ServiceDefaults {
            command: "bin/sh".into(),
            args: vec!["-c".into(), self.script.into()],
            endpoints: self.endpoints_from_args(&[]),
            ..Default::default()
        }
    }

    fn endpoints_from_args(&self, _args: &[String]) -> BTreeMap<String, Endpoint> {
        BTreeMap::from([(
            format!("{}_ADDR", self.name.to_uppercase()),
            Endpoint::new("", "", "7000"),
        )])
    }
}

/// Catalog with the builtins plus a long-running `sleeper` shell service.
pub fn catalog() -> ServiceCatalog {
    let mut catalog = ServiceCatalog::with_builtins();
    catalog.register(Arc::new(ShellService {
        name: "sleeper",
        script: "exec sleep 30",
    }));
    catalog.register(Arc::new(ShellService {
        name: "echoer",
        script: "echo ${ETCD_ADDR} ${SLEEPER_ADDR}; exec sleep 30",
    }));
    catalog
}

/// Agent for machine `mach_id` over `registry`, supervising under `data_dir`.
pub fn agent(registry: Registry, mach_id: &str, ip: &str, data_dir: &Path) -> Arc<Agent> {
    Arc::new(Agent::new(
        registry,
        Arc::new(fixtures::process_manager(data_dir)),
        Arc::new(Machine::new(mach_id, machine_info(ip))),
        catalog(),
        10,
        TTL,
    ))
}
