#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use procfleet::model::{ProcessRunInfo, ProcessStatus};
use procfleet::types::{Endpoint, ProcessState};

/// Builder for `ProcessRunInfo` to simplify test setup.
#[derive(Debug, Clone, Default)]
pub struct RunInfoBuilder {
    info: ProcessRunInfo,
}

impl RunInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `/bin/sh -c <script>`, for a supervisor rooted at `/`.
    pub fn shell(script: &str) -> Self {
        Self::new().command("bin/sh").args(&["-c", script])
    }

    pub fn command(mut self, command: &str) -> Self {
        self.info.command = command.to_string();
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.info.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn executor(mut self, executor: &[&str]) -> Self {
        self.info.executor = executor.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.info.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn host(mut self, ip: &str, name: &str) -> Self {
        self.info.host_ip = ip.to_string();
        self.info.host_name = name.to_string();
        self
    }

    pub fn endpoint(mut self, name: &str, ep: Endpoint) -> Self {
        self.info.endpoints.insert(name.to_string(), ep);
        self
    }

    pub fn build(self) -> ProcessRunInfo {
        self.info
    }
}

/// Builder for `ProcessStatus`, as the reconciler would read it back.
#[derive(Debug, Clone)]
pub struct ProcessStatusBuilder {
    status: ProcessStatus,
}

impl ProcessStatusBuilder {
    pub fn new(proc_id: &str, mach_id: &str, svc_name: &str) -> Self {
        Self {
            status: ProcessStatus {
                proc_id: proc_id.to_string(),
                svc_name: svc_name.to_string(),
                mach_id: mach_id.to_string(),
                desired_state: ProcessState::Started,
                current_state: ProcessState::Stopped,
                is_alive: false,
                run_info: ProcessRunInfo::default(),
            },
        }
    }

    pub fn desired(mut self, state: ProcessState) -> Self {
        self.status.desired_state = state;
        self
    }

    pub fn current(mut self, state: ProcessState) -> Self {
        self.status.current_state = state;
        self
    }

    pub fn alive(mut self, alive: bool) -> Self {
        self.status.is_alive = alive;
        self
    }

    pub fn run_info(mut self, info: ProcessRunInfo) -> Self {
        self.status.run_info = info;
        self
    }

    pub fn endpoints(mut self, eps: BTreeMap<String, Endpoint>) -> Self {
        self.status.run_info.endpoints = eps;
        self
    }

    pub fn build(self) -> ProcessStatus {
        self.status
    }
}

/// Endpoint map from `(name, value)` pairs.
pub fn endpoints(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
