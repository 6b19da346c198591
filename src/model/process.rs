// src/model/process.rs

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::{Endpoint, ProcessState};

/// Everything needed to launch one logical process, stored as JSON under
/// `process/{key}/object`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRunInfo {
    #[serde(rename = "HostIP", default)]
    pub host_ip: String,
    #[serde(rename = "HostName", default)]
    pub host_name: String,
    #[serde(rename = "HostRegion", default)]
    pub host_region: String,
    #[serde(rename = "HostIDC", default)]
    pub host_idc: String,
    /// Optional launcher prefix, e.g. `["nice", "-n", "10"]`.
    #[serde(rename = "Executor", default)]
    pub executor: Vec<String>,
    #[serde(rename = "Command", default)]
    pub command: String,
    #[serde(rename = "Args", default)]
    pub args: Vec<String>,
    #[serde(rename = "Environment", default)]
    pub environment: HashMap<String, String>,
    #[serde(rename = "Endpoints", default)]
    pub endpoints: BTreeMap<String, Endpoint>,
}

/// A placement decision read back from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub proc_id: String,
    pub svc_name: String,
    pub mach_id: String,
    pub desired_state: ProcessState,
    pub current_state: ProcessState,
    pub is_alive: bool,
    pub run_info: ProcessRunInfo,
}

impl ProcessStatus {
    /// Registry key segment: `{procID}-{machID}-{svcName}`.
    pub fn key(&self) -> String {
        process_key(&self.proc_id, &self.mach_id, &self.svc_name)
    }
}

pub(crate) fn process_key(proc_id: &str, mach_id: &str, svc_name: &str) -> String {
    format!("{proc_id}-{mach_id}-{svc_name}")
}
