// src/model/machine.rs

use serde::{Deserialize, Serialize};

/// Host metadata stored under `machine/{machID}/object`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    #[serde(rename = "HostName", default)]
    pub host_name: String,
    #[serde(rename = "HostRegion", default)]
    pub host_region: String,
    #[serde(rename = "HostIDC", default)]
    pub host_idc: String,
    #[serde(rename = "PublicIP", default)]
    pub public_ip: String,
}

/// Point-in-time resource snapshot stored under `machine/{machID}/statistic`.
///
/// Memory and disk sizes are bytes, CPU usage is a percentage, and
/// `clock_offset` is milliseconds of sampling delay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStat {
    #[serde(rename = "UsageOfCPU", default)]
    pub usage_of_cpu: f64,
    #[serde(rename = "TotalMem", default)]
    pub total_mem: u64,
    #[serde(rename = "UsedMem", default)]
    pub used_mem: u64,
    #[serde(rename = "TotalSwp", default)]
    pub total_swp: u64,
    #[serde(rename = "UsedSwp", default)]
    pub used_swp: u64,
    #[serde(rename = "LoadAvg", default)]
    pub load_avg: Vec<f64>,
    #[serde(rename = "UsageOfDisk", default)]
    pub usage_of_disk: Vec<DiskUsage>,
    #[serde(rename = "ClockOffset", default)]
    pub clock_offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    #[serde(rename = "Mount", default)]
    pub mount: String,
    #[serde(rename = "TotalSize", default)]
    pub total_size: u64,
    #[serde(rename = "UsedSize", default)]
    pub used_size: u64,
}

/// A machine as read back from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub mach_id: String,
    pub is_alive: bool,
    pub mach_info: MachineInfo,
    pub mach_stat: MachineStat,
}
