// src/model/mod.rs

//! Registry-resident domain objects.
//!
//! Field names on the wire are PascalCase (`HostIP`, `UsageOfCPU`, ...) so
//! the JSON stored under `object` and `statistic` keys stays readable by
//! other tools that share the registry.

mod machine;
mod process;

pub use machine::{DiskUsage, MachineInfo, MachineStat, MachineStatus};
pub use process::{ProcessRunInfo, ProcessStatus};
pub(crate) use process::process_key;
