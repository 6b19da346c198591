// src/machine/mod.rs

//! The local machine: identity, host metadata and the latest statistics
//! snapshot, plus the monitor worker that keeps the snapshot fresh.

mod host;
mod id;
mod sampler;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::errors::Result;
use crate::model::{MachineInfo, MachineStat, MachineStatus};

pub use host::{detect_host_ip, intranet_ips};
pub use id::{SHORT_ID_LEN, generate as generate_machine_id, machine_id_path};
pub use sampler::{ProcfsSampler, StatSampler};

#[derive(Debug)]
pub struct Machine {
    id: String,
    info: MachineInfo,
    stat: RwLock<MachineStat>,
}

impl Machine {
    pub fn new(id: impl Into<String>, info: MachineInfo) -> Self {
        Self {
            id: id.into(),
            info,
            stat: RwLock::new(MachineStat {
                load_avg: vec![0.0; 3],
                ..Default::default()
            }),
        }
    }

    /// Load (or create) the persisted ID under `data_dir` and resolve host
    /// metadata. A configured IP wins over detection; the host name falls
    /// back to the IP.
    pub async fn load(data_dir: &Path, host: &HostConfig) -> Result<Self> {
        let id = id::load_or_create(data_dir).await?;

        let public_ip = match host.ip.as_deref().filter(|ip| !ip.is_empty()) {
            Some(ip) => ip.to_string(),
            None => detect_host_ip(),
        };
        let host_name = match host.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => public_ip.clone(),
        };

        let info = MachineInfo {
            host_name,
            host_region: host.region.clone(),
            host_idc: host.idc.clone(),
            public_ip,
        };
        info!(mach_id = %id, host = %info.host_name, ip = %info.public_ip, "local machine loaded");
        Ok(Self::new(id, info))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        id::short_id(&self.id)
    }

    /// True for the full ID or any non-empty prefix of it.
    pub fn matches_id(&self, candidate: &str) -> bool {
        id::matches_id(&self.id, candidate)
    }

    pub fn info(&self) -> &MachineInfo {
        &self.info
    }

    pub fn stat(&self) -> MachineStat {
        self.stat.read().clone()
    }

    pub fn set_stat(&self, stat: MachineStat) {
        *self.stat.write() = stat;
    }

    /// Local view; a running minion considers itself alive.
    pub fn status(&self) -> MachineStatus {
        MachineStatus {
            mach_id: self.id.clone(),
            is_alive: true,
            mach_info: self.info.clone(),
            mach_stat: self.stat(),
        }
    }
}

/// Sample every `interval` until `shutdown` fires.
///
/// `clock_offset` records how late each tick ran, in milliseconds, which
/// hints at an overloaded host.
pub async fn monitor(
    machine: Arc<Machine>,
    mut sampler: Box<dyn StatSampler>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    debug!(mach_id = %machine.short_id(), ?interval, "machine monitor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last);
        last = now;

        // procfs reads and statvfs block; keep them off the runtime.
        let sampled = tokio::task::spawn_blocking(move || {
            let stat = sampler.sample();
            (sampler, stat)
        })
        .await;
        let mut stat = match sampled {
            Ok((returned, stat)) => {
                sampler = returned;
                stat
            }
            Err(e) => {
                warn!(mach_id = %machine.short_id(), error = %e, "stat sampler failed; monitor stopped");
                return;
            }
        };
        stat.clock_offset = clock_offset_ms(elapsed, interval);
        machine.set_stat(stat);
    }

    debug!(mach_id = %machine.short_id(), "machine monitor stopped");
}

fn clock_offset_ms(elapsed: Duration, interval: Duration) -> i64 {
    let elapsed = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
    let interval = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    elapsed.saturating_sub(interval).max(0)
}
