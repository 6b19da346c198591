// src/machine/sampler.rs

//! Point-in-time host statistics.
//!
//! Sampling never fails: whatever cannot be read is reported as zero.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;
use tracing::debug;

use crate::model::{DiskUsage, MachineStat};

pub trait StatSampler: Debug + Send {
    fn sample(&mut self) -> MachineStat;
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Linux sampler backed by procfs and `statvfs(3)`.
#[derive(Debug)]
pub struct ProcfsSampler {
    proc_root: PathBuf,
    mounts: Vec<PathBuf>,
    last_cpu: Option<CpuTimes>,
}

impl ProcfsSampler {
    /// Report disk usage for `/` and every path in `extra_mounts`.
    pub fn new(extra_mounts: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut mounts = vec![PathBuf::from("/")];
        for m in extra_mounts {
            if !mounts.contains(&m) {
                mounts.push(m);
            }
        }
        Self {
            proc_root: PathBuf::from("/proc"),
            mounts,
            last_cpu: None,
        }
    }

    fn read(&self, name: &str) -> String {
        let path = self.proc_root.join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "stat source unavailable");
            String::new()
        })
    }

    fn cpu_usage(&mut self) -> f64 {
        let Some(now) = parse_cpu_times(&self.read("stat")) else {
            return 0.0;
        };
        let usage = match self.last_cpu {
            Some(prev) => cpu_percent(prev, now),
            None => 0.0,
        };
        self.last_cpu = Some(now);
        usage
    }
}

impl StatSampler for ProcfsSampler {
    fn sample(&mut self) -> MachineStat {
        let usage_of_cpu = self.cpu_usage();
        let mem = parse_meminfo(&self.read("meminfo"));
        let load_avg = parse_loadavg(&self.read("loadavg"));
        let usage_of_disk = self.mounts.iter().filter_map(|m| disk_usage(m)).collect();

        MachineStat {
            usage_of_cpu,
            total_mem: mem.total_mem,
            used_mem: mem.used_mem,
            total_swp: mem.total_swp,
            used_swp: mem.used_swp,
            load_avg,
            usage_of_disk,
            clock_offset: 0,
        }
    }
}

pub(crate) fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

pub(crate) fn cpu_percent(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let idle = now.idle.saturating_sub(prev.idle).min(total);
    (total - idle) as f64 * 100.0 / total as f64
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MemInfo {
    pub total_mem: u64,
    pub used_mem: u64,
    pub total_swp: u64,
    pub used_swp: u64,
}

/// Byte counts from `/proc/meminfo`. Used memory excludes what the kernel
/// reports as available.
pub(crate) fn parse_meminfo(raw: &str) -> MemInfo {
    let field = |name: &str| -> u64 {
        raw.lines()
            .find_map(|l| l.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    let total_mem = field("MemTotal");
    let available = match field("MemAvailable") {
        0 => field("MemFree") + field("Buffers") + field("Cached"),
        n => n,
    };
    let total_swp = field("SwapTotal");
    MemInfo {
        total_mem,
        used_mem: total_mem.saturating_sub(available),
        total_swp,
        used_swp: total_swp.saturating_sub(field("SwapFree")),
    }
}

/// The 1, 5 and 15 minute load averages. Zeros when unreadable.
pub(crate) fn parse_loadavg(raw: &str) -> Vec<f64> {
    let parsed: Vec<f64> = raw
        .split_whitespace()
        .take(3)
        .filter_map(|f| f.parse().ok())
        .collect();
    if parsed.len() == 3 {
        parsed
    } else {
        vec![0.0; 3]
    }
}

fn disk_usage(mount: &Path) -> Option<DiskUsage> {
    match statvfs(mount) {
        Ok(st) => {
            let frsize = u64::from(st.fragment_size());
            let blocks = u64::from(st.blocks());
            let free = u64::from(st.blocks_free());
            Some(DiskUsage {
                mount: mount.display().to_string(),
                total_size: blocks * frsize,
                used_size: blocks.saturating_sub(free) * frsize,
            })
        }
        Err(e) => {
            debug!(mount = %mount.display(), error = %e, "statvfs failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_usage_from_two_samples() {
        let a = parse_cpu_times("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        let b = parse_cpu_times("cpu  150 0 150 750 150 0 0 0 0 0\n").unwrap();
        assert_eq!(a, CpuTimes { idle: 800, total: 1000 });
        // 200 jiffies elapsed, 100 of them idle or iowait.
        assert!((cpu_percent(a, b) - 50.0).abs() < f64::EPSILON);
        assert_eq!(cpu_percent(b, b), 0.0);
    }

    #[test]
    fn meminfo_in_bytes() {
        let raw = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    400 kB\n\
                   SwapTotal:       200 kB\nSwapFree:        150 kB\n";
        assert_eq!(
            parse_meminfo(raw),
            MemInfo {
                total_mem: 1000 * 1024,
                used_mem: 600 * 1024,
                total_swp: 200 * 1024,
                used_swp: 50 * 1024,
            }
        );
        assert_eq!(parse_meminfo(""), MemInfo::default());
    }

    #[test]
    fn loadavg_degrades_to_zeros() {
        assert_eq!(parse_loadavg("0.50 0.25 0.10 1/123 4567\n"), vec![0.5, 0.25, 0.1]);
        assert_eq!(parse_loadavg(""), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn missing_procfs_yields_zeroed_snapshot() {
        let mut s = ProcfsSampler::new([]);
        s.proc_root = PathBuf::from("/definitely/not/proc");
        let stat = s.sample();
        assert_eq!(stat.usage_of_cpu, 0.0);
        assert_eq!(stat.total_mem, 0);
        assert_eq!(stat.load_avg, vec![0.0; 3]);
    }
}
