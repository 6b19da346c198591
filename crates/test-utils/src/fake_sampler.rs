use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use procfleet::machine::StatSampler;
use procfleet::minion::SamplerFactory;
use procfleet::model::MachineStat;

/// Sampler that returns a fixed snapshot and counts how often it was asked.
#[derive(Debug, Clone)]
pub struct FakeSampler {
    stat: MachineStat,
    calls: Arc<AtomicUsize>,
}

impl FakeSampler {
    pub fn new(stat: MachineStat) -> Self {
        Self {
            stat,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A plausible small host.
    pub fn typical() -> Self {
        Self::new(MachineStat {
            usage_of_cpu: 12.5,
            total_mem: 8 << 30,
            used_mem: 2 << 30,
            load_avg: vec![0.5, 0.4, 0.3],
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Factory handing out clones that share the call counter.
    pub fn factory(&self) -> SamplerFactory {
        let template = self.clone();
        Arc::new(move || Box::new(template.clone()) as Box<dyn StatSampler>)
    }
}

impl StatSampler for FakeSampler {
    fn sample(&mut self) -> MachineStat {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.stat.clone()
    }
}
