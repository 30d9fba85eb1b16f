//! Uniform-random traffic generator
//!
//! An initiator process that issues reads to randomly chosen targets and
//! records the latency of each one: the annotated delay plus the time the
//! call spent suspended.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::interconnect::Transport;
use crate::kernel::{Kernel, ProcessId};
use crate::param::{ModuleHandle, ModuleKind, ParamManager};
use crate::payload::{InitiatorId, Payload};
use crate::time::SimTime;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub name: String,
    pub initiator: InitiatorId,
    pub requests: u64,
    pub access_bytes: usize,
    /// Idle time between the end of one request and the next.
    pub gap: SimTime,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            name: "gen0".into(),
            initiator: 0,
            requests: 1000,
            access_bytes: 8,
            gap: SimTime::from_ns(10),
            seed: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub completed: u64,
    pub errors: u64,
    pub total_latency: SimTime,
}

pub struct TrafficGenerator {
    config: GeneratorConfig,
    kernel: Kernel,
    port: Arc<dyn Transport>,
    targets: Vec<AddrSpace>,
    stats: Arc<Mutex<GeneratorStats>>,
    _module: ModuleHandle,
}

impl TrafficGenerator {
    /// `targets` are the windows to pick from, each with equal probability.
    pub fn new(
        kernel: &Kernel,
        manager: &ParamManager,
        config: GeneratorConfig,
        port: Arc<dyn Transport>,
        targets: Vec<AddrSpace>,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(VpError::config(format!("{}: no target to send to", config.name)));
        }
        if config.access_bytes == 0 {
            return Err(VpError::config(format!("{}: access size must be non-zero", config.name)));
        }
        let module = manager.register(&config.name, ModuleKind::Dummy, None)?;
        manager.add_successor(module.id(), port.module(), 0)?;
        Ok(TrafficGenerator {
            config,
            kernel: kernel.clone(),
            port,
            targets,
            stats: Arc::new(Mutex::new(GeneratorStats::default())),
            _module: module,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> GeneratorStats {
        *self.stats.lock()
    }

    /// Mean latency of the completed requests.
    pub fn avg_latency(&self) -> Option<SimTime> {
        let s = self.stats.lock();
        (s.completed > 0).then(|| SimTime::from_ps(s.total_latency.as_ps() / s.completed))
    }

    /// Spawn the request loop.
    pub fn start(&self) -> Result<ProcessId> {
        let cfg = self.config.clone();
        let kernel = self.kernel.clone();
        let port = Arc::clone(&self.port);
        let targets = self.targets.clone();
        let stats = Arc::clone(&self.stats);
        self.kernel.spawn(&self.config.name, move || {
            let mut rng = StdRng::seed_from_u64(cfg.seed);
            for _ in 0..cfg.requests {
                let space = targets[rng.gen_range(0..targets.len())];
                let addr = pick_address(&mut rng, &space, cfg.access_bytes);
                let mut p = Payload::read(addr, cfg.access_bytes, cfg.initiator);
                let mut delay = SimTime::ZERO;
                let start = kernel.now();
                let status = port.b_transport(&mut p, &mut delay);
                let latency = kernel.now().saturating_sub(start) + delay;
                {
                    let mut s = stats.lock();
                    if status.is_ok() {
                        s.completed += 1;
                        s.total_latency += latency;
                    } else {
                        s.errors += 1;
                    }
                }
                tracing::trace!("{}: {} -> {:?} in {}", cfg.name, p, status, latency);
                kernel.wait(delay + cfg.gap)?;
            }
            tracing::info!("{}: {} requests done at {}", cfg.name, cfg.requests, kernel.now());
            Ok(())
        })
    }
}

/// Address of a `len`-byte access inside `space`, aligned to `len`.
fn pick_address(rng: &mut StdRng, space: &AddrSpace, len: usize) -> u64 {
    let len = len as u64;
    let span = space.end() - space.base();
    if span < len - 1 {
        return space.base();
    }
    let slots = (span - (len - 1)) / len + 1;
    space.base() + rng.gen_range(0..slots) * len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::Regs;
    use crate::target::{LatencyModel, TargetIf, TargetSocket};

    #[test]
    fn test_addresses_stay_in_window_and_aligned() {
        let mut rng = StdRng::seed_from_u64(7);
        let space = AddrSpace::from_size(0x1000, 0x100).unwrap();
        for _ in 0..1000 {
            let a = pick_address(&mut rng, &space, 8);
            assert!(space.contains_space(&AddrSpace::from_size(a, 8).unwrap()));
            assert_eq!(a % 8, 0);
        }
    }

    #[test]
    fn test_generator_measures_latency() {
        let k = Kernel::new();
        let pm = ParamManager::new();
        let regs = Arc::new(Mutex::new(Regs { name: "regs".into(), words: vec![0; 64] }));
        let lat = LatencyModel { read_cycles: 3, cycle_duration: SimTime::from_ns(2), ..LatencyModel::default() };
        let tif = TargetIf { base: 0x0, size: 256, latency: lat };
        let t = Arc::new(TargetSocket::new(&pm, tif, regs).unwrap());
        let cfg = GeneratorConfig { requests: 50, access_bytes: 4, ..GeneratorConfig::default() };
        let g = TrafficGenerator::new(&k, &pm, cfg, t.clone(), vec![t.space()]).unwrap();
        g.start().unwrap();
        let end = k.run().unwrap();

        let s = g.stats();
        assert_eq!((s.completed, s.errors), (50, 0));
        assert_eq!(g.avg_latency(), Some(SimTime::from_ns(6)));
        assert_eq!(end, SimTime::from_ns(50 * 16));
        k.shutdown();
    }
}
