//! Network-on-Chip
//!
//! Built in two phases: a [`NocBuilder`] collects targets and initiators on
//! the routers of a topology, then [`NocBuilder::build`] checks the memory
//! map and reachability, derives routes and, in cycle-accurate mode, starts
//! the router processes. Initiators talk to the NoC through a [`NocPort`].

pub mod connect;
pub mod cycle_accurate;
pub mod memory_map;
pub mod no_contention;
pub mod routing;
pub mod topology;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::interconnect::Transport;
use crate::kernel::Kernel;
use crate::param::{ModuleHandle, ModuleId, ModuleKind, ParamManager};
use crate::payload::{Payload, TlmStatus};
use crate::target::DmiRegion;
use crate::time::SimTime;

pub use cycle_accurate::{CycleAccurate, Fabric, Flit};
pub use memory_map::{MemoryMap, TargetId};
pub use no_contention::NoContentionTiming;
pub use routing::{RoutingAlgorithm, RoutingTable};
pub use topology::{Link, PortId, RouterId, Topology, TopologySpec};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    #[default]
    NoContention,
    CycleAccurate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NocConfig {
    pub topology: TopologySpec,
    pub routing: RoutingAlgorithm,
    pub timing: TimingMode,
    pub link_bytes: u64,
    pub freq_scaling: f64,
    pub clock: SimTime,
    pub fifo_depth: usize,
    /// Where to write the CONNECT dump when the NoC is dropped.
    pub connect_dir: Option<PathBuf>,
}

impl Default for NocConfig {
    fn default() -> Self {
        NocConfig {
            topology: TopologySpec::Bus,
            routing: RoutingAlgorithm::Dijkstra,
            timing: TimingMode::NoContention,
            link_bytes: 8,
            freq_scaling: 1.0,
            clock: SimTime::from_ns(1),
            fifo_depth: 1024,
            connect_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct LatencyStats {
    count: u64,
    total: SimTime,
}

pub struct NocBuilder {
    kernel: Kernel,
    name: String,
    config: NocConfig,
    module: ModuleHandle,
    topo: Topology,
    map: MemoryMap,
    targets: HashMap<TargetId, (AddrSpace, Arc<dyn Transport>)>,
    initiators: Vec<TargetId>,
}

impl NocBuilder {
    pub fn new(kernel: &Kernel, manager: &ParamManager, name: &str, config: NocConfig) -> Result<Self> {
        if config.link_bytes == 0 {
            return Err(VpError::config(format!("{}: link size must be positive", name)));
        }
        if !(config.freq_scaling > 0.0) {
            return Err(VpError::config(format!("{}: frequency scaling must be positive", name)));
        }
        let topo = Topology::from_spec(&config.topology)?;
        let module = manager.register(name, ModuleKind::Intermediate, None)?;
        Ok(NocBuilder {
            kernel: kernel.clone(),
            name: name.to_string(),
            config,
            module,
            topo,
            map: MemoryMap::new(),
            targets: HashMap::new(),
            initiators: Vec::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Hang `target` on a new local port of `router`, serving `space`.
    pub fn attach_target(&mut self, router: RouterId, space: AddrSpace, target: Arc<dyn Transport>) -> Result<TargetId> {
        let port = self.topo.add_local_port(router)?;
        let id = TargetId { router, port };
        let succ_port = self.targets.len();
        self.module.manager().add_successor(self.module.id(), target.module(), succ_port)?;
        self.map.insert(space, id);
        self.targets.insert(id, (space, target));
        tracing::debug!("{}: target {} at {}", self.name, space, id);
        Ok(id)
    }

    /// New initiator endpoint on `router`. Returns the index to pass to
    /// [`Noc::port`].
    pub fn attach_initiator(&mut self, router: RouterId) -> Result<usize> {
        let port = self.topo.add_local_port(router)?;
        self.initiators.push(TargetId { router, port });
        Ok(self.initiators.len() - 1)
    }

    pub fn build(self) -> Result<Arc<Noc>> {
        self.map.check_memory_map()?;
        let routing = Arc::new(RoutingTable::build(&self.topo, self.config.routing)?);
        let srcs: Vec<RouterId> = self.initiators.iter().map(|i| i.router).collect();
        let dsts: Vec<RouterId> = self.targets.keys().map(|t| t.router).collect();
        routing.check_reachability(&srcs, &dsts)?;
        routing.check_reachability(&dsts, &srcs)?;

        let ca = match self.config.timing {
            TimingMode::NoContention => None,
            TimingMode::CycleAccurate => {
                let targets = self.targets.iter().map(|(id, (_, t))| (*id, t.clone())).collect();
                Some(CycleAccurate::start(
                    &self.kernel,
                    &self.topo,
                    routing.clone(),
                    self.config.fifo_depth,
                    self.config.clock,
                    self.config.link_bytes,
                    &targets,
                    &self.initiators,
                )?)
            }
        };
        tracing::info!(
            "{}: {} routers, {} targets, {} initiators, {:?}",
            self.name,
            self.topo.router_count(),
            self.targets.len(),
            self.initiators.len(),
            self.config.timing
        );
        let timing = NoContentionTiming {
            link_bytes: self.config.link_bytes,
            freq_scaling: self.config.freq_scaling,
            clock: self.config.clock,
        };
        let stats = Mutex::new(vec![LatencyStats::default(); self.initiators.len()]);
        Ok(Arc::new(Noc {
            core: Arc::new(NocCore {
                kernel: self.kernel,
                name: self.name,
                config: self.config,
                module: self.module,
                topo: self.topo,
                routing,
                map: self.map,
                targets: self.targets,
                initiators: self.initiators,
                timing,
                ca,
                stats,
            }),
        }))
    }
}

struct NocCore {
    kernel: Kernel,
    name: String,
    config: NocConfig,
    module: ModuleHandle,
    topo: Topology,
    routing: Arc<RoutingTable>,
    map: MemoryMap,
    targets: HashMap<TargetId, (AddrSpace, Arc<dyn Transport>)>,
    initiators: Vec<TargetId>,
    timing: NoContentionTiming,
    ca: Option<Arc<CycleAccurate>>,
    stats: Mutex<Vec<LatencyStats>>,
}

impl NocCore {
    fn record(&self, index: usize, latency: SimTime) {
        let mut stats = self.stats.lock();
        stats[index].count += 1;
        stats[index].total += latency;
    }

    fn recv_ports(&self) -> Vec<TargetId> {
        self.map.entries().iter().map(|(_, t)| *t).collect()
    }

    fn export(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let recv = self.recv_ports();
        let ep = connect::Endpoints { send: &self.initiators, recv: &recv };
        connect::export(dir, &self.name, &self.topo, &self.routing, &ep)
    }
}

pub struct Noc {
    core: Arc<NocCore>,
}

impl Noc {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn module(&self) -> ModuleId {
        self.core.module.id()
    }

    /// Transport endpoint of initiator `index`.
    pub fn port(&self, index: usize) -> Result<Arc<NocPort>> {
        let at = *self
            .core
            .initiators
            .get(index)
            .ok_or_else(|| VpError::invalid(format!("{}: no initiator {}", self.core.name, index)))?;
        Ok(Arc::new(NocPort { core: self.core.clone(), index, at }))
    }

    /// Mean latency seen by initiator `index`, `None` before its first
    /// transaction.
    pub fn avg_latency(&self, index: usize) -> Option<SimTime> {
        let stats = self.core.stats.lock();
        let s = stats.get(index)?;
        if s.count == 0 {
            None
        } else {
            Some(SimTime::from_ps(s.total.as_ps() / s.count))
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.core.routing
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.core.map
    }

    pub fn topology(&self) -> &Topology {
        &self.core.topo
    }

    /// Analytic NoC latency between initiator `index` and the target owning
    /// `addr`, target latency excluded.
    pub fn analytic_latency(&self, index: usize, addr: u64, burst: usize) -> Option<SimTime> {
        let src = self.core.initiators.get(index)?;
        let (dst, _) = self.core.map.target_for(addr)?;
        let hops = self.core.routing.hop_count(src.router, dst.router)?;
        Some(self.core.timing.latency(hops, burst))
    }

    pub fn export_connect(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        self.core.export(dir)
    }
}

impl Drop for Noc {
    fn drop(&mut self) {
        if let Some(dir) = self.core.config.connect_dir.clone() {
            if let Err(e) = self.core.export(&dir) {
                tracing::warn!("{}: CONNECT export failed: {}", self.core.name, e);
            }
        }
    }
}

/// One initiator's view of the NoC.
pub struct NocPort {
    core: Arc<NocCore>,
    index: usize,
    at: TargetId,
}

impl NocPort {
    pub fn endpoint(&self) -> TargetId {
        self.at
    }

    fn resolve(&self, addr: u64) -> Option<(TargetId, &Arc<dyn Transport>)> {
        let (id, _) = self.core.map.target_for(addr)?;
        self.core.targets.get(&id).map(|(_, t)| (id, t))
    }

    fn timed(&self, dst: TargetId, p: &mut Payload, delay: &mut SimTime) -> TlmStatus {
        let core = &self.core;
        let Some(ca) = &core.ca else {
            return TlmStatus::GenericError;
        };
        let start = core.kernel.now();
        let sent = core.kernel.wait(*delay).and_then(|_| ca.transport(self.at, dst, p));
        *delay = SimTime::ZERO;
        match sent {
            Ok(status) => {
                core.record(self.index, core.kernel.now().saturating_sub(start));
                status
            }
            Err(e) => {
                tracing::error!("{}: transaction at 0x{:x} aborted: {}", core.name, p.address, e);
                TlmStatus::GenericError
            }
        }
    }
}

impl Transport for NocPort {
    fn b_transport(&self, p: &mut Payload, delay: &mut SimTime) -> TlmStatus {
        let core = &self.core;
        let Some((dst, target)) = self.resolve(p.address) else {
            tracing::error!("{}: no target at 0x{:x} ({})", core.name, p.address, p);
            return TlmStatus::AddressError;
        };
        if p.is_active && core.ca.is_some() {
            return self.timed(dst, p, delay);
        }

        let before = *delay;
        let status = target.b_transport(p, delay);
        if p.is_active {
            let Some(hops) = core.routing.hop_count(self.at.router, dst.router) else {
                tracing::error!("{}: {} cannot reach {}", core.name, self.at, dst);
                return TlmStatus::GenericError;
            };
            *delay += core.timing.latency(hops, p.len());
            core.record(self.index, delay.saturating_sub(before));
        }
        tracing::trace!("{}: {} via {} -> {:?}", core.name, p, dst, status);
        status
    }

    fn get_direct_mem_ptr(&self, addr: u64) -> Option<DmiRegion> {
        let (id, _) = self.core.map.target_for(addr)?;
        let (space, target) = self.core.targets.get(&id)?;
        target.get_direct_mem_ptr(addr)?.clipped(space)
    }

    fn module(&self) -> ModuleId {
        self.core.module.id()
    }
}
