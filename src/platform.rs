//! Platform orchestrator
//!
//! Builds a complete virtual platform from a [`PlatformConfig`]: targets,
//! interconnect, interrupt controller, CPUs and generators, then the
//! parameters and dated changes. Also takes and restores snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::AddrSpace;
use crate::config::{InterconnectConfig, PlatformConfig};
use crate::devices::{GeneratorConfig, Memory, Peripheral, TrafficGenerator};
use crate::error::{Result, VpError};
use crate::gic::Gic;
use crate::interconnect::noc::{Noc, NocBuilder, RouterId};
use crate::interconnect::{AtomicMonitor, Bus, ExclusiveGate, Transport};
use crate::irq::{InterruptIf, IrqLine};
use crate::iss::{CpuConfig, IssFinder, IssWrapper, NativeBackend};
use crate::kernel::Kernel;
use crate::param::{Appointment, ParamManager, ParamScheduler};
use crate::payload::InitiatorId;
use crate::snapshot::PlatformSnapshot;
use crate::target::{TargetIf, TargetSocket};
use crate::time::SimTime;

/// Backend interrupt line carrying the GIC's IRQ output.
pub const IRQ_LINE: u32 = 0;
/// Backend interrupt line carrying the GIC's virtual IRQ output.
pub const VIRQ_LINE: u32 = 1;

/// Initiator ids of generators start after the CPUs'.
const GENERATOR_ID_BASE: InitiatorId = 0x100;

pub struct MemorySlot {
    pub name: String,
    pub memory: Arc<Mutex<Memory>>,
    pub socket: Arc<TargetSocket<Memory>>,
}

pub enum Interconnect {
    Bus(Arc<Bus>),
    Noc(Arc<Noc>),
}

/// A named target ready to be hung on the interconnect.
struct Mapped {
    name: String,
    space: AddrSpace,
    transport: Arc<dyn Transport>,
}

pub struct Platform {
    kernel: Kernel,
    manager: ParamManager,
    scheduler: ParamScheduler,
    monitor: Arc<AtomicMonitor>,
    memories: Vec<MemorySlot>,
    peripherals: BTreeMap<String, Arc<Mutex<Peripheral>>>,
    gic: Option<Arc<Gic>>,
    cpus: Vec<Arc<IssWrapper>>,
    generators: Vec<TrafficGenerator>,
    interconnect: Interconnect,
    started: bool,
}

impl Platform {
    pub fn from_config(cfg: &PlatformConfig) -> Result<Self> {
        cfg.validate()?;
        let kernel = Kernel::new();
        let manager = ParamManager::new();
        let mut mapped: Vec<Mapped> = Vec::new();

        let gic = match &cfg.gic {
            Some(gcfg) => {
                let gic = Gic::new("gic", gcfg.num_cpus, gcfg.num_irqs)?;
                for w in gic.sockets(&manager, gcfg)? {
                    mapped.push(Mapped { name: gic.name().to_string(), space: w.space(), transport: w });
                }
                Some(gic)
            }
            None => None,
        };

        let mut memories = Vec::with_capacity(cfg.memories.len());
        for mcfg in &cfg.memories {
            let memory = Arc::new(Mutex::new(Memory::from_config(mcfg)?));
            let socket = Arc::new(TargetSocket::new(&manager, mcfg.target_if(), memory.clone())?);
            mapped.push(Mapped { name: mcfg.name.clone(), space: socket.space(), transport: socket.clone() });
            memories.push(MemorySlot { name: mcfg.name.clone(), memory, socket });
        }

        let mut peripherals = BTreeMap::new();
        for pcfg in &cfg.peripherals {
            let mut dev = Peripheral::new(&pcfg.name, pcfg.size);
            if let (Some(id), Some(gic)) = (pcfg.irq, &gic) {
                let sink: Arc<dyn InterruptIf> = gic.clone();
                dev = dev.with_irq(IrqLine::new(sink, id));
            }
            let dev = Arc::new(Mutex::new(dev));
            let tif = TargetIf { base: pcfg.base, size: pcfg.size, latency: pcfg.latency };
            let socket = Arc::new(TargetSocket::new(&manager, tif, dev.clone())?);
            mapped.push(Mapped { name: pcfg.name.clone(), space: socket.space(), transport: socket });
            peripherals.insert(pcfg.name.clone(), dev);
        }

        let initiators: Vec<&str> = cfg
            .cpus
            .iter()
            .map(|c| c.name.as_str())
            .chain(cfg.generators.iter().map(|g| g.name.as_str()))
            .collect();
        let (interconnect, mut ports) = build_interconnect(&kernel, &manager, cfg, &mapped, &initiators)?;

        let monitor = Arc::new(AtomicMonitor::new(cfg.exclusive.line_bytes));
        let mut cpus = Vec::with_capacity(cfg.cpus.len());
        for (i, entry) in cfg.cpus.iter().enumerate() {
            let port = ports.remove(0);
            let gate = Arc::new(ExclusiveGate::new(&kernel, port, monitor.clone(), cfg.exclusive));
            let ccfg = CpuConfig {
                name: entry.name.clone(),
                cpu_id: i as u32,
                quantum: cfg.quantum,
                cpu_period: entry.cpu_period,
                timer_period: entry.timer_period,
                instr_quantum: entry.instr_quantum,
                stop_on_any_core: cfg.stop_on_any_core,
            };
            let cpu = IssWrapper::new(&kernel, &manager, ccfg, gate, Some(monitor.clone()))?;
            if let Some(gic) = &gic {
                let sink: Arc<dyn InterruptIf> = cpu.clone();
                gic.connect_cpu(i, IrqLine::new(sink.clone(), IRQ_LINE), Some(IrqLine::new(sink, VIRQ_LINE)))?;
            }
            if let Some(spec) = &entry.backend {
                let lib = IssFinder::new(&spec.search).find(&spec.prefix, &spec.arch, &spec.suffix)?;
                let backend = NativeBackend::open(&lib, &cpu, &spec.model, spec.gdb, spec.init_pc)?;
                cpu.attach(Arc::new(backend))?;
                for name in &entry.premap {
                    let slot = memories
                        .iter()
                        .find(|m| &m.name == name)
                        .ok_or_else(|| VpError::config(format!("{}: no memory '{}' to premap", entry.name, name)))?;
                    cpu.advertise_dmi(name, &slot.socket.space())?;
                }
                if let Some(elf) = &entry.elf {
                    cpu.load_elf(elf)?;
                }
            }
            cpus.push(cpu);
        }

        let mut generators = Vec::with_capacity(cfg.generators.len());
        for (i, entry) in cfg.generators.iter().enumerate() {
            let port = ports.remove(0);
            let targets = if entry.targets.is_empty() {
                memories.iter().map(|m| m.socket.space()).collect()
            } else {
                entry
                    .targets
                    .iter()
                    .map(|t| {
                        mapped
                            .iter()
                            .find(|m| &m.name == t)
                            .map(|m| m.space)
                            .ok_or_else(|| VpError::config(format!("{}: unknown target '{}'", entry.name, t)))
                    })
                    .collect::<Result<Vec<_>>>()?
            };
            let gcfg = GeneratorConfig {
                name: entry.name.clone(),
                initiator: GENERATOR_ID_BASE + i as InitiatorId,
                requests: entry.requests,
                access_bytes: entry.access_bytes,
                gap: entry.gap,
                seed: entry.seed,
            };
            generators.push(TrafficGenerator::new(&kernel, &manager, gcfg, port, targets)?);
        }

        for p in &cfg.parameters {
            manager.set_parameter_by_name(&p.module, p.space()?, p.value)?;
        }
        let scheduler = ParamScheduler::new(&kernel, &manager)?;
        for a in &cfg.appointments {
            let module = manager
                .find(&a.module)
                .ok_or_else(|| VpError::config(format!("appointment for unknown module '{}'", a.module)))?;
            scheduler.schedule(Appointment { module, space: a.space()?, date: a.date, parameter: a.value })?;
        }

        tracing::info!(
            "platform ready: {} CPUs, {} memories, {} peripherals, {} generators",
            cpus.len(),
            memories.len(),
            peripherals.len(),
            generators.len()
        );
        Ok(Platform {
            kernel,
            manager,
            scheduler,
            monitor,
            memories,
            peripherals,
            gic,
            cpus,
            generators,
            interconnect,
            started: false,
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn manager(&self) -> &ParamManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &ParamScheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Arc<AtomicMonitor> {
        &self.monitor
    }

    pub fn cpus(&self) -> &[Arc<IssWrapper>] {
        &self.cpus
    }

    pub fn cpu(&self, name: &str) -> Option<&Arc<IssWrapper>> {
        self.cpus.iter().find(|c| c.name() == name)
    }

    pub fn gic(&self) -> Option<&Arc<Gic>> {
        self.gic.as_ref()
    }

    pub fn memory(&self, name: &str) -> Option<&MemorySlot> {
        self.memories.iter().find(|m| m.name == name)
    }

    pub fn peripheral(&self, name: &str) -> Option<&Arc<Mutex<Peripheral>>> {
        self.peripherals.get(name)
    }

    pub fn generators(&self) -> &[TrafficGenerator] {
        &self.generators
    }

    pub fn interconnect(&self) -> &Interconnect {
        &self.interconnect
    }

    pub fn noc(&self) -> Option<&Arc<Noc>> {
        match &self.interconnect {
            Interconnect::Noc(n) => Some(n),
            Interconnect::Bus(_) => None,
        }
    }

    /// Spawn the CPU and generator processes. CPUs without a backend stay
    /// idle.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(VpError::invalid("platform already started"));
        }
        for cpu in &self.cpus {
            if cpu.backend().is_ok() {
                cpu.start()?;
            } else {
                tracing::warn!("{} has no backend and stays idle", cpu.name());
            }
        }
        for g in &self.generators {
            g.start()?;
        }
        self.started = true;
        Ok(())
    }

    /// Advance the simulation by `dt`, starting it first if needed.
    pub fn run_for(&mut self, dt: SimTime) -> Result<SimTime> {
        if !self.started {
            self.start()?;
        }
        self.kernel.run_for(dt)
    }

    /// Run until every process is done or a CPU requests a stop.
    pub fn run(&mut self) -> Result<SimTime> {
        if !self.started {
            self.start()?;
        }
        self.kernel.run()
    }

    /// Capture dirty memory pages, GIC state and the current time. Only
    /// meaningful between runs.
    pub fn snapshot(&self) -> PlatformSnapshot {
        let mut snap = PlatformSnapshot::new(self.kernel.now());
        for m in &self.memories {
            let pages = m.memory.lock().dirty_pages();
            if !pages.is_empty() {
                snap.memories.insert(m.name.clone(), pages);
            }
        }
        snap.gic = self.gic.as_ref().map(|g| g.snapshot());
        tracing::info!("snapshot taken at {}", snap.time);
        snap
    }

    /// Load a snapshot into a freshly built platform, before it runs.
    pub fn restore(&mut self, snap: &PlatformSnapshot) -> Result<()> {
        if self.started {
            return Err(VpError::Snapshot("restore after start".into()));
        }
        for (name, pages) in &snap.memories {
            let slot = self
                .memory(name)
                .ok_or_else(|| VpError::Snapshot(format!("no memory '{}' in this platform", name)))?;
            slot.memory.lock().restore_pages(pages)?;
        }
        match (&self.gic, &snap.gic) {
            (Some(gic), Some(state)) => gic.restore(state.clone())?,
            (None, Some(_)) => return Err(VpError::Snapshot("snapshot carries GIC state but there is no GIC".into())),
            _ => {}
        }
        if !snap.time.is_zero() {
            self.kernel.warp_to(snap.time)?;
        }
        tracing::info!("restored snapshot taken at {}", snap.time);
        Ok(())
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.kernel.shutdown();
    }
}

/// Hang every target on the configured interconnect and hand back one
/// initiator port per entry of `initiators`, in order.
fn build_interconnect(
    kernel: &Kernel,
    manager: &ParamManager,
    cfg: &PlatformConfig,
    mapped: &[Mapped],
    initiators: &[&str],
) -> Result<(Interconnect, Vec<Arc<dyn Transport>>)> {
    match &cfg.interconnect {
        InterconnectConfig::Bus { latency } => {
            let mut bus = Bus::new(manager, "bus", *latency)?;
            for m in mapped {
                bus.map(m.space, m.transport.clone())?;
            }
            let bus = Arc::new(bus);
            let ports = initiators.iter().map(|_| bus.clone() as Arc<dyn Transport>).collect();
            Ok((Interconnect::Bus(bus), ports))
        }
        InterconnectConfig::Noc { noc, placement } => {
            let router = |name: &str| -> Result<RouterId> {
                placement
                    .get(name)
                    .copied()
                    .ok_or_else(|| VpError::config(format!("no router given for '{}'", name)))
            };
            let mut builder = NocBuilder::new(kernel, manager, "noc", noc.clone())?;
            for m in mapped {
                builder.attach_target(router(&m.name)?, m.space, m.transport.clone())?;
            }
            let mut indices = Vec::with_capacity(initiators.len());
            for name in initiators {
                indices.push(builder.attach_initiator(router(name)?)?);
            }
            let noc = builder.build()?;
            let mut ports = Vec::with_capacity(indices.len());
            for i in indices {
                ports.push(noc.port(i)? as Arc<dyn Transport>);
            }
            Ok((Interconnect::Noc(noc), ports))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iss::abi::{RW_OK, RW_READ, RW_WRITE};
    use crate::iss::ClosureBackend;

    const BUS_SOC: &str = r#"
[[cpus]]
name = "cpu0"

[[memories]]
name = "ram"
base = 0x1000
size = 0x4000
latency = { read_cycles = 0, write_cycles = 0 }

[gic]
num_cpus = 1
"#;

    #[test]
    fn test_bus_platform_runs_a_program() {
        let cfg: PlatformConfig = BUS_SOC.parse().unwrap();
        let mut vp = Platform::from_config(&cfg).unwrap();
        let seen = Arc::new(Mutex::new(0u64));
        let s2 = seen.clone();
        let prog = ClosureBackend::new(move |cpu, _| {
            let mut v = 0x55u64;
            assert_eq!(cpu.rwsync(0x2000, RW_WRITE, 0, 8, &mut v), RW_OK);
            let mut r = 0u64;
            assert_eq!(cpu.rwsync(0x2000, RW_READ, 0, 8, &mut r), RW_OK);
            *s2.lock() = r;
            Ok(())
        });
        vp.cpus()[0].attach(prog).unwrap();
        vp.run().unwrap();
        assert_eq!(*seen.lock(), 0x55);
        assert_eq!(vp.memory("ram").unwrap().memory.lock().bytes(0x1000, 1), Some(&[0x55u8][..]));
        assert!(vp.start().is_err());
    }

    #[test]
    fn test_snapshot_restores_into_fresh_platform() {
        let cfg: PlatformConfig = BUS_SOC.parse().unwrap();
        let snap = {
            let mut vp = Platform::from_config(&cfg).unwrap();
            let prog = ClosureBackend::new(|cpu, _| {
                let mut v = 0xdead_beefu64;
                cpu.rwsync(0x3008, RW_WRITE, 0, 4, &mut v);
                cpu.fsync(0, 20_000, 1000, false);
                Ok(())
            });
            vp.cpus()[0].attach(prog).unwrap();
            vp.run_for(SimTime::from_us(50)).unwrap();
            vp.snapshot()
        };
        assert_eq!(snap.time, SimTime::from_us(50));
        assert!(snap.gic.is_some());

        let mut vp = Platform::from_config(&cfg).unwrap();
        vp.restore(&snap).unwrap();
        assert_eq!(vp.kernel().now(), SimTime::from_us(50));
        let ram = vp.memory("ram").unwrap().memory.lock();
        assert_eq!(ram.bytes(0x2008, 4), Some(&0xdead_beefu32.to_le_bytes()[..]));
    }

    #[test]
    fn test_noc_needs_placement() {
        let text = r#"
[[memories]]
name = "ram"

[interconnect]
kind = "noc"
placement = { }

[interconnect.noc]
topology = { kind = "ring", n = 4, bidirectional = true }
"#;
        let cfg: PlatformConfig = text.parse().unwrap();
        assert!(matches!(Platform::from_config(&cfg), Err(VpError::Configuration(_))));
    }
}
