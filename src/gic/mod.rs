//! GICv2-style interrupt controller
//!
//! One shared state behind four memory-mapped windows: distributor, CPU
//! interface, virtual interface control and virtual CPU interface. The CPU
//! interface windows are banked by the initiator id of each access. After
//! every register write and every input line change the output wires are
//! re-evaluated ([`Gic::comb_logic`]) and the ones that changed are driven.

pub mod cpu_if;
pub mod distributor;
pub mod virt;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VpError};
use crate::irq::{InterruptIf, IrqLine};
use crate::param::ParamManager;
use crate::payload::{Payload, TlmStatus};
use crate::target::{LatencyModel, Target, TargetIf, TargetSocket};
use crate::time::SimTime;

pub use cpu_if::CpuInterface;
pub use distributor::{Distributor, IrqState, MAX_IRQS, PRIVATE_COUNT, SGI_COUNT, SPURIOUS};
pub use virt::{VirtualInterface, MAINTENANCE_PPI};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GicConfig {
    pub num_cpus: usize,
    pub num_irqs: u32,
    pub dist_base: u64,
    pub cpu_base: u64,
    pub vctrl_base: u64,
    pub vcpu_base: u64,
}

impl Default for GicConfig {
    fn default() -> Self {
        GicConfig {
            num_cpus: 1,
            num_irqs: 128,
            dist_base: 0x2c00_1000,
            cpu_base: 0x2c00_2000,
            vctrl_base: 0x2c00_4000,
            vcpu_base: 0x2c00_6000,
        }
    }
}

/// Complete controller state, as captured in snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GicState {
    pub dist: Distributor,
    pub cpus: Vec<CpuInterface>,
    pub virt: Vec<VirtualInterface>,
}

impl GicState {
    pub fn new(num_cpus: usize, num_irqs: u32) -> Self {
        GicState {
            dist: Distributor::new(num_cpus, num_irqs),
            cpus: vec![CpuInterface::default(); num_cpus],
            virt: vec![VirtualInterface::default(); num_cpus],
        }
    }

    /// IRQ and VIRQ levels per CPU. Updates the maintenance PPIs first.
    pub fn comb_logic(&mut self) -> Vec<(bool, bool)> {
        let GicState { dist, cpus, virt } = self;
        let mut wires = Vec::with_capacity(cpus.len());
        for (cpu, (c, v)) in cpus.iter().zip(virt.iter()).enumerate() {
            dist.set_line(cpu, MAINTENANCE_PPI, v.maintenance());
            wires.push((c.signalled(cpu, dist).is_some(), v.virq()));
        }
        wires
    }
}

#[derive(Default)]
struct Outputs {
    irq: Option<IrqLine>,
    virq: Option<IrqLine>,
    level: (bool, bool),
}

pub struct Gic {
    name: String,
    state: Mutex<GicState>,
    outputs: Mutex<Vec<Outputs>>,
}

impl Gic {
    pub fn new(name: &str, num_cpus: usize, num_irqs: u32) -> Result<Arc<Self>> {
        if num_cpus == 0 || num_cpus > 8 {
            return Err(VpError::config(format!("{}: {} CPUs (1 to 8 supported)", name, num_cpus)));
        }
        Ok(Arc::new(Gic {
            name: name.to_string(),
            state: Mutex::new(GicState::new(num_cpus, num_irqs)),
            outputs: Mutex::new((0..num_cpus).map(|_| Outputs::default()).collect()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_cpus(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Bind the output wires of `cpu`.
    pub fn connect_cpu(&self, cpu: usize, irq: IrqLine, virq: Option<IrqLine>) -> Result<()> {
        let mut outs = self.outputs.lock();
        let o = outs
            .get_mut(cpu)
            .ok_or_else(|| VpError::invalid(format!("{}: no CPU {}", self.name, cpu)))?;
        o.irq = Some(irq);
        o.virq = virq;
        Ok(())
    }

    /// Run `f` on the state, then re-evaluate and drive the wires.
    pub fn update<R>(&self, f: impl FnOnce(&mut GicState) -> R) -> R {
        let (r, wires) = {
            let mut st = self.state.lock();
            let r = f(&mut st);
            (r, st.comb_logic())
        };
        self.drive(&wires);
        r
    }

    pub fn comb_logic(&self) {
        self.update(|_| ());
    }

    fn drive(&self, wires: &[(bool, bool)]) {
        let mut changed = Vec::new();
        {
            let mut outs = self.outputs.lock();
            for (cpu, (o, w)) in outs.iter_mut().zip(wires).enumerate() {
                if o.level.0 != w.0 {
                    if let Some(l) = &o.irq {
                        changed.push((cpu, l.clone(), w.0));
                    }
                }
                if o.level.1 != w.1 {
                    if let Some(l) = &o.virq {
                        changed.push((cpu, l.clone(), w.1));
                    }
                }
                o.level = *w;
            }
        }
        for (cpu, line, level) in changed {
            tracing::debug!("{}: cpu {} line {} -> {}", self.name, cpu, line.line(), level);
            line.set(level);
        }
    }

    /// Drive shared interrupt `id`.
    pub fn set_spi(&self, id: u32, level: bool) {
        if id >= MAX_IRQS || id < PRIVATE_COUNT {
            tracing::warn!("{}: SPI input {} ignored", self.name, id);
            return;
        }
        self.update(|st| st.dist.set_line(0, id, level));
    }

    /// Drive private peripheral interrupt `id` of `cpu`.
    pub fn set_ppi(&self, cpu: usize, id: u32, level: bool) {
        if !(SGI_COUNT..PRIVATE_COUNT).contains(&id) {
            tracing::warn!("{}: PPI input {} ignored", self.name, id);
            return;
        }
        self.update(|st| st.dist.set_line(cpu, id, level));
    }

    /// Interrupt sink for PPI inputs of one CPU.
    pub fn ppi_input(self: &Arc<Self>, cpu: usize) -> Arc<PpiInput> {
        Arc::new(PpiInput { gic: self.clone(), cpu })
    }

    pub fn snapshot(&self) -> GicState {
        self.state.lock().clone()
    }

    pub fn restore(&self, state: GicState) -> Result<()> {
        if state.cpus.len() != self.num_cpus() {
            return Err(VpError::Snapshot(format!(
                "{}: snapshot has {} CPUs, controller {}",
                self.name,
                state.cpus.len(),
                self.num_cpus()
            )));
        }
        self.update(|st| *st = state);
        Ok(())
    }

    /// Register the four windows as targets.
    pub fn sockets(self: &Arc<Self>, manager: &ParamManager, cfg: &GicConfig) -> Result<Vec<Arc<TargetSocket<GicWindow>>>> {
        let windows = [
            (WindowKind::Distributor, cfg.dist_base, 0x1000),
            (WindowKind::CpuInterface, cfg.cpu_base, 0x2000),
            (WindowKind::VirtualControl, cfg.vctrl_base, 0x1000),
            (WindowKind::VirtualCpu, cfg.vcpu_base, 0x2000),
        ];
        let mut out = Vec::with_capacity(windows.len());
        for (kind, base, size) in windows {
            let w = Arc::new(Mutex::new(GicWindow::new(self.clone(), kind)));
            let tif = TargetIf { base, size, latency: LatencyModel::none() };
            out.push(Arc::new(TargetSocket::new(manager, tif, w)?));
        }
        Ok(out)
    }
}

/// Shared interrupt inputs: `line` is the interrupt id.
impl InterruptIf for Gic {
    fn update_irq(&self, value: u64, line: u32) {
        self.set_spi(line, value != 0);
    }
}

/// PPI inputs of one CPU: `line` is the interrupt id.
pub struct PpiInput {
    gic: Arc<Gic>,
    cpu: usize,
}

impl InterruptIf for PpiInput {
    fn update_irq(&self, value: u64, line: u32) {
        self.gic.set_ppi(self.cpu, line, value != 0);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowKind {
    Distributor,
    CpuInterface,
    VirtualControl,
    VirtualCpu,
}

impl WindowKind {
    fn suffix(self) -> &'static str {
        match self {
            WindowKind::Distributor => "dist",
            WindowKind::CpuInterface => "cpu",
            WindowKind::VirtualControl => "vctrl",
            WindowKind::VirtualCpu => "vcpu",
        }
    }
}

/// One register window of a [`Gic`].
pub struct GicWindow {
    gic: Arc<Gic>,
    kind: WindowKind,
    name: String,
}

impl GicWindow {
    pub fn new(gic: Arc<Gic>, kind: WindowKind) -> Self {
        let name = format!("{}.{}", gic.name, kind.suffix());
        GicWindow { gic, kind, name }
    }

    fn read_word(&self, cpu: usize, offset: u64) -> Option<u32> {
        self.gic.update(|st| match self.kind {
            WindowKind::Distributor => st.dist.read(cpu, offset),
            WindowKind::CpuInterface => st.cpus[cpu].read(cpu, &mut st.dist, offset),
            WindowKind::VirtualControl => st.virt[cpu].read_control(offset),
            WindowKind::VirtualCpu => st.virt[cpu].read_vcpu(cpu, offset),
        })
    }

    fn write_word(&self, cpu: usize, offset: u64, value: u32) -> bool {
        self.gic.update(|st| match self.kind {
            WindowKind::Distributor => st.dist.write(cpu, offset, value),
            WindowKind::CpuInterface => st.cpus[cpu].write(cpu, &mut st.dist, offset, value),
            WindowKind::VirtualControl => st.virt[cpu].write_control(offset, value),
            WindowKind::VirtualCpu => st.virt[cpu].write_vcpu(cpu, &mut st.dist, offset, value),
        })
    }

    fn cpu_of(&self, p: &Payload) -> Option<usize> {
        let cpu = p.initiator as usize;
        if cpu < self.gic.num_cpus() {
            Some(cpu)
        } else {
            tracing::warn!("{}: access from initiator {} which is not a CPU", self.name, p.initiator);
            None
        }
    }
}

impl Target for GicWindow {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
        let Some(cpu) = self.cpu_of(p) else {
            return TlmStatus::GenericError;
        };
        let aligned = offset & !3;
        let shift = 8 * (offset & 3);
        match self.read_word(cpu, aligned) {
            Some(v) => p.set_data_u64((v >> shift) as u64),
            None => {
                tracing::warn!("{}: read of reserved offset 0x{:x}", self.name, offset);
                p.set_data_u64(0);
            }
        }
        TlmStatus::Ok
    }

    fn write(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
        let Some(cpu) = self.cpu_of(p) else {
            return TlmStatus::GenericError;
        };
        let value = p.data_u64() as u32;
        let handled = if p.len() == 4 && offset & 3 == 0 {
            self.write_word(cpu, offset, value)
        } else if self.kind == WindowKind::Distributor && Distributor::byte_addressable(offset) {
            self.gic.update(|st| {
                for (i, b) in p.data.iter().enumerate() {
                    st.dist.write_byte(cpu, offset + i as u64, *b);
                }
            });
            true
        } else {
            false
        };
        if !handled {
            tracing::warn!("{}: write of 0x{:x} to reserved offset 0x{:x} ignored", self.name, value, offset);
        }
        TlmStatus::Ok
    }
}
