//! Physical CPU interface, one per core

use serde::{Deserialize, Serialize};

use crate::gic::distributor::{Distributor, SPURIOUS};

pub const GICC_CTLR: u64 = 0x00;
pub const GICC_PMR: u64 = 0x04;
pub const GICC_BPR: u64 = 0x08;
pub const GICC_IAR: u64 = 0x0C;
pub const GICC_EOIR: u64 = 0x10;
pub const GICC_RPR: u64 = 0x14;
pub const GICC_HPPIR: u64 = 0x18;
pub const GICC_IIDR: u64 = 0xFC;

/// Running priority when nothing is active.
pub const IDLE_PRIORITY: u16 = 0x100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuInterface {
    enabled: bool,
    pmr: u8,
    bpr: u8,
    /// Acknowledged and not yet ended, innermost last.
    active: Vec<(u32, u8)>,
    /// Last acknowledged id, spurious once it has been ended.
    ack: u32,
}

impl Default for CpuInterface {
    fn default() -> Self {
        CpuInterface { enabled: false, pmr: 0, bpr: 2, active: Vec::new(), ack: SPURIOUS }
    }
}

impl CpuInterface {
    pub fn running_priority(&self) -> u16 {
        self.active.last().map_or(IDLE_PRIORITY, |(_, p)| *p as u16)
    }

    /// Only priorities strictly below this are signalled.
    fn threshold(&self) -> u16 {
        (self.pmr as u16).min(self.running_priority())
    }

    /// Interrupt the IRQ wire of `cpu` should announce.
    pub fn signalled(&self, cpu: usize, dist: &Distributor) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let (id, _) = dist.highest_pending(cpu, self.threshold())?;
        (id != self.ack).then_some(id)
    }

    fn acknowledge(&mut self, cpu: usize, dist: &mut Distributor) -> u32 {
        if !self.enabled {
            return SPURIOUS;
        }
        let Some((id, prio)) = dist.highest_pending(cpu, self.threshold()) else {
            return SPURIOUS;
        };
        let source = dist.acknowledge(cpu, id);
        self.active.push((id, prio));
        self.ack = id;
        tracing::trace!("GIC: cpu {} acknowledged {}", cpu, id);
        id | (source << 10)
    }

    fn end_of_interrupt(&mut self, cpu: usize, dist: &mut Distributor, value: u32) {
        let id = value & 0x3ff;
        match self.active.iter().rposition(|(a, _)| *a == id) {
            Some(pos) => {
                self.active.remove(pos);
                dist.deactivate(cpu, id);
                if self.ack == id {
                    self.ack = SPURIOUS;
                }
            }
            None => tracing::warn!("GIC: cpu {} EOI for inactive interrupt {}", cpu, id),
        }
    }

    pub fn read(&mut self, cpu: usize, dist: &mut Distributor, offset: u64) -> Option<u32> {
        Some(match offset {
            GICC_CTLR => self.enabled as u32,
            GICC_PMR => self.pmr as u32,
            GICC_BPR => self.bpr as u32,
            GICC_IAR => self.acknowledge(cpu, dist),
            GICC_RPR => self.running_priority().min(0xff) as u32,
            GICC_HPPIR => dist.highest_pending(cpu, IDLE_PRIORITY).map_or(SPURIOUS, |(id, _)| id),
            GICC_IIDR => 0x0202_043b,
            GICC_EOIR => 0,
            _ => return None,
        })
    }

    pub fn write(&mut self, cpu: usize, dist: &mut Distributor, offset: u64, value: u32) -> bool {
        match offset {
            GICC_CTLR => self.enabled = value & 1 != 0,
            GICC_PMR => self.pmr = value as u8,
            GICC_BPR => self.bpr = (value & 0x7) as u8,
            GICC_EOIR => self.end_of_interrupt(cpu, dist, value),
            GICC_IAR | GICC_RPR | GICC_HPPIR | GICC_IIDR => {
                tracing::warn!("GIC: write to read-only CPU interface register 0x{:x}", offset);
            }
            _ => return false,
        }
        true
    }
}
