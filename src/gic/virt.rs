//! Virtualisation extensions
//!
//! The hypervisor fills list registers through the control window (GICH);
//! the guest acknowledges and ends them through the virtual CPU interface
//! (GICV), which has the layout of the physical one.
//!
//! List register layout: virtual id `[9:0]`, physical id `[19:10]` when
//! `HW`, otherwise `EOI` maintenance request in bit 19; priority `[27:23]`;
//! state `[29:28]` (1 pending, 2 active, 3 both); group `[30]`; `HW` `[31]`.

use serde::{Deserialize, Serialize};

use crate::gic::cpu_if::{GICC_CTLR, GICC_EOIR, GICC_HPPIR, GICC_IAR, GICC_PMR, GICC_RPR, IDLE_PRIORITY};
use crate::gic::distributor::{Distributor, SPURIOUS};

pub const MAINTENANCE_PPI: u32 = 25;
pub const NUM_LRS: usize = 4;

pub const GICH_HCR: u64 = 0x00;
pub const GICH_VTR: u64 = 0x04;
pub const GICH_VMCR: u64 = 0x08;
pub const GICH_MISR: u64 = 0x10;
pub const GICH_EISR0: u64 = 0x20;
pub const GICH_ELRSR0: u64 = 0x30;
pub const GICH_APR: u64 = 0xF0;
pub const GICH_LR0: u64 = 0x100;

const HCR_EN: u32 = 1 << 0;
const HCR_UIE: u32 = 1 << 1;
const HCR_NPIE: u32 = 1 << 3;

const MISR_EOI: u32 = 1 << 0;
const MISR_U: u32 = 1 << 1;
const MISR_NP: u32 = 1 << 3;

const LR_HW: u32 = 1 << 31;
const LR_EOI: u32 = 1 << 19;
const STATE_PENDING: u32 = 1;
const STATE_ACTIVE: u32 = 2;

fn lr_state(lr: u32) -> u32 {
    (lr >> 28) & 0x3
}

fn lr_vid(lr: u32) -> u32 {
    lr & 0x3ff
}

fn lr_priority(lr: u32) -> u8 {
    (((lr >> 23) & 0x1f) << 3) as u8
}

fn with_state(lr: u32, state: u32) -> u32 {
    (lr & !(0x3 << 28)) | (state << 28)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualInterface {
    hcr: u32,
    /// Virtual CPU interface controls: enable in bit 0, priority mask in
    /// `[31:27]`.
    vmcr: u32,
    apr: u32,
    lrs: Vec<u32>,
    eisr: u32,
    /// Virtual ids acknowledged by the guest, innermost last.
    active: Vec<(u32, u8)>,
}

impl Default for VirtualInterface {
    fn default() -> Self {
        VirtualInterface { hcr: 0, vmcr: 0, apr: 0, lrs: vec![0; NUM_LRS], eisr: 0, active: Vec::new() }
    }
}

impl VirtualInterface {
    fn vpmr(&self) -> u16 {
        (((self.vmcr >> 27) & 0x1f) << 3) as u16
    }

    fn running_priority(&self) -> u16 {
        self.active.last().map_or(IDLE_PRIORITY, |(_, p)| *p as u16)
    }

    /// Best pending list register: lowest priority value, then lowest id.
    fn best_pending(&self) -> Option<usize> {
        let below = self.vpmr().min(self.running_priority());
        let mut best: Option<(usize, u8, u32)> = None;
        for (n, lr) in self.lrs.iter().enumerate() {
            if lr_state(*lr) != STATE_PENDING {
                continue;
            }
            let (prio, vid) = (lr_priority(*lr), lr_vid(*lr));
            if prio as u16 >= below {
                continue;
            }
            if best.map_or(true, |(_, p, v)| (prio, vid) < (p, v)) {
                best = Some((n, prio, vid));
            }
        }
        best.map(|(n, _, _)| n)
    }

    pub fn misr(&self) -> u32 {
        let mut misr = 0;
        if self.eisr != 0 {
            misr |= MISR_EOI;
        }
        let valid = self.lrs.iter().filter(|lr| lr_state(**lr) != 0).count();
        if self.hcr & HCR_UIE != 0 && valid <= 1 {
            misr |= MISR_U;
        }
        let any_pending = self.lrs.iter().any(|lr| lr_state(*lr) & STATE_PENDING != 0);
        if self.hcr & HCR_NPIE != 0 && !any_pending {
            misr |= MISR_NP;
        }
        misr
    }

    /// Level of the maintenance interrupt.
    pub fn maintenance(&self) -> bool {
        self.hcr & HCR_EN != 0 && self.misr() != 0
    }

    /// Level of the VIRQ wire.
    pub fn virq(&self) -> bool {
        self.hcr & HCR_EN != 0 && self.vmcr & 1 != 0 && self.best_pending().is_some()
    }

    fn elrsr(&self) -> u32 {
        self.lrs
            .iter()
            .enumerate()
            .filter(|(_, lr)| lr_state(**lr) == 0 && (**lr & LR_HW != 0 || **lr & LR_EOI == 0))
            .fold(0, |acc, (n, _)| acc | (1 << n))
    }

    /// Hypervisor control window.
    pub fn read_control(&self, offset: u64) -> Option<u32> {
        Some(match offset {
            GICH_HCR => self.hcr,
            GICH_VTR => (NUM_LRS as u32 - 1) | (4 << 26) | (4 << 29),
            GICH_VMCR => self.vmcr,
            GICH_MISR => self.misr(),
            GICH_EISR0 => self.eisr,
            GICH_ELRSR0 => self.elrsr(),
            GICH_APR => self.apr,
            o if (GICH_LR0..GICH_LR0 + 4 * NUM_LRS as u64).contains(&o) => self.lrs[((o - GICH_LR0) / 4) as usize],
            _ => return None,
        })
    }

    pub fn write_control(&mut self, offset: u64, value: u32) -> bool {
        match offset {
            GICH_HCR => self.hcr = value,
            GICH_VMCR => self.vmcr = value,
            GICH_APR => self.apr = value,
            GICH_VTR | GICH_MISR | GICH_EISR0 | GICH_ELRSR0 => {
                tracing::warn!("GIC: write to read-only control register 0x{:x}", offset);
            }
            o if (GICH_LR0..GICH_LR0 + 4 * NUM_LRS as u64).contains(&o) => {
                let n = ((o - GICH_LR0) / 4) as usize;
                self.lrs[n] = value;
                self.eisr &= !(1 << n);
            }
            _ => return false,
        }
        true
    }

    fn acknowledge(&mut self, cpu: usize) -> u32 {
        if self.vmcr & 1 == 0 {
            return SPURIOUS;
        }
        let Some(n) = self.best_pending() else {
            return SPURIOUS;
        };
        let lr = self.lrs[n];
        self.lrs[n] = with_state(lr, STATE_ACTIVE);
        self.active.push((lr_vid(lr), lr_priority(lr)));
        tracing::trace!("GIC: vcpu {} acknowledged virtual {}", cpu, lr_vid(lr));
        let vid = lr_vid(lr);
        // software SGIs carry their source cpu in the physical id field
        if vid < 16 && lr & LR_HW == 0 {
            vid | (lr & (0x7 << 10))
        } else {
            vid
        }
    }

    fn end_of_interrupt(&mut self, cpu: usize, dist: &mut Distributor, value: u32) {
        let vid = value & 0x3ff;
        if let Some(pos) = self.active.iter().rposition(|(v, _)| *v == vid) {
            self.active.remove(pos);
        }
        let found = self
            .lrs
            .iter()
            .position(|lr| lr_vid(*lr) == vid && lr_state(*lr) & STATE_ACTIVE != 0);
        let Some(n) = found else {
            tracing::warn!("GIC: vcpu {} EOI for virtual {} not in any list register", cpu, vid);
            return;
        };
        let lr = self.lrs[n];
        let state = lr_state(lr) & !STATE_ACTIVE;
        self.lrs[n] = with_state(lr, state);
        if state != 0 {
            return;
        }
        if lr & LR_HW != 0 {
            dist.deactivate(cpu, (lr >> 10) & 0x3ff);
        } else if lr & LR_EOI != 0 {
            self.eisr |= 1 << n;
        }
    }

    /// Guest-facing virtual CPU interface window.
    pub fn read_vcpu(&mut self, cpu: usize, offset: u64) -> Option<u32> {
        Some(match offset {
            GICC_CTLR => self.vmcr & 1,
            GICC_PMR => self.vpmr() as u32,
            GICC_IAR => self.acknowledge(cpu),
            GICC_RPR => self.running_priority().min(0xff) as u32,
            GICC_HPPIR => self.best_pending().map_or(SPURIOUS, |n| lr_vid(self.lrs[n])),
            GICC_EOIR => 0,
            _ => return None,
        })
    }

    pub fn write_vcpu(&mut self, cpu: usize, dist: &mut Distributor, offset: u64, value: u32) -> bool {
        match offset {
            GICC_CTLR => self.vmcr = (self.vmcr & !1) | (value & 1),
            GICC_PMR => self.vmcr = (self.vmcr & 0x07ff_ffff) | ((value >> 3) << 27),
            GICC_EOIR => self.end_of_interrupt(cpu, dist, value),
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lr(vid: u32, prio: u8, state: u32, extra: u32) -> u32 {
        vid | ((prio as u32 >> 3) << 23) | (state << 28) | extra
    }

    #[test]
    fn test_list_register_lifecycle() {
        let mut d = Distributor::new(1, 64);
        let mut v = VirtualInterface::default();
        v.write_control(GICH_HCR, HCR_EN);
        v.write_vcpu(0, &mut d, GICC_CTLR, 1);
        v.write_vcpu(0, &mut d, GICC_PMR, 0xf8);
        assert!(!v.virq());

        v.write_control(GICH_LR0, lr(40, 0x40, STATE_PENDING, LR_EOI));
        v.write_control(GICH_LR0 + 4, lr(41, 0x20, STATE_PENDING, 0));
        assert!(v.virq());
        assert_eq!(v.read_vcpu(0, GICC_IAR), Some(41));
        assert_eq!(v.read_vcpu(0, GICC_IAR), Some(SPURIOUS));
        assert_eq!(lr_state(v.read_control(GICH_LR0 + 4).unwrap()), STATE_ACTIVE);

        v.write_vcpu(0, &mut d, GICC_EOIR, 41);
        assert_eq!(v.read_vcpu(0, GICC_IAR), Some(40));
        assert!(!v.maintenance());
        v.write_vcpu(0, &mut d, GICC_EOIR, 40);
        // EOI bit asked for maintenance
        assert_eq!(v.read_control(GICH_EISR0), Some(0b01));
        assert!(v.maintenance());
        assert_eq!(v.read_control(GICH_ELRSR0), Some(0b1110));

        v.write_control(GICH_LR0, 0);
        assert!(!v.maintenance());
    }

    #[test]
    fn test_hw_list_register_deactivates_physical() {
        let mut d = Distributor::new(1, 64);
        d.write(0, crate::gic::distributor::GICD_CTLR, 1);
        d.set_line(0, 34, true);
        d.acknowledge(0, 34);
        assert!(d.irq(0, 34).unwrap().active);

        let mut v = VirtualInterface::default();
        v.write_control(GICH_HCR, HCR_EN | HCR_UIE);
        v.write_vcpu(0, &mut d, GICC_CTLR, 1);
        v.write_vcpu(0, &mut d, GICC_PMR, 0xff);
        v.write_control(GICH_LR0, lr(34, 0, STATE_PENDING, LR_HW | (34 << 10)));
        // one valid list register with underflow enabled
        assert!(v.maintenance());
        assert_eq!(v.read_vcpu(0, GICC_IAR), Some(34));
        v.write_vcpu(0, &mut d, GICC_EOIR, 34);
        assert!(!d.irq(0, 34).unwrap().active);
    }
}
