//! GIC distributor
//!
//! Ids 0..16 are SGIs and 16..32 PPIs, both banked per CPU. Shared
//! peripheral interrupts start at 32.

use serde::{Deserialize, Serialize};

pub const SGI_COUNT: u32 = 16;
pub const PRIVATE_COUNT: u32 = 32;
/// Ids at or above this are ignored.
pub const MAX_IRQS: u32 = 512;
pub const SPURIOUS: u32 = 1023;

// Distributor register map (offsets from the window base)
pub const GICD_CTLR: u64 = 0x000;
pub const GICD_TYPER: u64 = 0x004;
pub const GICD_IIDR: u64 = 0x008;
pub const GICD_IGROUPR: u64 = 0x080;
pub const GICD_ISENABLER: u64 = 0x100;
pub const GICD_ICENABLER: u64 = 0x180;
pub const GICD_ISPENDR: u64 = 0x200;
pub const GICD_ICPENDR: u64 = 0x280;
pub const GICD_ISACTIVER: u64 = 0x300;
pub const GICD_ICACTIVER: u64 = 0x380;
pub const GICD_IPRIORITYR: u64 = 0x400;
pub const GICD_ITARGETSR: u64 = 0x800;
pub const GICD_ICFGR: u64 = 0xC00;
pub const GICD_SGIR: u64 = 0xF00;
pub const GICD_CPENDSGIR: u64 = 0xF10;
pub const GICD_SPENDSGIR: u64 = 0xF20;

const IIDR_VALUE: u32 = 0x0200_043b;

/// State of one interrupt as seen by one CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqState {
    pub enabled: bool,
    pub pending: bool,
    pub active: bool,
    pub priority: u8,
    pub targets: u8,
    pub group: bool,
    /// Edge-triggered when set, level-sensitive otherwise.
    pub edge: bool,
    /// Input line level.
    pub level: bool,
}

/// Bitmap registers, one bit per interrupt.
#[derive(Clone, Copy)]
enum BitReg {
    Group,
    SetEnable,
    ClearEnable,
    SetPending,
    ClearPending,
    SetActive,
    ClearActive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Distributor {
    enabled: bool,
    num_cpus: usize,
    num_irqs: u32,
    /// Ids `32..num_irqs`.
    spis: Vec<IrqState>,
    /// `[cpu][id]` for ids below 32.
    banked: Vec<Vec<IrqState>>,
    /// `[cpu][sgi]`: one bit per originating CPU.
    sgi_sources: Vec<Vec<u8>>,
}

impl Distributor {
    /// `num_irqs` is rounded up to a multiple of 32 and capped at
    /// [`MAX_IRQS`].
    pub fn new(num_cpus: usize, num_irqs: u32) -> Self {
        let num_irqs = num_irqs.clamp(PRIVATE_COUNT, MAX_IRQS).div_ceil(32) * 32;
        let mut banked = vec![vec![IrqState::default(); PRIVATE_COUNT as usize]; num_cpus];
        for (cpu, bank) in banked.iter_mut().enumerate() {
            for (id, st) in bank.iter_mut().enumerate() {
                st.targets = 1 << cpu;
                st.edge = (id as u32) < SGI_COUNT;
            }
        }
        Distributor {
            enabled: false,
            num_cpus,
            num_irqs,
            spis: vec![IrqState::default(); (num_irqs - PRIVATE_COUNT) as usize],
            banked,
            sgi_sources: vec![vec![0; SGI_COUNT as usize]; num_cpus],
        }
    }

    pub fn num_irqs(&self) -> u32 {
        self.num_irqs
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn irq(&self, cpu: usize, id: u32) -> Option<&IrqState> {
        if id < PRIVATE_COUNT {
            self.banked.get(cpu)?.get(id as usize)
        } else {
            self.spis.get((id - PRIVATE_COUNT) as usize)
        }
    }

    fn irq_mut(&mut self, cpu: usize, id: u32) -> Option<&mut IrqState> {
        if id < PRIVATE_COUNT {
            self.banked.get_mut(cpu)?.get_mut(id as usize)
        } else {
            self.spis.get_mut((id - PRIVATE_COUNT) as usize)
        }
    }

    pub fn is_pending(&self, cpu: usize, id: u32) -> bool {
        if id < SGI_COUNT {
            return self.sgi_sources.get(cpu).is_some_and(|s| s[id as usize] != 0);
        }
        self.irq(cpu, id).is_some_and(|s| s.pending)
    }

    /// Highest-priority interrupt that `cpu` may take, considering only
    /// priorities strictly below `below`. Ties go to the lowest id.
    pub fn highest_pending(&self, cpu: usize, below: u16) -> Option<(u32, u8)> {
        if !self.enabled || cpu >= self.num_cpus {
            return None;
        }
        let mut best: Option<(u32, u8)> = None;
        for id in 0..self.num_irqs {
            let Some(st) = self.irq(cpu, id) else { continue };
            if !st.enabled || st.active || !self.is_pending(cpu, id) {
                continue;
            }
            if id >= PRIVATE_COUNT && st.targets & (1 << cpu) == 0 {
                continue;
            }
            if st.priority as u16 >= below {
                continue;
            }
            if best.map_or(true, |(_, p)| st.priority < p) {
                best = Some((id, st.priority));
            }
        }
        best
    }

    /// Mark `id` active for `cpu`. Returns the originating CPU for SGIs.
    pub fn acknowledge(&mut self, cpu: usize, id: u32) -> u32 {
        let mut source = 0;
        if let Some(bits) = self.sgi_sources.get_mut(cpu).and_then(|s| s.get_mut(id as usize)) {
            if *bits != 0 {
                source = bits.trailing_zeros();
                *bits &= !(1u8 << source);
            }
        }
        if let Some(st) = self.irq_mut(cpu, id) {
            st.pending = !st.edge && st.level;
            st.active = true;
        }
        source
    }

    pub fn deactivate(&mut self, cpu: usize, id: u32) {
        if let Some(st) = self.irq_mut(cpu, id) {
            st.active = false;
        }
    }

    /// Drive the input line of `id`. `cpu` selects the bank for PPIs.
    pub fn set_line(&mut self, cpu: usize, id: u32, level: bool) {
        if id < SGI_COUNT {
            return;
        }
        let Some(st) = self.irq_mut(cpu, id) else {
            tracing::warn!("GIC: line for interrupt {} ignored (not implemented)", id);
            return;
        };
        let rising = level && !st.level;
        st.level = level;
        if st.edge {
            if rising {
                st.pending = true;
            }
        } else {
            st.pending = level;
        }
    }

    /// `GICD_SGIR` write from `src`.
    pub fn generate_sgi(&mut self, src: usize, value: u32) {
        let id = value & 0xf;
        let list = (value >> 16) & 0xff;
        let targets = match (value >> 24) & 0x3 {
            0 => list,
            1 => 0xff & !(1 << src),
            2 => 1 << src,
            _ => {
                tracing::warn!("GIC: reserved SGI target filter in 0x{:08x}", value);
                return;
            }
        };
        for cpu in 0..self.num_cpus {
            if targets & (1 << cpu) != 0 {
                self.sgi_sources[cpu][id as usize] |= 1 << src;
            }
        }
        tracing::trace!("GIC: SGI {} from cpu {} to mask 0x{:02x}", id, src, targets);
    }

    fn bits(&self, cpu: usize, first: u32, reg: BitReg) -> u32 {
        let mut v = 0;
        for bit in 0..32 {
            let id = first + bit;
            let Some(st) = self.irq(cpu, id) else { break };
            let set = match reg {
                BitReg::Group => st.group,
                BitReg::SetEnable | BitReg::ClearEnable => st.enabled,
                BitReg::SetPending | BitReg::ClearPending => self.is_pending(cpu, id),
                BitReg::SetActive | BitReg::ClearActive => st.active,
            };
            v |= (set as u32) << bit;
        }
        v
    }

    fn write_bits(&mut self, cpu: usize, first: u32, reg: BitReg, value: u32) {
        for bit in 0..32 {
            if value & (1 << bit) == 0 && !matches!(reg, BitReg::Group) {
                continue;
            }
            let id = first + bit;
            let one = value & (1 << bit) != 0;
            let sgi = id < SGI_COUNT;
            let Some(st) = self.irq_mut(cpu, id) else { break };
            match reg {
                BitReg::Group => st.group = one,
                BitReg::SetEnable => st.enabled = true,
                BitReg::ClearEnable => st.enabled = false,
                // SGI pending state is driven through SGIR and the SGI
                // pending registers only
                BitReg::SetPending if !sgi => st.pending = true,
                BitReg::ClearPending if !sgi => st.pending = false,
                BitReg::SetPending | BitReg::ClearPending => {}
                BitReg::SetActive => st.active = true,
                BitReg::ClearActive => st.active = false,
            }
        }
    }

    fn bit_reg(offset: u64) -> Option<(BitReg, u64)> {
        let (reg, base) = match offset {
            0x080..=0x0ff => (BitReg::Group, GICD_IGROUPR),
            0x100..=0x17f => (BitReg::SetEnable, GICD_ISENABLER),
            0x180..=0x1ff => (BitReg::ClearEnable, GICD_ICENABLER),
            0x200..=0x27f => (BitReg::SetPending, GICD_ISPENDR),
            0x280..=0x2ff => (BitReg::ClearPending, GICD_ICPENDR),
            0x300..=0x37f => (BitReg::SetActive, GICD_ISACTIVER),
            0x380..=0x3ff => (BitReg::ClearActive, GICD_ICACTIVER),
            _ => return None,
        };
        Some((reg, offset - base))
    }

    /// Registers written one byte per interrupt.
    pub fn byte_addressable(offset: u64) -> bool {
        matches!(offset, 0x400..=0xbff | 0xf10..=0xf2f)
    }

    /// Word read at a 4-aligned offset, `None` for reserved offsets.
    pub fn read(&self, cpu: usize, offset: u64) -> Option<u32> {
        if let Some((reg, rel)) = Self::bit_reg(offset) {
            return Some(self.bits(cpu, (rel / 4) as u32 * 32, reg));
        }
        match offset {
            GICD_CTLR => Some(self.enabled as u32),
            GICD_TYPER => Some((self.num_irqs / 32 - 1) | ((self.num_cpus as u32 - 1) << 5)),
            GICD_IIDR => Some(IIDR_VALUE),
            0x400..=0xbff => Some((0..4).fold(0, |v, i| v | (self.read_byte(cpu, offset + i) as u32) << (8 * i))),
            0xc00..=0xcff => {
                let first = ((offset - GICD_ICFGR) / 4) as u32 * 16;
                let mut v = 0;
                for k in 0..16 {
                    if let Some(st) = self.irq(cpu, first + k) {
                        v |= ((st.edge as u32) << 1) << (2 * k);
                    }
                }
                Some(v)
            }
            GICD_SGIR => Some(0),
            0xf10..=0xf2f => Some((0..4).fold(0, |v, i| v | (self.read_byte(cpu, offset + i) as u32) << (8 * i))),
            _ => None,
        }
    }

    pub fn read_byte(&self, cpu: usize, offset: u64) -> u8 {
        match offset {
            0x400..=0x7ff => {
                let id = (offset - GICD_IPRIORITYR) as u32;
                self.irq(cpu, id).map_or(0, |s| s.priority)
            }
            0x800..=0xbff => {
                let id = (offset - GICD_ITARGETSR) as u32;
                self.irq(cpu, id).map_or(0, |s| s.targets)
            }
            0xf10..=0xf2f => {
                let id = ((offset - GICD_CPENDSGIR) % 0x10) as usize;
                self.sgi_sources.get(cpu).map_or(0, |s| s[id])
            }
            _ => 0,
        }
    }

    /// Word write at a 4-aligned offset. Returns `false` for reserved
    /// offsets.
    pub fn write(&mut self, cpu: usize, offset: u64, value: u32) -> bool {
        if let Some((reg, rel)) = Self::bit_reg(offset) {
            self.write_bits(cpu, (rel / 4) as u32 * 32, reg, value);
            return true;
        }
        match offset {
            GICD_CTLR => self.enabled = value & 1 != 0,
            GICD_TYPER | GICD_IIDR => {
                tracing::warn!("GIC: write to read-only distributor register 0x{:x}", offset);
            }
            0x400..=0xbff | 0xf10..=0xf2f => {
                for i in 0..4 {
                    self.write_byte(cpu, offset + i, (value >> (8 * i)) as u8);
                }
            }
            0xc00..=0xcff => {
                let first = ((offset - GICD_ICFGR) / 4) as u32 * 16;
                for k in 0..16 {
                    let id = first + k;
                    if id < SGI_COUNT {
                        continue;
                    }
                    if let Some(st) = self.irq_mut(cpu, id) {
                        st.edge = (value >> (2 * k + 1)) & 1 != 0;
                    }
                }
            }
            GICD_SGIR => self.generate_sgi(cpu, value),
            _ => return false,
        }
        true
    }

    pub fn write_byte(&mut self, cpu: usize, offset: u64, value: u8) {
        match offset {
            0x400..=0x7ff => {
                let id = (offset - GICD_IPRIORITYR) as u32;
                if let Some(st) = self.irq_mut(cpu, id) {
                    st.priority = value;
                }
            }
            // banked targets are read-only
            0x800..=0xbff => {
                let id = (offset - GICD_ITARGETSR) as u32;
                if id >= PRIVATE_COUNT {
                    if let Some(st) = self.irq_mut(cpu, id) {
                        st.targets = value;
                    }
                }
            }
            0xf10..=0xf1f => {
                let id = (offset - GICD_CPENDSGIR) as usize;
                if let Some(s) = self.sgi_sources.get_mut(cpu) {
                    s[id] &= !value;
                }
            }
            0xf20..=0xf2f => {
                let id = (offset - GICD_SPENDSGIR) as usize;
                if let Some(s) = self.sgi_sources.get_mut(cpu) {
                    s[id] |= value;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist() -> Distributor {
        let mut d = Distributor::new(4, 96);
        d.write(0, GICD_CTLR, 1);
        d
    }

    #[test]
    fn test_typer_and_rounding() {
        let d = Distributor::new(2, 40);
        assert_eq!(d.num_irqs(), 64);
        assert_eq!(d.read(0, GICD_TYPER), Some(1 | (1 << 5)));
        assert_eq!(Distributor::new(1, 4096).num_irqs(), MAX_IRQS);
        assert_eq!(d.read(0, 0x0c4), None);
    }

    #[test]
    fn test_priority_then_lowest_id() {
        let mut d = dist();
        for id in [40u32, 41, 42] {
            d.write(0, GICD_ISENABLER + 4, 1 << (id - 32));
            d.write_byte(0, GICD_ITARGETSR + id as u64, 0b0001);
            d.set_line(0, id, true);
        }
        d.write_byte(0, GICD_IPRIORITYR + 40, 0x80);
        d.write_byte(0, GICD_IPRIORITYR + 41, 0x40);
        d.write_byte(0, GICD_IPRIORITYR + 42, 0x40);
        assert_eq!(d.highest_pending(0, 0x100), Some((41, 0x40)));
        assert_eq!(d.highest_pending(0, 0x40), None);
        assert_eq!(d.highest_pending(1, 0x100), None);

        d.acknowledge(0, 41);
        // level still high: pending again but active, so skipped
        assert!(d.irq(0, 41).unwrap().pending);
        assert_eq!(d.highest_pending(0, 0x100), Some((42, 0x40)));
    }

    #[test]
    fn test_edge_and_level_lines() {
        let mut d = dist();
        d.write(0, GICD_ICFGR + 8, 0b10); // id 32 edge
        d.set_line(0, 32, true);
        d.set_line(0, 32, false);
        assert!(d.is_pending(0, 32));
        d.set_line(0, 33, true);
        d.set_line(0, 33, false);
        assert!(!d.is_pending(0, 33));
        d.set_line(0, 600, true);
    }

    #[test]
    fn test_sgi_filters_and_sources() {
        let mut d = dist();
        d.generate_sgi(0, (0b1110 << 16) | 5);
        assert!(!d.is_pending(0, 5));
        for cpu in 1..4 {
            assert!(d.is_pending(cpu, 5));
            assert_eq!(d.read_byte(cpu, GICD_SPENDSGIR + 5), 0b0001);
        }
        d.generate_sgi(2, (1 << 24) | 3);
        assert!(d.is_pending(0, 3) && !d.is_pending(2, 3));
        d.generate_sgi(2, (2 << 24) | 4);
        assert!(d.is_pending(2, 4) && !d.is_pending(1, 4));

        d.write_byte(1, GICD_CPENDSGIR + 5, 0xff);
        assert!(!d.is_pending(1, 5));
        assert_eq!(d.acknowledge(3, 5), 0);
        assert!(!d.is_pending(3, 5));
    }
}
