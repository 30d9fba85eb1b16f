//! Register-file peripheral skeleton
//!
//! A bank of 32-bit registers with an optional interrupt output. Device
//! behaviour is plugged in through read and write hooks; without hooks the
//! registers simply hold what was written. Never offers DMI.

use crate::irq::IrqLine;
use crate::payload::{Payload, TlmStatus};
use crate::target::Target;
use crate::time::SimTime;

/// Called on a register read with the register index and stored value;
/// returns the value seen by the initiator.
pub type ReadHook = Box<dyn FnMut(usize, u32) -> u32 + Send>;

/// Called after a register write with the register index, the new value
/// and the peripheral's interrupt output.
pub type WriteHook = Box<dyn FnMut(usize, u32, &mut IrqOutput) + Send>;

/// Interrupt output of a peripheral. Only level changes reach the wire.
#[derive(Debug, Default)]
pub struct IrqOutput {
    line: Option<IrqLine>,
    level: bool,
}

impl IrqOutput {
    pub fn set(&mut self, level: bool) {
        if level == self.level {
            return;
        }
        self.level = level;
        if let Some(l) = &self.line {
            l.set(level);
        }
    }

    pub fn level(&self) -> bool {
        self.level
    }
}

pub struct Peripheral {
    name: String,
    regs: Vec<u32>,
    irq: IrqOutput,
    on_read: Option<ReadHook>,
    on_write: Option<WriteHook>,
}

impl Peripheral {
    /// `size` bytes of registers, rounded up to whole words.
    pub fn new(name: &str, size: u64) -> Self {
        Peripheral {
            name: name.to_string(),
            regs: vec![0; size.div_ceil(4) as usize],
            irq: IrqOutput::default(),
            on_read: None,
            on_write: None,
        }
    }

    pub fn with_irq(mut self, line: IrqLine) -> Self {
        self.irq.line = Some(line);
        self
    }

    pub fn on_read(mut self, hook: ReadHook) -> Self {
        self.on_read = Some(hook);
        self
    }

    pub fn on_write(mut self, hook: WriteHook) -> Self {
        self.on_write = Some(hook);
        self
    }

    pub fn reg(&self, index: usize) -> Option<u32> {
        self.regs.get(index).copied()
    }

    pub fn set_reg(&mut self, index: usize, value: u32) {
        if let Some(r) = self.regs.get_mut(index) {
            *r = value;
        }
    }

    /// Drive the interrupt output from device logic (timers, input events).
    pub fn set_irq(&mut self, level: bool) {
        tracing::trace!("{}: irq {}", self.name, level);
        self.irq.set(level);
    }

    pub fn irq_level(&self) -> bool {
        self.irq.level()
    }

    /// Register index and byte shift of an access. Accesses may not cross a
    /// word boundary.
    fn locate(&self, offset: u64, len: usize) -> Option<(usize, u32)> {
        let shift = (offset % 4) as usize;
        if len == 0 || shift + len > 4 {
            return None;
        }
        let index = (offset / 4) as usize;
        (index < self.regs.len()).then_some((index, (shift * 8) as u32))
    }
}

impl Target for Peripheral {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
        let Some((index, shift)) = self.locate(offset, p.len()) else {
            tracing::warn!("{}: unsupported read of {} bytes at 0x{:x}", self.name, p.len(), offset);
            return TlmStatus::GenericError;
        };
        let stored = self.regs[index];
        let value = match self.on_read.as_mut() {
            Some(hook) => hook(index, stored),
            None => stored,
        };
        p.set_data_u64((value >> shift) as u64);
        TlmStatus::Ok
    }

    fn write(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
        let Some((index, shift)) = self.locate(offset, p.len()) else {
            tracing::warn!("{}: unsupported write of {} bytes at 0x{:x}", self.name, p.len(), offset);
            return TlmStatus::GenericError;
        };
        let mask = if p.len() == 4 { u32::MAX } else { ((1u32 << (p.len() * 8)) - 1) << shift };
        let value = (self.regs[index] & !mask) | (((p.data_u64() as u32) << shift) & mask);
        self.regs[index] = value;
        if let Some(hook) = self.on_write.as_mut() {
            hook(index, value, &mut self.irq);
        }
        TlmStatus::Ok
    }
}
