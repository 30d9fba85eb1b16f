//! Level-sensitive interrupt wires

use std::sync::Arc;

/// Anything with interrupt inputs: CPU wrappers and the GIC.
pub trait InterruptIf: Send + Sync {
    /// Drive input `line` to `value` (0 or 1).
    fn update_irq(&self, value: u64, line: u32);
}

/// One output wire bound to a line of an [`InterruptIf`].
#[derive(Clone)]
pub struct IrqLine {
    sink: Arc<dyn InterruptIf>,
    line: u32,
}

impl IrqLine {
    pub fn new(sink: Arc<dyn InterruptIf>, line: u32) -> Self {
        IrqLine { sink, line }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn set(&self, level: bool) {
        self.sink.update_irq(level as u64, self.line);
    }
}

impl std::fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IrqLine({})", self.line)
    }
}
