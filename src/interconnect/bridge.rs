//! Address-translating bridge

use std::sync::Arc;

use crate::error::Result;
use crate::interconnect::Transport;
use crate::param::{Modifier, ModuleHandle, ModuleId, ModuleKind, ParamManager, Sign};
use crate::payload::{Payload, TlmStatus};
use crate::target::DmiRegion;
use crate::time::SimTime;

/// Forwards `addr` as `addr - offset`. Parameters exported from downstream
/// are shifted back up so initiators see them at their own addresses.
pub struct Bridge {
    module: ModuleHandle,
    offset: u64,
    downstream: Arc<dyn Transport>,
}

impl Bridge {
    pub fn new(manager: &ParamManager, name: &str, offset: u64, downstream: Arc<dyn Transport>) -> Result<Self> {
        let module = manager.register(name, ModuleKind::Intermediate, None)?;
        manager.add_successor(module.id(), downstream.module(), 0)?;
        manager.add_modifier(module.id(), Modifier::translator(offset, Sign::Plus))?;
        Ok(Bridge { module, offset, downstream })
    }
}

impl Transport for Bridge {
    fn b_transport(&self, p: &mut Payload, delay: &mut SimTime) -> TlmStatus {
        let Some(addr) = p.address.checked_sub(self.offset) else {
            return TlmStatus::AddressError;
        };
        let orig = p.address;
        p.address = addr;
        let status = self.downstream.b_transport(p, delay);
        p.address = orig;
        status
    }

    fn get_direct_mem_ptr(&self, addr: u64) -> Option<DmiRegion> {
        let down = addr.checked_sub(self.offset)?;
        self.downstream.get_direct_mem_ptr(down)?.shifted(self.offset, true)
    }

    fn module(&self) -> ModuleId {
        self.module.id()
    }
}
