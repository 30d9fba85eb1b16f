//! Address-decoding bus

use std::sync::Arc;

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::interconnect::Transport;
use crate::param::{ModuleHandle, ModuleId, ModuleKind, ParamManager};
use crate::payload::{Payload, TlmStatus};
use crate::target::DmiRegion;
use crate::time::SimTime;

/// A target window on the bus
struct Mapping {
    space: AddrSpace,
    target: Arc<dyn Transport>,
}

/// Routes each transaction to the target whose window holds its address.
/// Addresses are forwarded unchanged.
pub struct Bus {
    name: String,
    module: ModuleHandle,
    /// Sorted by base, never overlapping.
    mappings: Vec<Mapping>,
    latency: SimTime,
}

impl Bus {
    pub fn new(manager: &ParamManager, name: &str, latency: SimTime) -> Result<Self> {
        let module = manager.register(name, ModuleKind::Intermediate, None)?;
        Ok(Bus {
            name: name.to_string(),
            module,
            mappings: Vec::new(),
            latency,
        })
    }

    /// Add a target window. Windows may not overlap.
    pub fn map(&mut self, space: AddrSpace, target: Arc<dyn Transport>) -> Result<()> {
        if let Some(m) = self.mappings.iter().find(|m| m.space.intersects(&space)) {
            return Err(VpError::config(format!(
                "{}: window {} overlaps {}",
                self.name, space, m.space
            )));
        }
        let port = self.mappings.len();
        self.module.manager().add_successor(self.module.id(), target.module(), port)?;
        let idx = self.mappings.partition_point(|m| m.space.base() < space.base());
        self.mappings.insert(idx, Mapping { space, target });
        tracing::debug!("{}: port {} -> {}", self.name, port, space);
        Ok(())
    }

    fn find(&self, addr: u64) -> Option<&Mapping> {
        let idx = self.mappings.partition_point(|m| m.space.end() < addr);
        self.mappings.get(idx).filter(|m| m.space.contains(addr))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for Bus {
    fn b_transport(&self, p: &mut Payload, delay: &mut SimTime) -> TlmStatus {
        let Some(m) = self.find(p.address) else {
            tracing::error!("{}: no target at 0x{:x} ({})", self.name, p.address, p);
            return TlmStatus::AddressError;
        };
        if p.is_active {
            *delay += self.latency;
        }
        m.target.b_transport(p, delay)
    }

    fn get_direct_mem_ptr(&self, addr: u64) -> Option<DmiRegion> {
        let m = self.find(addr)?;
        m.target.get_direct_mem_ptr(addr)?.clipped(&m.space)
    }

    fn module(&self) -> ModuleId {
        self.module.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::Regs;
    use crate::target::{LatencyModel, TargetIf, TargetSocket};
    use parking_lot::Mutex;

    fn socket(pm: &ParamManager, name: &str, base: u64) -> Arc<TargetSocket<Regs>> {
        let regs = Arc::new(Mutex::new(Regs { name: name.into(), words: vec![0; 4] }));
        let tif = TargetIf { base, size: 16, latency: LatencyModel::none() };
        Arc::new(TargetSocket::new(pm, tif, regs).unwrap())
    }

    #[test]
    fn test_decode_and_unmapped() {
        let pm = ParamManager::new();
        let mut bus = Bus::new(&pm, "bus", SimTime::from_ns(2)).unwrap();
        let a = socket(&pm, "a", 0x2000);
        let b = socket(&pm, "b", 0x1000);
        bus.map(a.space(), a.clone()).unwrap();
        bus.map(b.space(), b.clone()).unwrap();

        let mut delay = SimTime::ZERO;
        let mut w = Payload::write(0x1004, &7u32.to_le_bytes(), 0);
        assert_eq!(bus.b_transport(&mut w, &mut delay), TlmStatus::Ok);
        assert_eq!(b.target().lock().words[1], 7);
        assert_eq!(delay, SimTime::from_ns(2));

        let mut r = Payload::read(0x3000, 4, 0);
        assert_eq!(bus.b_transport(&mut r, &mut delay), TlmStatus::AddressError);

        let c = socket(&pm, "c", 0x1008);
        assert!(matches!(bus.map(c.space(), c), Err(VpError::Configuration(_))));
    }
}
