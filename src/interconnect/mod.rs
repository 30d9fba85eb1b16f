//! Transaction routing between initiators and targets

pub mod bridge;
pub mod bus;
pub mod exclusive;
pub mod noc;

use crate::param::ModuleId;
use crate::payload::{Payload, TlmStatus};
use crate::target::DmiRegion;
use crate::time::SimTime;

pub use bridge::Bridge;
pub use bus::Bus;
pub use exclusive::{AtomicMonitor, ExclusiveConfig, ExclusiveGate};

/// Blocking transport: the initiator is suspended (in simulated time)
/// until the transaction completes. `delay` accumulates the annotated
/// latency the initiator has yet to account for.
pub trait Transport: Send + Sync {
    fn b_transport(&self, p: &mut Payload, delay: &mut SimTime) -> TlmStatus;

    /// DMI grant covering `addr`, in the caller's address frame.
    fn get_direct_mem_ptr(&self, _addr: u64) -> Option<DmiRegion> {
        None
    }

    /// Graph node standing for this element.
    fn module(&self) -> ModuleId;
}
