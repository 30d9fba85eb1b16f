//! Memory-mapped targets
//!
//! A [`Target`] implements the behaviour behind an address window. The
//! fabric talks to it through a [`TargetSocket`], which owns the window,
//! range-checks and rebases every access, answers DMI queries and applies
//! the latency model.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::addr::AddrSpace;
use crate::error::Result;
use crate::interconnect::Transport;
use crate::param::{ModuleHandle, ModuleId, ModuleKind, ParamManager};
use crate::payload::{Command, Payload, TlmStatus};
use crate::time::SimTime;

/// Host pointer into a target's backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPtr(*mut u8);

// The pointee is a heap buffer owned by a target that outlives every DMI
// grant; accesses are serialised by the cooperative kernel.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    /// # Safety
    /// `ptr` must stay valid for as long as any copy of the handle is used.
    pub unsafe fn new(ptr: *mut u8) -> Self {
        HostPtr(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }
}

/// A DMI grant: host memory backing `space`, in initiator addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmiRegion {
    pub space: AddrSpace,
    pub ptr: HostPtr,
    pub read_only: bool,
}

impl DmiRegion {
    /// Same host memory seen `offset` higher (`up`) or lower.
    pub fn shifted(&self, offset: u64, up: bool) -> Option<Self> {
        let space = self.space.shifted(offset, up).ok()?;
        Some(DmiRegion { space, ..*self })
    }

    /// Restrict the grant to `space`.
    pub fn clipped(&self, space: &AddrSpace) -> Option<Self> {
        let s = self.space.intersection(space)?;
        let skip = (s.base() - self.space.base()) as usize;
        Some(DmiRegion {
            space: s,
            ptr: HostPtr(self.ptr.0.wrapping_add(skip)),
            read_only: self.read_only,
        })
    }

    /// Host pointer for `[addr, addr + len)` when fully inside the region.
    pub fn ptr_for(&self, addr: u64, len: usize) -> Option<*mut u8> {
        let span = AddrSpace::from_size(addr, len.max(1) as u64).ok()?;
        if !self.space.contains_space(&span) {
            return None;
        }
        let off = (addr - self.space.base()) as usize;
        Some(self.ptr.as_ptr().wrapping_add(off))
    }

    /// Copy out of the region; `false` when the access is not fully inside.
    pub fn read(&self, addr: u64, out: &mut [u8]) -> bool {
        match self.ptr_for(addr, out.len()) {
            Some(p) => {
                // SAFETY: bounds checked against the granted window
                unsafe { std::ptr::copy_nonoverlapping(p, out.as_mut_ptr(), out.len()) };
                true
            }
            None => false,
        }
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> bool {
        if self.read_only {
            return false;
        }
        match self.ptr_for(addr, data.len()) {
            Some(p) => {
                // SAFETY: bounds checked against the granted window
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) };
                true
            }
            None => false,
        }
    }
}

/// Timing of a target, in cycles of `cycle_duration`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyModel {
    pub read_cycles: u64,
    pub write_cycles: u64,
    pub initial_access_cycles: u64,
    pub cycle_duration: SimTime,
    /// Width of one access step in bytes.
    pub word_bytes: u64,
    pub enabled: bool,
}

impl Default for LatencyModel {
    fn default() -> Self {
        LatencyModel {
            read_cycles: 1,
            write_cycles: 1,
            initial_access_cycles: 0,
            cycle_duration: SimTime::from_ns(1),
            word_bytes: 8,
            enabled: true,
        }
    }
}

impl LatencyModel {
    pub fn none() -> Self {
        LatencyModel { enabled: false, ..LatencyModel::default() }
    }

    /// Delay for one access of `len` bytes.
    pub fn access_delay(&self, command: Command, len: usize) -> SimTime {
        if !self.enabled {
            return SimTime::ZERO;
        }
        let per_op = match command {
            Command::Read => self.read_cycles,
            Command::Write => self.write_cycles,
        };
        let words = (len as u64).div_ceil(self.word_bytes.max(1));
        self.cycle_duration * (self.initial_access_cycles + per_op * words)
    }
}

/// Behaviour behind an address window. `offset` is relative to the window
/// base and the whole access is inside the window.
pub trait Target: Send {
    fn name(&self) -> &str;

    fn read(&mut self, offset: u64, p: &mut Payload, delay: &mut SimTime) -> TlmStatus;

    fn write(&mut self, offset: u64, p: &mut Payload, delay: &mut SimTime) -> TlmStatus;

    /// Whether the fast path is safe at `offset`.
    fn dmi_allowed(&self, _offset: u64) -> bool {
        false
    }

    /// Host memory for the window placed at `space`, if the target has any.
    fn dmi_region(&mut self, _space: AddrSpace) -> Option<DmiRegion> {
        None
    }

    fn supports_byte_enable(&self) -> bool {
        false
    }
}

/// Placement and timing of a target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TargetIf {
    pub base: u64,
    pub size: u64,
    pub latency: LatencyModel,
}

/// Binds a [`Target`] into the fabric as a memory-mapped module.
pub struct TargetSocket<T: Target> {
    space: AddrSpace,
    latency: LatencyModel,
    target: Arc<Mutex<T>>,
    dmi: Option<DmiRegion>,
    module: ModuleHandle,
}

impl<T: Target> TargetSocket<T> {
    pub fn new(manager: &ParamManager, tif: TargetIf, target: Arc<Mutex<T>>) -> Result<Self> {
        let space = AddrSpace::from_size(tif.base, tif.size)?;
        let (name, dmi) = {
            let mut t = target.lock();
            (t.name().to_string(), t.dmi_region(space))
        };
        let module = manager.register(&name, ModuleKind::MemoryMapped, Some(space))?;
        tracing::info!("target '{}' at {}", name, space);
        Ok(TargetSocket { space, latency: tif.latency, target, dmi, module })
    }

    pub fn space(&self) -> AddrSpace {
        self.space
    }

    pub fn target(&self) -> &Arc<Mutex<T>> {
        &self.target
    }

    pub fn latency(&self) -> &LatencyModel {
        &self.latency
    }

    /// Blocking transport forced at `addr` by the module's own parameters.
    fn blocking_required(&self, addr: u64) -> bool {
        self.module.manager().exported(self.module.id()).blocking_enabled(addr)
    }

    fn offset_of(&self, p: &Payload) -> Option<u64> {
        if !self.space.contains(p.address) {
            return None;
        }
        if !p.data.is_empty() && !self.space.contains_space(&p.span()?) {
            return None;
        }
        Some(p.address - self.space.base())
    }
}

impl<T: Target> Transport for TargetSocket<T> {
    fn b_transport(&self, p: &mut Payload, delay: &mut SimTime) -> TlmStatus {
        let Some(offset) = self.offset_of(p) else {
            tracing::debug!("{}: {} outside {}", self.module.id(), p, self.space);
            return TlmStatus::AddressError;
        };
        let mut t = self.target.lock();
        if !p.is_active {
            p.dmi = self.dmi.is_some() && t.dmi_allowed(offset) && !self.blocking_required(p.address);
            return TlmStatus::Ok;
        }
        if p.command == Command::Write && p.byte_enable.is_some() && !t.supports_byte_enable() {
            return TlmStatus::GenericError;
        }
        let status = match p.command {
            Command::Read => t.read(offset, p, delay),
            Command::Write => t.write(offset, p, delay),
        };
        *delay += self.latency.access_delay(p.command, p.len());
        tracing::trace!("{}: {} -> {:?}", t.name(), p, status);
        status
    }

    fn get_direct_mem_ptr(&self, addr: u64) -> Option<DmiRegion> {
        if !self.space.contains(addr) {
            return None;
        }
        let offset = addr - self.space.base();
        if !self.target.lock().dmi_allowed(offset) {
            return None;
        }
        self.dmi
    }

    fn module(&self) -> ModuleId {
        self.module.id()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Register file of 32-bit words, no DMI.
    pub(crate) struct Regs {
        pub name: String,
        pub words: Vec<u32>,
    }

    impl Target for Regs {
        fn name(&self) -> &str {
            &self.name
        }

        fn read(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
            let v = self.words[(offset / 4) as usize];
            p.set_data_u64(v as u64);
            TlmStatus::Ok
        }

        fn write(&mut self, offset: u64, p: &mut Payload, _delay: &mut SimTime) -> TlmStatus {
            self.words[(offset / 4) as usize] = p.data_u64() as u32;
            TlmStatus::Ok
        }
    }

    #[test]
    fn test_latency_model() {
        let lat = LatencyModel {
            read_cycles: 2,
            write_cycles: 3,
            initial_access_cycles: 5,
            cycle_duration: SimTime::from_ns(10),
            word_bytes: 4,
            enabled: true,
        };
        assert_eq!(lat.access_delay(Command::Read, 4), SimTime::from_ns(70));
        assert_eq!(lat.access_delay(Command::Write, 9), SimTime::from_ns(140));
        assert_eq!(LatencyModel::none().access_delay(Command::Read, 64), SimTime::ZERO);
    }

    #[test]
    fn test_socket_rebases_and_checks_range() {
        let pm = ParamManager::new();
        let regs = Arc::new(Mutex::new(Regs { name: "regs".into(), words: vec![0; 4] }));
        let tif = TargetIf { base: 0x1000, size: 16, latency: LatencyModel::default() };
        let sock = TargetSocket::new(&pm, tif, regs.clone()).unwrap();

        let mut delay = SimTime::ZERO;
        let mut w = Payload::write(0x1008, &0xdead_beefu32.to_le_bytes(), 0);
        assert_eq!(sock.b_transport(&mut w, &mut delay), TlmStatus::Ok);
        assert_eq!(regs.lock().words[2], 0xdead_beef);
        assert_eq!(delay, SimTime::from_ns(1));

        let mut straddle = Payload::read(0x100e, 4, 0);
        assert_eq!(sock.b_transport(&mut straddle, &mut delay), TlmStatus::AddressError);

        let mut query = Payload::dmi_query(0x1000, Command::Read, 0);
        assert_eq!(sock.b_transport(&mut query, &mut delay), TlmStatus::Ok);
        assert!(!query.dmi);
        assert!(sock.get_direct_mem_ptr(0x1000).is_none());

        let mut be = Payload::write(0x1000, &[1, 2, 3, 4], 0);
        be.byte_enable = Some(vec![0xff, 0, 0, 0]);
        assert_eq!(sock.b_transport(&mut be, &mut delay), TlmStatus::GenericError);
    }
}
