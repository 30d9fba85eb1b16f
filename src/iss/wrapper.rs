//! CPU wrapper: one ISS backend bound into the fabric
//!
//! The wrapper owns the CPU's quantum keeper and its initiator port. The
//! backend calls back into it (through [`callbacks`](crate::iss::callbacks)
//! for native libraries) for every memory access and time query, so all
//! of those run on the CPU's simulation process.
//!
//! Interrupts raised by other processes are latched and handed to the
//! backend at the next sync point of this CPU.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::interconnect::{AtomicMonitor, Transport};
use crate::iss::abi::{RW_BUS_ERROR, RW_EXCLUSIVE_FAILED, RW_OK, RW_WRITE_EXCLUSIVE};
use crate::iss::backend::Backend;
use crate::irq::InterruptIf;
use crate::kernel::{EventId, Kernel, ProcessId};
use crate::param::{BlockingTlm, ModuleHandle, ModuleKind, ParamKind, ParamManager, Parameter, ParameterSet};
use crate::payload::{Command, Payload};
use crate::quantum::QuantumKeeper;
use crate::target::DmiRegion;
use crate::time::SimTime;

/// Number of independent `request_timeout` slots.
pub const TIMER_SLOTS: usize = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub name: String,
    pub cpu_id: u32,
    pub quantum: SimTime,
    /// Duration of one instruction tick reported through `rwsync`/`fsync`.
    pub cpu_period: SimTime,
    /// Duration of one `get_time`/`request_timeout` tick.
    pub timer_period: SimTime,
    /// Instructions the backend may run between syncs.
    pub instr_quantum: u64,
    pub stop_on_any_core: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            name: "cpu0".into(),
            cpu_id: 0,
            quantum: SimTime::from_us(1),
            cpu_period: SimTime::from_ns(1),
            timer_period: SimTime::from_ns(1),
            instr_quantum: 1000,
            stop_on_any_core: false,
        }
    }
}

/// Access counters, mostly for tests and end-of-run reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessStats {
    pub direct: u64,
    pub blocking: u64,
    pub dmi_queries: u64,
}

#[derive(Default)]
struct Counters {
    direct: AtomicU64,
    blocking: AtomicU64,
    dmi_queries: AtomicU64,
}

/// Exported parameters of the wrapper plus the DMI grants obtained under
/// them. The update hook marks both stale.
#[derive(Default)]
struct ParamCache {
    params: ParameterSet,
    dmi: Vec<DmiRegion>,
    stale: bool,
}

pub struct IssWrapper {
    me: Weak<IssWrapper>,
    config: CpuConfig,
    kernel: Kernel,
    port: Arc<dyn Transport>,
    module: ModuleHandle,
    monitor: Option<Arc<AtomicMonitor>>,
    keeper: Mutex<QuantumKeeper>,
    cache: Arc<Mutex<ParamCache>>,
    latched: Mutex<Vec<(u64, u32)>>,
    interrupted: AtomicBool,
    was_interrupted: AtomicBool,
    irq_event: EventId,
    timers: Mutex<[u64; TIMER_SLOTS]>,
    counters: Counters,
    backend: OnceLock<Arc<dyn Backend>>,
}

impl IssWrapper {
    /// Register the CPU as a `Dummy` module whose port 0 is bound to `port`.
    pub fn new(
        kernel: &Kernel,
        manager: &ParamManager,
        config: CpuConfig,
        port: Arc<dyn Transport>,
        monitor: Option<Arc<AtomicMonitor>>,
    ) -> Result<Arc<Self>> {
        if config.quantum.is_zero() {
            return Err(VpError::config(format!("{}: quantum must be non-zero", config.name)));
        }
        let module = manager.register(&config.name, ModuleKind::Dummy, None)?;
        let cache = Arc::new(Mutex::new(ParamCache { stale: true, ..ParamCache::default() }));
        let hook_cache = Arc::clone(&cache);
        manager.register_update_hook(module.id(), move || {
            let mut c = hook_cache.lock();
            c.stale = true;
            c.dmi.clear();
        })?;
        manager.add_successor(module.id(), port.module(), 0)?;

        let keeper = QuantumKeeper::new(kernel, config.quantum)?;
        let irq_event = kernel.new_event();
        Ok(Arc::new_cyclic(|me| IssWrapper {
            me: me.clone(),
            config,
            kernel: kernel.clone(),
            port,
            module,
            monitor,
            keeper: Mutex::new(keeper),
            cache,
            latched: Mutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
            was_interrupted: AtomicBool::new(false),
            irq_event,
            timers: Mutex::new([0; TIMER_SLOTS]),
            counters: Counters::default(),
            backend: OnceLock::new(),
        }))
    }

    /// Bind the backend. A wrapper takes exactly one.
    pub fn attach(&self, backend: Arc<dyn Backend>) -> Result<()> {
        self.backend
            .set(backend)
            .map_err(|_| VpError::Backend(format!("{}: backend already attached", self.config.name)))
    }

    pub fn backend(&self) -> Result<&Arc<dyn Backend>> {
        self.backend
            .get()
            .ok_or_else(|| VpError::Backend(format!("{}: no backend attached", self.config.name)))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn cpu_id(&self) -> u32 {
        self.config.cpu_id
    }

    pub fn instr_quantum(&self) -> u64 {
        self.config.instr_quantum
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn stats(&self) -> AccessStats {
        AccessStats {
            direct: self.counters.direct.load(Ordering::Relaxed),
            blocking: self.counters.blocking.load(Ordering::Relaxed),
            dmi_queries: self.counters.dmi_queries.load(Ordering::Relaxed),
        }
    }

    /// Whether the last `wait_for_interrupt` ended because of an interrupt.
    pub fn was_interrupted(&self) -> bool {
        self.was_interrupted.load(Ordering::SeqCst)
    }

    pub fn local_time(&self) -> SimTime {
        self.keeper.lock().local_time()
    }

    /// Kernel time plus the CPU's local offset.
    pub fn current_time(&self) -> SimTime {
        self.keeper.lock().current_time()
    }

    pub fn sync_count(&self) -> u64 {
        self.keeper.lock().sync_count()
    }

    /// Spawn the CPU process, which runs the backend until it returns.
    pub fn start(&self) -> Result<ProcessId> {
        let me = self.me.upgrade().ok_or(VpError::Stopped)?;
        let backend = Arc::clone(self.backend()?);
        self.kernel.spawn(&self.config.name, move || {
            tracing::info!("{} starts at {}", me.name(), me.kernel.now());
            let res = backend.run(&me);
            tracing::info!("{} finished at {}", me.name(), me.current_time());
            res
        })
    }

    fn params(&self) -> ParameterSet {
        let mut c = self.cache.lock();
        if c.stale {
            c.params = self.module.manager().exported(self.module.id());
            c.stale = false;
        }
        c.params.clone()
    }

    fn advance(&self, ticks: u64) {
        self.keeper.lock().inc(self.config.cpu_period * ticks);
    }

    /// Yield to the kernel if the local offset left the quantum, then hand
    /// latched interrupts to the backend.
    fn sync_point(&self) {
        let res = self.sync_keeper();
        self.after_sync(res);
    }

    /// Never holds the keeper lock across `kernel.wait`, so time queries
    /// from other threads work while the CPU is parked.
    fn sync_keeper(&self) -> Result<()> {
        loop {
            let pending = self.keeper.lock().pending_sync();
            let Some(step) = pending else {
                return Ok(());
            };
            self.kernel.wait(step)?;
            self.keeper.lock().synced(step);
        }
    }

    fn force_sync_keeper(&self) -> Result<()> {
        let local = self.keeper.lock().local_time();
        self.kernel.wait(local)?;
        self.keeper.lock().force_synced();
        Ok(())
    }

    fn after_sync(&self, res: Result<()>) {
        if let Err(e) = res {
            tracing::debug!("{}: sync interrupted: {}", self.config.name, e);
            if let Ok(b) = self.backend() {
                b.set_done(true);
            }
        }
        self.deliver_irqs();
    }

    fn deliver_irqs(&self) {
        let pending = std::mem::take(&mut *self.latched.lock());
        if pending.is_empty() {
            return;
        }
        let Ok(backend) = self.backend() else {
            return;
        };
        for (value, line) in pending {
            tracing::trace!("{}: irq line {} <- {}", self.config.name, line, value);
            backend.update_irq(value, line);
        }
    }

    /// Memory access from the backend. `ltime` instruction ticks elapsed
    /// since the previous callback. Returns an `RW_*` code.
    pub fn rwsync(&self, addr: u64, rw: u32, ltime: u64, nbytes: u32, val: &mut u64) -> i32 {
        self.advance(ltime);
        self.sync_point();

        let len = nbytes.clamp(1, 8) as usize;
        let command = if rw & 1 == 1 { Command::Write } else { Command::Read };
        let exclusive = rw >= 2;
        let params = self.params();

        if !exclusive
            && !params.blocking_enabled(addr)
            && self.may_bypass_gate(addr, len)
            && self.direct_access(addr, command, len, val)
        {
            if let (Command::Write, Some(m)) = (command, &self.monitor) {
                m.direct_store(addr, len as u64);
            }
            self.counters.direct.fetch_add(1, Ordering::Relaxed);
            self.keeper.lock().inc(params.delay(addr));
            return RW_OK;
        }

        let mut p = match command {
            Command::Read => Payload::read(addr, len, self.config.cpu_id),
            Command::Write => Payload::write(addr, &val.to_le_bytes()[..len], self.config.cpu_id),
        };
        p.exclusive = exclusive;
        let mut delay = SimTime::ZERO;
        let status = self.port.b_transport(&mut p, &mut delay);
        self.counters.blocking.fetch_add(1, Ordering::Relaxed);
        self.keeper.lock().inc(delay + params.delay(addr));

        if !status.is_ok() {
            tracing::debug!("{}: {} -> {:?}", self.config.name, p, status);
            return RW_BUS_ERROR;
        }
        if command == Command::Read {
            *val = p.data_u64();
        }
        if rw == RW_WRITE_EXCLUSIVE && !p.exclusive {
            return RW_EXCLUSIVE_FAILED;
        }
        RW_OK
    }

    /// Lines held under another CPU's atomic flag, or any line while our
    /// own flag is raised, take the gated path.
    fn may_bypass_gate(&self, addr: u64, len: usize) -> bool {
        self.monitor
            .as_ref()
            .map_or(true, |m| m.may_bypass(addr, len as u64, self.config.cpu_id))
    }

    /// Serve an access from host memory, probing for a grant if needed.
    fn direct_access(&self, addr: u64, command: Command, len: usize, val: &mut u64) -> bool {
        let Some(region) = self.dmi_region(addr, len as u64, command) else {
            return false;
        };
        match command {
            Command::Read => {
                let mut bytes = [0u8; 8];
                if !region.read(addr, &mut bytes[..len]) {
                    return false;
                }
                *val = u64::from_le_bytes(bytes);
                true
            }
            Command::Write => region.write(addr, &val.to_le_bytes()[..len]),
        }
    }

    /// Memoised DMI grant covering `[addr, addr + len)`.
    fn dmi_region(&self, addr: u64, len: u64, command: Command) -> Option<DmiRegion> {
        let span = AddrSpace::from_size(addr, len.max(1)).ok()?;
        let hit = self
            .cache
            .lock()
            .dmi
            .iter()
            .find(|r| r.space.contains_space(&span) && (command == Command::Read || !r.read_only))
            .copied();
        if hit.is_some() {
            return hit;
        }

        self.counters.dmi_queries.fetch_add(1, Ordering::Relaxed);
        let mut query = Payload::dmi_query(addr, command, self.config.cpu_id);
        let mut delay = SimTime::ZERO;
        if !self.port.b_transport(&mut query, &mut delay).is_ok() || !query.dmi {
            return None;
        }
        let region = self.port.get_direct_mem_ptr(addr)?;
        if !region.space.contains_space(&span) {
            return None;
        }
        tracing::debug!("{}: DMI grant {}", self.config.name, region.space);
        {
            let mut c = self.cache.lock();
            if !c.dmi.contains(&region) {
                c.dmi.push(region);
            }
        }
        if command == Command::Write && region.read_only {
            return None;
        }
        Some(region)
    }

    /// Host pointer for direct fetch or data access over `[base, end]`, when
    /// blocking transport is disabled on the whole range.
    pub fn get_dotlm(&self, base: u64, end: u64, is_fetch: bool) -> Option<*mut u8> {
        let space = AddrSpace::new(base, end).ok()?;
        let blocking = self
            .params()
            .get_range(ParamKind::BlockingTlmEnabled, &space)
            .unwrap_or(Parameter::blocking(true));
        if blocking != Parameter::BlockingTlmEnabled(BlockingTlm::Disabled) {
            return None;
        }
        let len = space.size().ok()?;
        let region = self.dmi_region(base, len, Command::Read)?;
        tracing::trace!("{}: dotlm {} (fetch={})", self.config.name, space, is_fetch);
        region.ptr_for(base, len as usize)
    }

    /// Instruction ticks retired without memory traffic.
    pub fn fsync(&self, addr: u64, cnt: u64, instr_quantum: u64, call: bool) {
        tracing::trace!(
            "{}: fsync pc=0x{:x} cnt={} iq={} call={}",
            self.config.name,
            addr,
            cnt,
            instr_quantum,
            call
        );
        self.advance(cnt);
        self.sync_point();
    }

    /// Account `ticks` and hand the whole local offset to the kernel.
    pub fn force_sync(&self, ticks: u64) {
        self.advance(ticks);
        let res = self.force_sync_keeper();
        self.after_sync(res);
    }

    /// Current time in timer ticks.
    pub fn get_time(&self, no_sync: bool) -> u64 {
        if !no_sync {
            self.sync_point();
        }
        let tick = self.config.timer_period.as_ps().max(1);
        self.current_time().as_ps() / tick
    }

    /// Interrupt requested by the backend on itself.
    pub fn interrupt_me(&self, value: u64, line: u32) {
        self.update_irq(value, line);
    }

    /// Call `cb` once the kernel reaches `ticks` timer ticks. A later request
    /// on the same slot (`nosync >> 32`) cancels the earlier one.
    pub fn request_timeout<F>(&self, ticks: u64, nosync: u64, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = ((nosync >> 32) as usize) % TIMER_SLOTS;
        let epoch = {
            let mut t = self.timers.lock();
            t[slot] = t[slot].wrapping_add(1);
            t[slot]
        };
        let at = self.config.timer_period * ticks;
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tracing::trace!("{}: timeout slot {} at {}", self.config.name, slot, at);
        self.kernel.schedule_at(at, move || {
            if me.timers.lock()[slot] != epoch {
                return;
            }
            cb();
            me.interrupted.store(true, Ordering::SeqCst);
            me.kernel.notify(me.irq_event);
        });
    }

    /// Only core 0 may end the simulation unless `stop_on_any_core` is set.
    pub fn stop(&self) {
        if self.config.cpu_id == 0 || self.config.stop_on_any_core {
            tracing::info!("{} stops the simulation at {}", self.config.name, self.current_time());
            self.kernel.stop();
        } else {
            tracing::debug!("{}: stop ignored", self.config.name);
        }
    }

    pub fn atomic_set_flag(&self) {
        if let Some(m) = &self.monitor {
            m.set_flag(self.config.cpu_id);
        }
    }

    pub fn atomic_reset_flag(&self) {
        if let Some(m) = &self.monitor {
            m.reset_flag(self.config.cpu_id);
        }
    }

    /// Sleep until an interrupt or timeout arrives, waking at every quantum
    /// boundary.
    pub fn wait_for_interrupt(&self) {
        let res = self.force_sync_keeper();
        if res.is_err() {
            self.was_interrupted.store(false, Ordering::SeqCst);
            self.after_sync(res);
            return;
        }
        let mut woken = true;
        while !self.interrupted.swap(false, Ordering::SeqCst) {
            let now = self.kernel.now();
            let step = now.next_boundary(self.config.quantum).saturating_sub(now);
            if self.kernel.wait_event_timeout(self.irq_event, step).is_err() {
                woken = false;
                break;
            }
        }
        let res = self.force_sync_keeper();
        self.was_interrupted.store(woken, Ordering::SeqCst);
        tracing::trace!("{}: wfi ends at {}", self.config.name, self.kernel.now());
        self.after_sync(res);
    }

    /// Advertise every DMI grant the port hands out over `space` to the
    /// backend, read-only ones as ROM.
    pub fn advertise_dmi(&self, name: &str, space: &AddrSpace) -> Result<()> {
        let backend = self.backend()?;
        let Some(region) = self.port.get_direct_mem_ptr(space.base()) else {
            return Err(VpError::config(format!("{}: no DMI for {} at {}", self.config.name, name, space)));
        };
        let Some(region) = region.clipped(space) else {
            return Err(VpError::config(format!("{}: DMI for {} misses {}", self.config.name, name, space)));
        };
        if region.read_only {
            backend.create_rom(name, &region)
        } else {
            backend.map_dmi(name, &region)
        }
    }

    pub fn load_elf(&self, path: &Path) -> Result<()> {
        self.backend()?.load_elf(path)
    }
}

impl InterruptIf for IssWrapper {
    fn update_irq(&self, value: u64, line: u32) {
        self.latched.lock().push((value, line));
        if value != 0 {
            self.interrupted.store(true, Ordering::SeqCst);
            self.kernel.notify(self.irq_event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iss::abi::{RW_READ, RW_READ_EXCLUSIVE, RW_WRITE};
    use crate::iss::backend::ClosureBackend;
    use crate::target::tests::Regs;
    use crate::target::{LatencyModel, TargetIf, TargetSocket};

    fn regs(pm: &ParamManager) -> Arc<TargetSocket<Regs>> {
        let regs = Arc::new(Mutex::new(Regs { name: "regs".into(), words: vec![0; 16] }));
        let tif = TargetIf { base: 0x100, size: 64, latency: LatencyModel::none() };
        Arc::new(TargetSocket::new(pm, tif, regs).unwrap())
    }

    #[test]
    fn test_blocking_access_and_delay() {
        let k = Kernel::new();
        let pm = ParamManager::new();
        let t = regs(&pm);
        pm.set_parameter(t.module(), None, Parameter::delay(SimTime::from_ns(5))).unwrap();
        let cpu = IssWrapper::new(&k, &pm, CpuConfig::default(), t.clone(), None).unwrap();

        let result = Arc::new(Mutex::new(None));
        let r2 = result.clone();
        let b = ClosureBackend::new(move |cpu, _| {
            let mut v = 0x55u64;
            let w = cpu.rwsync(0x104, RW_WRITE, 3, 4, &mut v);
            let mut out = 0;
            let r = cpu.rwsync(0x104, RW_READ, 0, 4, &mut out);
            let bad = cpu.rwsync(0x900, RW_READ, 0, 4, &mut out);
            *r2.lock() = Some((w, r, bad, cpu.local_time()));
            Ok(())
        });
        cpu.attach(b).unwrap();
        cpu.start().unwrap();
        k.run().unwrap();

        let (w, r, bad, local) = result.lock().take().unwrap();
        assert_eq!((w, r, bad), (RW_OK, RW_OK, RW_BUS_ERROR));
        assert_eq!(t.target().lock().words[1], 0x55);
        // 3 ticks plus two mapped accesses at 5 ns each
        assert_eq!(local, SimTime::from_ns(13));
        assert_eq!(cpu.stats().blocking, 3);
        k.shutdown();
    }

    #[test]
    fn test_timeout_slots_cancel_and_wake_wfi() {
        let k = Kernel::new();
        let pm = ParamManager::new();
        let t = regs(&pm);
        let cfg = CpuConfig { quantum: SimTime::from_us(1), ..CpuConfig::default() };
        let cpu = IssWrapper::new(&k, &pm, cfg, t, None).unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let (f2, f3) = (fired.clone(), fired.clone());
        let woke = Arc::new(Mutex::new(None));
        let w2 = woke.clone();
        let b = ClosureBackend::new(move |cpu, _| {
            let (a, b) = (f2.clone(), f3.clone());
            cpu.request_timeout(2_000, 0, move || a.lock().push("stale"));
            cpu.request_timeout(5_000, 0, move || b.lock().push("slot0"));
            cpu.wait_for_interrupt();
            *w2.lock() = Some((cpu.kernel().now(), cpu.was_interrupted()));
            Ok(())
        });
        cpu.attach(b).unwrap();
        cpu.start().unwrap();
        k.run().unwrap();

        assert_eq!(*fired.lock(), vec!["slot0"]);
        let (at, interrupted) = woke.lock().take().unwrap();
        assert_eq!(at, SimTime::from_us(5));
        assert!(interrupted);
        k.shutdown();
    }

    #[test]
    fn test_latched_irq_reaches_backend_at_sync() {
        let k = Kernel::new();
        let pm = ParamManager::new();
        let t = regs(&pm);
        let cpu = IssWrapper::new(&k, &pm, CpuConfig::default(), t, None).unwrap();
        let b = ClosureBackend::new(|cpu, b| {
            assert!(b.irq_log().is_empty());
            cpu.fsync(0, 10_000, 1000, false);
            assert!(b.irq_level(0));
            Ok(())
        });
        cpu.attach(b.clone()).unwrap();
        cpu.start().unwrap();
        let c2 = cpu.clone();
        k.schedule_at(SimTime::from_ns(500), move || c2.update_irq(1, 0));
        k.run().unwrap();
        assert_eq!(b.irq_log(), vec![(1, 0)]);
        assert!(b.is_done());
        k.shutdown();
    }

    #[test]
    fn test_stop_only_from_core0() {
        let k = Kernel::new();
        let pm = ParamManager::new();
        let t = regs(&pm);
        let cfg = CpuConfig { name: "cpu1".into(), cpu_id: 1, ..CpuConfig::default() };
        let cpu = IssWrapper::new(&k, &pm, cfg, t, None).unwrap();
        cpu.stop();
        assert!(!k.stop_requested());
        // exclusive read without a gate is a plain read
        let b = ClosureBackend::new(|cpu, _| {
            let mut v = 0;
            assert_eq!(cpu.rwsync(0x100, RW_READ_EXCLUSIVE, 0, 4, &mut v), RW_OK);
            cpu.stop();
            Ok(())
        });
        cpu.attach(b).unwrap();
        assert!(cpu.attach(ClosureBackend::new(|_, _| Ok(()))).is_err());
        cpu.start().unwrap();
        k.run().unwrap();
        assert_eq!(cpu.stats().blocking, 1);
        k.shutdown();
    }
}
