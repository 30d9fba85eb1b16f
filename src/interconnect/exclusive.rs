//! Exclusive-access monitor
//!
//! Two mechanisms share one line-granular table:
//!
//! * reservations: an exclusive read reserves its line for the initiator;
//!   an exclusive write only goes through while the reservation holds, and
//!   every completed write to a line drops all reservations on it. A failed
//!   exclusive write comes back `Ok` with `exclusive` cleared.
//! * atomic flags: while an initiator's flag is set, every line it touches
//!   is held. Other initiators touching a held line stall in
//!   `poll_interval` steps and get `GenericError` after `timeout`.
//!
//! Initiators with a direct memory path consult the same monitor before
//! bypassing the gate, see [`AtomicMonitor::may_bypass`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::interconnect::Transport;
use crate::kernel::Kernel;
use crate::param::ModuleId;
use crate::payload::{Command, InitiatorId, Payload, TlmStatus};
use crate::target::DmiRegion;
use crate::time::SimTime;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusiveConfig {
    pub line_bytes: u64,
    pub poll_interval: SimTime,
    pub timeout: SimTime,
}

impl Default for ExclusiveConfig {
    fn default() -> Self {
        ExclusiveConfig {
            line_bytes: 64,
            poll_interval: SimTime::from_ns(10),
            timeout: SimTime::from_ms(1),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    reservations: HashMap<InitiatorId, u64>,
    held: HashMap<u64, InitiatorId>,
    flags: HashSet<InitiatorId>,
}

/// Shared between the gate and the initiators that raise atomic flags.
pub struct AtomicMonitor {
    line_bytes: u64,
    state: Mutex<MonitorState>,
}

impl AtomicMonitor {
    pub fn new(line_bytes: u64) -> Self {
        AtomicMonitor { line_bytes: line_bytes.max(1), state: Mutex::new(MonitorState::default()) }
    }

    pub fn line_bytes(&self) -> u64 {
        self.line_bytes
    }

    pub fn line_of(&self, addr: u64) -> u64 {
        addr / self.line_bytes
    }

    fn lines(&self, addr: u64, len: u64) -> std::ops::RangeInclusive<u64> {
        self.line_of(addr)..=self.line_of(addr.saturating_add(len.max(1) - 1))
    }

    /// Whether `who` may access `[addr, addr + len)` without the gate: it
    /// has no atomic flag raised and no other initiator holds the lines.
    pub fn may_bypass(&self, addr: u64, len: u64, who: InitiatorId) -> bool {
        let s = self.state.lock();
        if s.flags.contains(&who) {
            return false;
        }
        self.lines(addr, len).all(|l| s.held.get(&l).map_or(true, |h| *h == who))
    }

    /// A store that went around the gate still breaks reservations.
    pub fn direct_store(&self, addr: u64, len: u64) {
        let lines = self.lines(addr, len);
        self.state.lock().reservations.retain(|_, l| !lines.contains(&*l));
    }

    pub fn set_flag(&self, who: InitiatorId) {
        self.state.lock().flags.insert(who);
    }

    /// Clear the flag and release every line `who` held.
    pub fn reset_flag(&self, who: InitiatorId) {
        let mut s = self.state.lock();
        s.flags.remove(&who);
        s.held.retain(|_, owner| *owner != who);
    }

    pub fn flag(&self, who: InitiatorId) -> bool {
        self.state.lock().flags.contains(&who)
    }

    /// Holder of `line` other than `who`.
    fn blocker(&self, line: u64, who: InitiatorId) -> Option<InitiatorId> {
        self.state.lock().held.get(&line).copied().filter(|h| *h != who)
    }

    fn hold_if_flagged(&self, line: u64, who: InitiatorId) {
        let mut s = self.state.lock();
        if s.flags.contains(&who) {
            s.held.insert(line, who);
        }
    }

    fn reserve(&self, line: u64, who: InitiatorId) {
        self.state.lock().reservations.insert(who, line);
    }

    fn has_reservation(&self, line: u64, who: InitiatorId) -> bool {
        self.state.lock().reservations.get(&who) == Some(&line)
    }

    fn written(&self, line: u64) {
        self.state.lock().reservations.retain(|_, l| *l != line);
    }
}

/// Transport decorator enforcing exclusive semantics in front of an
/// interconnect.
pub struct ExclusiveGate {
    inner: Arc<dyn Transport>,
    monitor: Arc<AtomicMonitor>,
    kernel: Kernel,
    config: ExclusiveConfig,
}

impl ExclusiveGate {
    pub fn new(kernel: &Kernel, inner: Arc<dyn Transport>, monitor: Arc<AtomicMonitor>, config: ExclusiveConfig) -> Self {
        ExclusiveGate { inner, monitor, kernel: kernel.clone(), config }
    }

    pub fn monitor(&self) -> &Arc<AtomicMonitor> {
        &self.monitor
    }

    fn line(&self, addr: u64) -> u64 {
        self.monitor.line_of(addr)
    }

    /// Stall until no other initiator holds `line`. `false` on timeout.
    fn wait_line(&self, line: u64, who: InitiatorId) -> bool {
        let mut waited = SimTime::ZERO;
        while let Some(holder) = self.monitor.blocker(line, who) {
            if waited >= self.config.timeout {
                tracing::warn!(
                    "initiator {} gave up on line 0x{:x} held by {} after {}",
                    who,
                    line * self.monitor.line_bytes(),
                    holder,
                    waited
                );
                return false;
            }
            if self.kernel.wait(self.config.poll_interval).is_err() {
                return false;
            }
            waited += self.config.poll_interval;
        }
        true
    }
}

impl Transport for ExclusiveGate {
    fn b_transport(&self, p: &mut Payload, delay: &mut SimTime) -> TlmStatus {
        if !p.is_active {
            return self.inner.b_transport(p, delay);
        }
        let who = p.initiator;
        let line = self.line(p.address);
        if !self.wait_line(line, who) {
            return TlmStatus::GenericError;
        }
        self.monitor.hold_if_flagged(line, who);

        if p.exclusive && p.command == Command::Write && !self.monitor.has_reservation(line, who) {
            tracing::trace!("exclusive store from {} at 0x{:x} failed", who, p.address);
            p.exclusive = false;
            return TlmStatus::Ok;
        }
        let status = self.inner.b_transport(p, delay);
        if status.is_ok() {
            match p.command {
                Command::Write => self.monitor.written(line),
                Command::Read if p.exclusive => self.monitor.reserve(line, who),
                Command::Read => {}
            }
        }
        status
    }

    fn get_direct_mem_ptr(&self, addr: u64) -> Option<DmiRegion> {
        self.inner.get_direct_mem_ptr(addr)
    }

    fn module(&self) -> ModuleId {
        self.inner.module()
    }
}
