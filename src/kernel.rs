//! Cooperative discrete-event kernel
//!
//! Every simulation process runs on its own host thread, but only one of them
//! holds the baton at any instant: a process runs until it waits, hands the
//! baton back to the scheduler, and the scheduler resumes whichever activity
//! is next in the event queue. Ordering is by time first, then FIFO among
//! activities scheduled for the same time.
//!
//! Methods that suspend (`wait*`) must be called from inside a process
//! spawned with [`Kernel::spawn`]. Plain callbacks registered with
//! [`Kernel::schedule_at`] run on the scheduler thread and may not suspend.

use std::any::Any;
use std::cell::Cell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Result, VpError};
use crate::time::SimTime;

pub type ProcessId = usize;

/// Handle on a kernel event that processes can wait on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventId(usize);

thread_local! {
    static CURRENT: Cell<Option<ProcessId>> = const { Cell::new(None) };
}

type Callback = Box<dyn FnOnce() + Send>;

enum Action {
    Resume { pid: ProcessId, gen: u64, by_event: bool },
    Call(u64),
}

struct Entry {
    time: SimTime,
    seq: u64,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Baton {
    Scheduler,
    Process(ProcessId),
}

struct Slot {
    name: String,
    /// Bumped on every resume so that stale wake-ups are dropped.
    gen: u64,
    woken_by_event: bool,
    finished: bool,
}

struct State {
    now: SimTime,
    seq: u64,
    queue: BinaryHeap<Reverse<Entry>>,
    calls: HashMap<u64, Callback>,
    procs: Vec<Slot>,
    waiters: Vec<Vec<(ProcessId, u64)>>,
    baton: Baton,
    stop_requested: bool,
    shutdown: bool,
    /// Panic raised by a process, re-raised on the scheduler thread.
    panic: Option<Box<dyn Any + Send>>,
}

impl State {
    fn push(&mut self, time: SimTime, action: Action) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(Entry { time, seq, action }));
    }
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

impl Inner {
    /// Block the calling process thread until the scheduler hands it the baton.
    fn wait_for_baton(&self, g: &mut MutexGuard<'_, State>, pid: ProcessId) -> Result<()> {
        loop {
            if g.shutdown {
                return Err(VpError::Stopped);
            }
            if g.baton == Baton::Process(pid) {
                return Ok(());
            }
            self.cond.wait(g);
        }
    }

    fn yield_to_scheduler(&self, mut g: MutexGuard<'_, State>, pid: ProcessId) -> Result<()> {
        g.baton = Baton::Scheduler;
        self.cond.notify_all();
        self.wait_for_baton(&mut g, pid)
    }

    fn finish(&self, pid: ProcessId) {
        let mut g = self.state.lock();
        g.procs[pid].finished = true;
        if g.baton == Baton::Process(pid) {
            g.baton = Baton::Scheduler;
        }
        self.cond.notify_all();
    }
}

/// Cloneable handle on the simulation kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<Inner>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Kernel {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    now: SimTime::ZERO,
                    seq: 0,
                    queue: BinaryHeap::new(),
                    calls: HashMap::new(),
                    procs: Vec::new(),
                    waiters: Vec::new(),
                    baton: Baton::Scheduler,
                    stop_requested: false,
                    shutdown: false,
                    panic: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Current simulation time.
    pub fn now(&self) -> SimTime {
        self.inner.state.lock().now
    }

    /// Id of the process running on the calling thread, if any.
    pub fn current_process() -> Option<ProcessId> {
        CURRENT.with(|c| c.get())
    }

    pub fn in_process() -> bool {
        Self::current_process().is_some()
    }

    /// Name a process was spawned with.
    pub fn process_name(&self, pid: ProcessId) -> Option<String> {
        self.inner.state.lock().procs.get(pid).map(|p| p.name.clone())
    }

    /// Spawn a simulation process. It first runs at the current time, after
    /// every activity already queued for that time.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<ProcessId>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let pid = {
            let mut g = self.inner.state.lock();
            if g.shutdown {
                return Err(VpError::Stopped);
            }
            let pid = g.procs.len();
            g.procs.push(Slot {
                name: name.to_string(),
                gen: 0,
                woken_by_event: false,
                finished: false,
            });
            let now = g.now;
            g.push(now, Action::Resume { pid, gen: 0, by_event: false });
            pid
        };

        let inner = Arc::clone(&self.inner);
        let pname = name.to_string();
        let spawned = thread::Builder::new()
            .name(pname.clone())
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(pid)));
                let started = {
                    let mut g = inner.state.lock();
                    inner.wait_for_baton(&mut g, pid)
                };
                if started.is_ok() {
                    match panic::catch_unwind(AssertUnwindSafe(f)) {
                        Ok(Ok(())) | Ok(Err(VpError::Stopped)) => {}
                        Ok(Err(e)) => tracing::error!("process {} terminated: {}", pname, e),
                        Err(payload) => inner.state.lock().panic = Some(payload),
                    }
                }
                inner.finish(pid);
            });
        if let Err(e) = spawned {
            self.inner.finish(pid);
            return Err(e.into());
        }
        Ok(pid)
    }

    /// Run `f` on the scheduler thread at absolute time `at` (clamped to now).
    pub fn schedule_at<F>(&self, at: SimTime, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut g = self.inner.state.lock();
        let id = g.seq;
        g.calls.insert(id, Box::new(f));
        let at = at.max(g.now);
        g.push(at, Action::Call(id));
    }

    fn current_pid() -> Result<ProcessId> {
        Self::current_process().ok_or(VpError::NotInProcess)
    }

    /// Suspend the calling process for `dt`. A zero `dt` yields to every
    /// other activity queued at the current time.
    pub fn wait(&self, dt: SimTime) -> Result<()> {
        let pid = Self::current_pid()?;
        let mut g = self.inner.state.lock();
        let gen = g.procs[pid].gen;
        let at = g.now + dt;
        g.push(at, Action::Resume { pid, gen, by_event: false });
        self.inner.yield_to_scheduler(g, pid)
    }

    /// Suspend the calling process until absolute time `t` (or yield once if
    /// `t` is not in the future).
    pub fn wait_until(&self, t: SimTime) -> Result<()> {
        let dt = t.saturating_sub(self.now());
        self.wait(dt)
    }

    pub fn new_event(&self) -> EventId {
        let mut g = self.inner.state.lock();
        g.waiters.push(Vec::new());
        EventId(g.waiters.len() - 1)
    }

    /// Wake every process currently waiting on `ev`. Waiters resume at the
    /// current time, after the notifier suspends.
    pub fn notify(&self, ev: EventId) {
        let mut g = self.inner.state.lock();
        let waiters = std::mem::take(&mut g.waiters[ev.0]);
        let now = g.now;
        for (pid, gen) in waiters {
            g.push(now, Action::Resume { pid, gen, by_event: true });
        }
    }

    /// Suspend until `ev` is notified.
    pub fn wait_event(&self, ev: EventId) -> Result<()> {
        let pid = Self::current_pid()?;
        let mut g = self.inner.state.lock();
        let gen = g.procs[pid].gen;
        g.waiters[ev.0].push((pid, gen));
        self.inner.yield_to_scheduler(g, pid)
    }

    /// Suspend until `ev` is notified or `dt` elapses. Returns `true` when
    /// the event woke the process.
    pub fn wait_event_timeout(&self, ev: EventId, dt: SimTime) -> Result<bool> {
        let pid = Self::current_pid()?;
        let mut g = self.inner.state.lock();
        let gen = g.procs[pid].gen;
        g.waiters[ev.0].push((pid, gen));
        let at = g.now + dt;
        g.push(at, Action::Resume { pid, gen, by_event: false });
        self.inner.yield_to_scheduler(g, pid)?;
        Ok(self.inner.state.lock().procs[pid].woken_by_event)
    }

    /// Ask the scheduler to return from `run*` once the running activity
    /// suspends.
    pub fn stop(&self) {
        self.inner.state.lock().stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.state.lock().stop_requested
    }

    /// Run until the queue drains, `stop` is called, or the next activity lies
    /// beyond `limit`. With a limit, time is advanced to it when the queue
    /// runs dry or the next activity is later. Returns the final time.
    pub fn run_until(&self, limit: Option<SimTime>) -> Result<SimTime> {
        if Self::in_process() {
            return Err(VpError::invalid("run_until called from inside a process"));
        }
        let inner = &self.inner;
        let mut g = inner.state.lock();
        g.stop_requested = false;
        loop {
            if g.stop_requested || g.shutdown {
                break;
            }
            let next = match g.queue.peek() {
                Some(Reverse(entry)) => entry.time,
                None => {
                    if let Some(limit) = limit {
                        g.now = g.now.max(limit);
                    }
                    break;
                }
            };
            if let Some(limit) = limit {
                if next > limit {
                    g.now = limit;
                    break;
                }
            }
            let Some(Reverse(entry)) = g.queue.pop() else { break };
            match entry.action {
                Action::Resume { pid, gen, by_event } => {
                    let slot = &mut g.procs[pid];
                    if slot.finished || slot.gen != gen {
                        continue;
                    }
                    slot.gen += 1;
                    slot.woken_by_event = by_event;
                    g.now = entry.time;
                    g.baton = Baton::Process(pid);
                    inner.cond.notify_all();
                    while g.baton != Baton::Scheduler {
                        inner.cond.wait(&mut g);
                    }
                    if let Some(payload) = g.panic.take() {
                        drop(g);
                        panic::resume_unwind(payload);
                    }
                }
                Action::Call(id) => {
                    g.now = entry.time;
                    if let Some(cb) = g.calls.remove(&id) {
                        MutexGuard::unlocked(&mut g, cb);
                    }
                }
            }
        }
        Ok(g.now)
    }

    /// Run for `dt` from the current time.
    pub fn run_for(&self, dt: SimTime) -> Result<SimTime> {
        let limit = self.now() + dt;
        self.run_until(Some(limit))
    }

    /// Run until the queue drains or `stop` is called.
    pub fn run(&self) -> Result<SimTime> {
        self.run_until(None)
    }

    /// Release every suspended process with [`VpError::Stopped`]. The kernel
    /// cannot be run again afterwards.
    pub fn shutdown(&self) {
        let mut g = self.inner.state.lock();
        g.shutdown = true;
        g.queue.clear();
        g.calls.clear();
        self.inner.cond.notify_all();
    }

    /// Move a kernel that has not run yet to time `t`. Everything already
    /// queued keeps its offset from the start. Used to resume from a snapshot.
    pub fn warp_to(&self, t: SimTime) -> Result<()> {
        if Self::in_process() {
            return Err(VpError::invalid("warp_to called from inside a process"));
        }
        let mut g = self.inner.state.lock();
        if g.now != SimTime::ZERO {
            return Err(VpError::invalid(format!("kernel already at {}", g.now)));
        }
        let entries = std::mem::take(&mut g.queue).into_vec();
        g.queue = entries
            .into_iter()
            .map(|Reverse(mut e)| {
                e.time += t;
                Reverse(e)
            })
            .collect();
        g.now = t;
        Ok(())
    }

    /// Number of processes that have not returned yet.
    pub fn live_processes(&self) -> usize {
        self.inner.state.lock().procs.iter().filter(|p| !p.finished).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_advances_time() {
        let k = Kernel::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (k2, l2) = (k.clone(), log.clone());
        k.spawn("p", move || {
            l2.lock().push(k2.now());
            k2.wait(SimTime::from_ns(10))?;
            l2.lock().push(k2.now());
            k2.wait(SimTime::from_ns(5))?;
            l2.lock().push(k2.now());
            Ok(())
        })
        .unwrap();
        let end = k.run().unwrap();
        assert_eq!(end, SimTime::from_ns(15));
        assert_eq!(*log.lock(), vec![SimTime::ZERO, SimTime::from_ns(10), SimTime::from_ns(15)]);
    }

    #[test]
    fn test_equal_time_is_fifo() {
        let k = Kernel::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let (k2, l2) = (k.clone(), log.clone());
            k.spawn(name, move || {
                k2.wait(SimTime::from_ns(1))?;
                l2.lock().push(name);
                Ok(())
            })
            .unwrap();
        }
        k.run().unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_event_wakes_waiter_and_timeout_is_reported() {
        let k = Kernel::new();
        let ev = k.new_event();
        let results = Arc::new(Mutex::new(Vec::new()));

        let (k2, r2) = (k.clone(), results.clone());
        k.spawn("waiter", move || {
            let woke = k2.wait_event_timeout(ev, SimTime::from_ns(100))?;
            r2.lock().push((woke, k2.now()));
            let woke = k2.wait_event_timeout(ev, SimTime::from_ns(100))?;
            r2.lock().push((woke, k2.now()));
            Ok(())
        })
        .unwrap();

        let k3 = k.clone();
        k.spawn("notifier", move || {
            k3.wait(SimTime::from_ns(30))?;
            k3.notify(ev);
            Ok(())
        })
        .unwrap();

        k.run().unwrap();
        let r = results.lock().clone();
        assert_eq!(r, vec![(true, SimTime::from_ns(30)), (false, SimTime::from_ns(130))]);
    }

    #[test]
    fn test_wait_outside_process_fails() {
        let k = Kernel::new();
        assert!(matches!(k.wait(SimTime::from_ns(1)), Err(VpError::NotInProcess)));
    }

    #[test]
    fn test_run_until_limit_and_resume() {
        let k = Kernel::new();
        let k2 = k.clone();
        let count = Arc::new(Mutex::new(0u32));
        let c2 = count.clone();
        k.spawn("ticker", move || loop {
            k2.wait(SimTime::from_ns(10))?;
            *c2.lock() += 1;
        })
        .unwrap();
        assert_eq!(k.run_until(Some(SimTime::from_ns(35))).unwrap(), SimTime::from_ns(35));
        assert_eq!(*count.lock(), 3);
        k.run_until(Some(SimTime::from_ns(100))).unwrap();
        assert_eq!(*count.lock(), 10);
        k.shutdown();
    }

    #[test]
    fn test_stop_returns_early() {
        let k = Kernel::new();
        let k2 = k.clone();
        k.spawn("stopper", move || {
            k2.wait(SimTime::from_ns(7))?;
            k2.stop();
            k2.wait(SimTime::from_ns(7))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(k.run().unwrap(), SimTime::from_ns(7));
        assert_eq!(k.run().unwrap(), SimTime::from_ns(14));
    }

    #[test]
    fn test_scheduled_callback_runs_at_time() {
        let k = Kernel::new();
        let seen = Arc::new(Mutex::new(None));
        let (k2, s2) = (k.clone(), seen.clone());
        k.schedule_at(SimTime::from_us(2), move || {
            *s2.lock() = Some(k2.now());
        });
        k.run().unwrap();
        assert_eq!(*seen.lock(), Some(SimTime::from_us(2)));
    }

    #[test]
    fn test_warp_shifts_queued_activity() {
        let k = Kernel::new();
        let seen = Arc::new(Mutex::new(None));
        let (k2, s2) = (k.clone(), seen.clone());
        k.schedule_at(SimTime::from_us(2), move || {
            *s2.lock() = Some(k2.now());
        });
        k.warp_to(SimTime::from_ms(1)).unwrap();
        assert_eq!(k.now(), SimTime::from_ms(1));
        k.run().unwrap();
        assert_eq!(*seen.lock(), Some(SimTime::from_ms(1) + SimTime::from_us(2)));
        assert!(k.warp_to(SimTime::from_ms(5)).is_err());
    }
}
