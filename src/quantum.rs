//! Temporal decoupling
//!
//! An initiator runs ahead of the kernel by accumulating local time, and
//! only yields at the next global quantum boundary. Boundaries are global:
//! `t_next` is always a multiple of the quantum, so all initiators meet at
//! the same points.

use crate::error::{Result, VpError};
use crate::kernel::Kernel;
use crate::time::SimTime;

pub struct QuantumKeeper {
    kernel: Kernel,
    quantum: SimTime,
    local: SimTime,
    next_sync: SimTime,
    sync_count: u64,
}

impl QuantumKeeper {
    pub fn new(kernel: &Kernel, quantum: SimTime) -> Result<Self> {
        check_quantum(quantum)?;
        let next_sync = kernel.now().next_boundary(quantum);
        Ok(QuantumKeeper {
            kernel: kernel.clone(),
            quantum,
            local: SimTime::ZERO,
            next_sync,
            sync_count: 0,
        })
    }

    pub fn quantum(&self) -> SimTime {
        self.quantum
    }

    pub fn set_quantum(&mut self, quantum: SimTime) -> Result<()> {
        check_quantum(quantum)?;
        self.quantum = quantum;
        self.next_sync = self.kernel.now().next_boundary(quantum);
        Ok(())
    }

    /// Time run ahead of the kernel.
    pub fn local_time(&self) -> SimTime {
        self.local
    }

    pub fn set_local_time(&mut self, t: SimTime) {
        self.local = t;
    }

    pub fn inc(&mut self, dt: SimTime) {
        self.local += dt;
    }

    /// Kernel time plus local offset.
    pub fn current_time(&self) -> SimTime {
        self.kernel.now() + self.local
    }

    pub fn next_sync(&self) -> SimTime {
        self.next_sync
    }

    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    /// True when the local offset reaches past the current quantum.
    pub fn need_sync(&self) -> bool {
        self.current_time() >= self.next_sync
    }

    /// Wait that brings the kernel to the next boundary, when the local
    /// offset reaches past it.
    pub fn pending_sync(&self) -> Option<SimTime> {
        self.need_sync().then(|| self.next_sync.saturating_sub(self.kernel.now()))
    }

    /// Account a finished wait of `step` taken from [`pending_sync`].
    ///
    /// [`pending_sync`]: QuantumKeeper::pending_sync
    pub fn synced(&mut self, step: SimTime) {
        self.local = self.local.saturating_sub(step);
        self.next_sync = self.kernel.now() + self.quantum;
        self.sync_count += 1;
    }

    /// Account a finished wait of the whole local offset.
    pub fn force_synced(&mut self) {
        self.local = SimTime::ZERO;
        self.next_sync = self.kernel.now().next_boundary(self.quantum);
        self.sync_count += 1;
    }

    /// Yield at quantum boundaries until the local offset fits in the
    /// current quantum again. Each step waits exactly up to the next
    /// boundary. Returns whether the kernel was entered.
    ///
    /// A keeper shared behind a lock should use [`pending_sync`] and
    /// [`synced`] instead so the lock is not held while suspended.
    ///
    /// [`pending_sync`]: QuantumKeeper::pending_sync
    /// [`synced`]: QuantumKeeper::synced
    pub fn sync(&mut self) -> Result<bool> {
        let mut yielded = false;
        while let Some(step) = self.pending_sync() {
            self.kernel.wait(step)?;
            self.synced(step);
            yielded = true;
        }
        Ok(yielded)
    }

    /// Hand the whole local offset to the kernel, then realign on the next
    /// global boundary.
    pub fn force_sync(&mut self) -> Result<()> {
        self.kernel.wait(self.local)?;
        self.force_synced();
        Ok(())
    }
}

fn check_quantum(quantum: SimTime) -> Result<()> {
    if quantum.is_zero() {
        return Err(VpError::invalid("quantum must be non-zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_sync_only_at_boundaries() {
        let k = Kernel::new();
        let q = SimTime::from_us(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (k2, l2) = (k.clone(), log.clone());
        k.spawn("cpu", move || {
            let mut qk = QuantumKeeper::new(&k2, q)?;
            qk.inc(SimTime::from_ns(400));
            assert!(!qk.sync()?);
            assert_eq!(k2.now(), SimTime::ZERO);

            qk.inc(SimTime::from_ns(700));
            assert!(qk.sync()?);
            l2.lock().push((k2.now(), qk.local_time()));

            // three quanta ahead at once
            qk.inc(SimTime::from_ns(3000));
            qk.sync()?;
            l2.lock().push((k2.now(), qk.local_time()));
            assert!(qk.local_time() < q);
            assert_eq!(qk.sync_count(), 4);

            qk.inc(SimTime::from_ns(50));
            qk.force_sync()?;
            l2.lock().push((k2.now(), qk.local_time()));
            assert_eq!(qk.next_sync(), SimTime::from_us(5));
            Ok(())
        })
        .unwrap();
        k.run().unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                (SimTime::from_us(1), SimTime::from_ns(100)),
                (SimTime::from_us(4), SimTime::from_ns(100)),
                (SimTime::from_ns(4150), SimTime::ZERO),
            ]
        );
    }

    #[test]
    fn test_zero_quantum_is_rejected() {
        let k = Kernel::new();
        assert!(matches!(QuantumKeeper::new(&k, SimTime::ZERO), Err(VpError::InvalidArgument(_))));
        let mut qk = QuantumKeeper::new(&k, SimTime::from_us(1)).unwrap();
        assert!(qk.set_quantum(SimTime::ZERO).is_err());
        assert_eq!(qk.quantum(), SimTime::from_us(1));
        qk.set_quantum(SimTime::from_ns(250)).unwrap();
        assert_eq!(qk.next_sync(), SimTime::from_ns(250));
    }

    #[test]
    fn test_split_sync_matches_sync() {
        let k = Kernel::new();
        let k2 = k.clone();
        k.spawn("cpu", move || {
            let mut qk = QuantumKeeper::new(&k2, SimTime::from_us(1))?;
            qk.inc(SimTime::from_ns(2300));
            while let Some(step) = qk.pending_sync() {
                k2.wait(step)?;
                qk.synced(step);
            }
            assert_eq!((k2.now(), qk.local_time()), (SimTime::from_us(2), SimTime::from_ns(300)));
            assert_eq!(qk.sync_count(), 2);
            assert_eq!(qk.pending_sync(), None);
            Ok(())
        })
        .unwrap();
        k.run().unwrap();
    }
}
