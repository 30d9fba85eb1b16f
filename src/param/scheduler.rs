//! Parameter changes at fixed simulation dates

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::kernel::{EventId, Kernel};
use crate::param::graph::ModuleId;
use crate::param::manager::ParamManager;
use crate::param::value::Parameter;
use crate::time::SimTime;

/// A parameter change due at `date`.
#[derive(Clone, Debug, PartialEq)]
pub struct Appointment {
    pub module: ModuleId,
    pub space: Option<AddrSpace>,
    pub date: SimTime,
    pub parameter: Parameter,
}

#[derive(Default)]
struct Agenda {
    /// Keyed by `(date, insertion order)`.
    appointments: BTreeMap<(SimTime, u64), Appointment>,
    seq: u64,
}

impl Agenda {
    fn earliest(&self) -> Option<SimTime> {
        self.appointments.keys().next().map(|(date, _)| *date)
    }

    fn take_due(&mut self, now: SimTime) -> Vec<Appointment> {
        let later = self.appointments.split_off(&(now, u64::MAX));
        let due = std::mem::replace(&mut self.appointments, later);
        due.into_values().collect()
    }
}

/// Applies appointments through the [`ParamManager`] from a dedicated
/// kernel process.
#[derive(Clone)]
pub struct ParamScheduler {
    agenda: Arc<Mutex<Agenda>>,
    kernel: Kernel,
    wakeup: EventId,
}

impl ParamScheduler {
    pub fn new(kernel: &Kernel, manager: &ParamManager) -> Result<Self> {
        let sched = ParamScheduler {
            agenda: Arc::new(Mutex::new(Agenda::default())),
            kernel: kernel.clone(),
            wakeup: kernel.new_event(),
        };
        let worker = sched.clone();
        let manager = manager.clone();
        kernel.spawn("param_scheduler", move || worker.serve(&manager))?;
        Ok(sched)
    }

    /// Queue a change. Dates before the current time are rejected.
    pub fn schedule(&self, a: Appointment) -> Result<()> {
        let now = self.kernel.now();
        if a.date < now {
            tracing::warn!("rejecting appointment for {} at {}: now is {}", a.module, a.date, now);
            return Err(VpError::PastAppointment { date: a.date, now });
        }
        a.parameter.validate()?;
        {
            let mut agenda = self.agenda.lock();
            let seq = agenda.seq;
            agenda.seq += 1;
            agenda.appointments.insert((a.date, seq), a);
        }
        self.kernel.notify(self.wakeup);
        Ok(())
    }

    /// Appointments not applied yet.
    pub fn pending(&self) -> usize {
        self.agenda.lock().appointments.len()
    }

    fn serve(&self, manager: &ParamManager) -> Result<()> {
        loop {
            let earliest = self.agenda.lock().earliest();
            let Some(date) = earliest else {
                self.kernel.wait_event(self.wakeup)?;
                continue;
            };
            let now = self.kernel.now();
            if date > now {
                // a sooner appointment may arrive meanwhile
                self.kernel.wait_event_timeout(self.wakeup, date - now)?;
                continue;
            }
            let due = self.agenda.lock().take_due(now);
            for a in due {
                match manager.set_parameter(a.module, a.space, a.parameter) {
                    Ok(()) => tracing::info!("[{}] applied {} to {}", now, a.parameter, a.module),
                    Err(e) => tracing::error!("[{}] appointment for {} failed: {}", now, a.module, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::graph::ModuleKind;

    #[test]
    fn test_appointments_apply_in_date_order() {
        let kernel = Kernel::new();
        let pm = ParamManager::new();
        let ram = pm
            .register("ram", ModuleKind::MemoryMapped, Some(AddrSpace::new(0, 0xfff).unwrap()))
            .unwrap();
        let sched = ParamScheduler::new(&kernel, &pm).unwrap();
        let at = |us, p| Appointment { module: ram.id(), space: None, date: SimTime::from_us(us), parameter: p };
        sched.schedule(at(20, Parameter::delay(SimTime::from_ns(2)))).unwrap();
        sched.schedule(at(10, Parameter::delay(SimTime::from_ns(1)))).unwrap();

        kernel.run_until(Some(SimTime::from_us(15))).unwrap();
        assert_eq!(pm.exported(ram.id()).delay(0x0), SimTime::from_ns(1));
        assert_eq!(sched.pending(), 1);
        kernel.run_until(Some(SimTime::from_us(25))).unwrap();
        assert_eq!(pm.exported(ram.id()).delay(0x0), SimTime::from_ns(2));
        assert_eq!(sched.pending(), 0);

        let past = sched.schedule(at(5, Parameter::blocking(false)));
        assert!(matches!(past, Err(VpError::PastAppointment { .. })));
        kernel.shutdown();
    }
}
