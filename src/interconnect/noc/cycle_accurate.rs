//! Cycle-accurate NoC
//!
//! Each router is a clocked kernel process. Per cycle it
//!
//! 1. moves the head flit of every input FIFO whose slot is free into that
//!    slot, classified by output port,
//! 2. for every output port whose downstream FIFO has room, grants one slot
//!    in round-robin order starting from the port's pointer, and
//! 3. moves the pointer to `winner + 1`.
//!
//! Flits pushed into a FIFO become visible the cycle after. Routers with
//! nothing buffered sleep on an activity event. Master and slave endpoints
//! translate blocking transactions to flit streams and back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, VpError};
use crate::interconnect::noc::memory_map::TargetId;
use crate::interconnect::noc::routing::RoutingTable;
use crate::interconnect::noc::topology::{PortId, RouterId, Topology};
use crate::interconnect::Transport;
use crate::kernel::{EventId, Kernel};
use crate::payload::{Command, Payload, TlmStatus};
use crate::time::SimTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flit {
    pub src: TargetId,
    pub dst: TargetId,
    pub last: bool,
    /// Request direction; responses travel with `forward == false`.
    pub forward: bool,
    pub packet: u64,
}

#[derive(Clone, Copy, Debug)]
struct Queued {
    flit: Flit,
    ready: u64,
}

struct Router {
    inputs: Vec<VecDeque<Queued>>,
    slots: Vec<Option<(Flit, PortId)>>,
    rr: Vec<usize>,
    last_cycle: Option<u64>,
}

impl Router {
    fn new(ports: usize) -> Self {
        Router {
            inputs: vec![VecDeque::new(); ports],
            slots: vec![None; ports],
            rr: vec![0; ports],
            last_cycle: None,
        }
    }

    fn busy(&self) -> bool {
        self.slots.iter().any(Option::is_some) || self.inputs.iter().any(|q| !q.is_empty())
    }
}

/// What one router step produced.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// `(output port, winning input)` per grant.
    pub grants: Vec<(PortId, PortId)>,
    /// Flits that left through a local port.
    pub delivered: Vec<(TargetId, Flit)>,
    /// Routers that received a flit.
    pub woken: Vec<RouterId>,
}

/// Router state of the whole network.
pub struct Fabric {
    routers: Vec<Router>,
    /// Per router and output port, the downstream `(router, input port)`.
    links: Vec<Vec<Option<(RouterId, PortId)>>>,
    routing: Arc<RoutingTable>,
    depth: usize,
}

impl Fabric {
    pub fn new(topo: &Topology, routing: Arc<RoutingTable>, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(VpError::config("NoC FIFO depth must be positive"));
        }
        let n = topo.router_count();
        let mut routers = Vec::with_capacity(n);
        let mut links = Vec::with_capacity(n);
        for r in 0..n {
            let ports = topo.port_count(r);
            routers.push(Router::new(ports));
            let mut out = vec![None; ports];
            for l in topo.links_from(r) {
                out[l.src_port] = Some((l.dst, l.dst_port));
            }
            links.push(out);
        }
        Ok(Fabric { routers, links, routing, depth })
    }

    pub fn can_inject(&self, at: TargetId) -> bool {
        self.routers[at.router].inputs[at.port].len() < self.depth
    }

    /// Push `flit` into the local input FIFO of `at`. Visible next cycle.
    pub fn inject(&mut self, at: TargetId, flit: Flit, cycle: u64) -> bool {
        if !self.can_inject(at) {
            return false;
        }
        self.routers[at.router].inputs[at.port].push_back(Queued { flit, ready: cycle + 1 });
        true
    }

    pub fn busy(&self, r: RouterId) -> bool {
        self.routers[r].busy()
    }

    /// One clock cycle of router `r`. A second call for the same cycle is a
    /// no-op.
    pub fn step(&mut self, r: RouterId, cycle: u64) -> StepOutcome {
        let mut out = StepOutcome::default();
        if self.routers[r].last_cycle == Some(cycle) {
            return out;
        }
        self.routers[r].last_cycle = Some(cycle);
        let nports = self.routers[r].inputs.len();

        for i in 0..nports {
            let router = &mut self.routers[r];
            if router.slots[i].is_some() {
                continue;
            }
            let ready = router.inputs[i].front().is_some_and(|q| q.ready <= cycle);
            if !ready {
                continue;
            }
            let Some(q) = router.inputs[i].pop_front() else { continue };
            let port = if q.flit.dst.router == r {
                Some(q.flit.dst.port)
            } else {
                self.routing.out_port(r, q.flit.dst.router)
            };
            match port {
                Some(p) => self.routers[r].slots[i] = Some((q.flit, p)),
                None => tracing::error!("router {}: no route to {}, flit dropped", r, q.flit.dst),
            }
        }

        for o in 0..nports {
            let router = &self.routers[r];
            let winner = (0..nports)
                .map(|k| (router.rr[o] + k) % nports)
                .find(|i| matches!(router.slots[*i], Some((_, p)) if p == o));
            let Some(w) = winner else { continue };
            let Some((flit, _)) = router.slots[w] else { continue };

            match self.links[r].get(o).copied().flatten() {
                Some((r2, p2)) => {
                    if self.routers[r2].inputs[p2].len() >= self.depth {
                        continue;
                    }
                    self.routers[r2].inputs[p2].push_back(Queued { flit, ready: cycle + 1 });
                    out.woken.push(r2);
                }
                None => out.delivered.push((TargetId { router: r, port: o }, flit)),
            }
            let router = &mut self.routers[r];
            router.slots[w] = None;
            router.rr[o] = (w + 1) % nports;
            out.grants.push((o, w));
        }
        out
    }
}

struct Packet {
    payload: Payload,
    status: TlmStatus,
    src: TargetId,
}

struct CaState {
    fabric: Fabric,
    packets: HashMap<u64, Packet>,
    next_packet: u64,
    /// Requests fully received, per target endpoint.
    requests: HashMap<TargetId, VecDeque<u64>>,
    /// Responses fully received.
    responses: Vec<u64>,
}

/// Shared by the NoC ports and the router and slave processes.
pub struct CycleAccurate {
    kernel: Kernel,
    state: Mutex<CaState>,
    router_events: Vec<EventId>,
    endpoint_events: HashMap<TargetId, EventId>,
    clock: SimTime,
    link_bytes: u64,
}

impl CycleAccurate {
    /// Build the fabric and spawn one process per router and per target.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        kernel: &Kernel,
        topo: &Topology,
        routing: Arc<RoutingTable>,
        depth: usize,
        clock: SimTime,
        link_bytes: u64,
        targets: &HashMap<TargetId, Arc<dyn Transport>>,
        initiators: &[TargetId],
    ) -> Result<Arc<Self>> {
        if clock.is_zero() {
            return Err(VpError::config("cycle-accurate NoC needs a non-zero clock"));
        }
        let fabric = Fabric::new(topo, routing, depth)?;
        let router_events = (0..topo.router_count()).map(|_| kernel.new_event()).collect();
        let endpoint_events = targets
            .keys()
            .chain(initiators.iter())
            .map(|ep| (*ep, kernel.new_event()))
            .collect();
        let ca = Arc::new(CycleAccurate {
            kernel: kernel.clone(),
            state: Mutex::new(CaState {
                fabric,
                packets: HashMap::new(),
                next_packet: 0,
                requests: HashMap::new(),
                responses: Vec::new(),
            }),
            router_events,
            endpoint_events,
            clock,
            link_bytes: link_bytes.max(1),
        });
        for r in 0..topo.router_count() {
            let me = ca.clone();
            kernel.spawn(&format!("noc.router{}", r), move || me.router_loop(r))?;
        }
        for (ep, target) in targets {
            let (me, ep, target) = (ca.clone(), *ep, target.clone());
            kernel.spawn(&format!("noc.slave{}", ep), move || me.slave_loop(ep, target))?;
        }
        Ok(ca)
    }

    fn cycle(&self) -> u64 {
        self.kernel.now().cycles(self.clock)
    }

    fn data_flits(&self, bytes: usize) -> usize {
        (bytes as u64).div_ceil(self.link_bytes) as usize
    }

    fn notify_endpoint(&self, ep: TargetId) {
        if let Some(ev) = self.endpoint_events.get(&ep) {
            self.kernel.notify(*ev);
        }
    }

    fn router_loop(&self, r: RouterId) -> Result<()> {
        loop {
            let now = self.kernel.now();
            let (outcome, busy) = {
                let mut s = self.state.lock();
                let outcome = s.fabric.step(r, now.cycles(self.clock));
                for (ep, flit) in &outcome.delivered {
                    if !flit.last {
                        continue;
                    }
                    if flit.forward {
                        s.requests.entry(*ep).or_default().push_back(flit.packet);
                    } else {
                        s.responses.push(flit.packet);
                    }
                }
                let busy = s.fabric.busy(r);
                (outcome, busy)
            };
            for r2 in outcome.woken {
                self.kernel.notify(self.router_events[r2]);
            }
            for (ep, flit) in outcome.delivered {
                if flit.last {
                    self.notify_endpoint(ep);
                }
            }
            if busy {
                self.kernel.wait_until(now.next_boundary(self.clock))?;
            } else {
                self.kernel.wait_event(self.router_events[r])?;
            }
        }
    }

    /// Push a header and `data` flits from `from` towards `to`, waiting a
    /// cycle whenever the local FIFO is full.
    fn send(&self, from: TargetId, to: TargetId, packet: u64, data: usize, forward: bool) -> Result<()> {
        let total = 1 + data;
        let mut sent = 0;
        while sent < total {
            {
                let mut s = self.state.lock();
                let cycle = self.cycle();
                while sent < total {
                    let flit = Flit { src: from, dst: to, last: sent + 1 == total, forward, packet };
                    if !s.fabric.inject(from, flit, cycle) {
                        break;
                    }
                    sent += 1;
                }
            }
            self.kernel.notify(self.router_events[from.router]);
            if sent < total {
                self.kernel.wait(self.clock)?;
            }
        }
        Ok(())
    }

    fn slave_loop(&self, ep: TargetId, target: Arc<dyn Transport>) -> Result<()> {
        let ev = self.endpoint_events[&ep];
        loop {
            let next = self.state.lock().requests.get_mut(&ep).and_then(VecDeque::pop_front);
            let Some(id) = next else {
                self.kernel.wait_event(ev)?;
                continue;
            };
            let taken = self.state.lock().packets.remove(&id);
            let Some(mut pkt) = taken else { continue };

            let mut delay = SimTime::ZERO;
            pkt.status = target.b_transport(&mut pkt.payload, &mut delay);
            self.kernel.wait(delay)?;

            let data = match pkt.payload.command {
                Command::Read => self.data_flits(pkt.payload.len()),
                Command::Write => 0,
            };
            let src = pkt.src;
            self.state.lock().packets.insert(id, pkt);
            self.send(ep, src, id, data, false)?;
        }
    }

    /// Blocking transaction from initiator endpoint `from` to `to`.
    pub fn transport(&self, from: TargetId, to: TargetId, p: &mut Payload) -> Result<TlmStatus> {
        let id = {
            let mut s = self.state.lock();
            let id = s.next_packet;
            s.next_packet += 1;
            let packet = Packet { payload: p.clone(), status: TlmStatus::GenericError, src: from };
            s.packets.insert(id, packet);
            id
        };
        let data = match p.command {
            Command::Write => self.data_flits(p.len()),
            Command::Read => 0,
        };
        self.send(from, to, id, data, true)?;

        let ev = self.endpoint_events[&from];
        loop {
            let done = {
                let mut s = self.state.lock();
                match s.responses.iter().position(|r| *r == id) {
                    Some(pos) => {
                        s.responses.swap_remove(pos);
                        s.packets.remove(&id)
                    }
                    None => None,
                }
            };
            if let Some(pkt) = done {
                p.data = pkt.payload.data;
                p.dmi = false;
                p.exclusive = pkt.payload.exclusive;
                return Ok(pkt.status);
            }
            self.kernel.wait_event(ev)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconnect::noc::routing::RoutingAlgorithm;

    fn flit_to(dst: TargetId, src_port: PortId) -> Flit {
        Flit { src: TargetId { router: 0, port: src_port }, dst, last: true, forward: true, packet: 0 }
    }

    #[test]
    fn test_round_robin_is_fair_per_output() {
        let mut topo = Topology::new();
        topo.add_router(0).unwrap();
        let ports: Vec<_> = (0..4).map(|_| topo.add_local_port(0).unwrap()).collect();
        let routing = Arc::new(RoutingTable::build(&topo, RoutingAlgorithm::Dijkstra).unwrap());
        let mut fabric = Fabric::new(&topo, routing, 1024).unwrap();
        let sink = TargetId { router: 0, port: ports[3] };
        for &p in &ports[..3] {
            for _ in 0..100 {
                assert!(fabric.inject(TargetId { router: 0, port: p }, flit_to(sink, p), 0));
            }
        }

        let mut winners = Vec::new();
        for cycle in 1..=60 {
            let out = fabric.step(0, cycle);
            assert_eq!(out.grants.len(), 1);
            assert_eq!(out.delivered.len(), 1);
            winners.push(out.grants[0].1);
        }
        for window in winners.windows(10) {
            for input in 0..3 {
                let turns = window.iter().filter(|w| **w == input).count();
                assert!(turns >= 10 / 3, "input {} got {} turns in {:?}", input, turns, window);
            }
        }
    }

    #[test]
    fn test_flits_cross_a_link_one_cycle_later() {
        let mut topo = Topology::mesh(1, 2).unwrap();
        let src = TargetId { router: 0, port: topo.add_local_port(0).unwrap() };
        let dst = TargetId { router: 1, port: topo.add_local_port(1).unwrap() };
        let routing = Arc::new(RoutingTable::build(&topo, RoutingAlgorithm::Xy).unwrap());
        let mut fabric = Fabric::new(&topo, routing, 1).unwrap();

        assert!(fabric.inject(src, flit_to(dst, src.port), 0));
        assert!(!fabric.can_inject(src));
        assert!(fabric.step(0, 0).grants.is_empty());
        let out = fabric.step(0, 1);
        assert_eq!(out.woken, vec![1]);
        assert!(fabric.step(1, 1).delivered.is_empty());
        let out = fabric.step(1, 2);
        assert_eq!(out.delivered, vec![(dst, flit_to(dst, src.port))]);
        assert!(!fabric.busy(0) && !fabric.busy(1));
    }
}
