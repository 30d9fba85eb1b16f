//! Fabric module graph and parameter propagation
//!
//! Every fabric element (initiator, bridge, interconnect, target) is a node
//! owned by the [`ModuleGraph`] arena and addressed by a [`ModuleId`]. Edges
//! go from a node's numbered output port to its successor. Each node exports
//! the parameters its predecessors see: the merge of what its successors
//! export, plus its own intrinsic parameters, rewritten by its modifiers.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::addr::{AddrSpace, SpaceSet};
use crate::error::{Result, VpError};
use crate::param::modifier::{Modifier, ModifierChain};
use crate::param::set::ParameterSet;
use crate::param::value::Parameter;

/// Node visits allowed per refresh, per node in the graph.
const MAX_VISITS_PER_NODE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    /// Owns an address space (memories, peripherals, GIC windows).
    MemoryMapped,
    /// Forwards transactions (buses, bridges, NoCs).
    Intermediate,
    /// Pure initiator endpoint (CPU wrappers, traffic generators).
    Dummy,
}

/// Callback run after a refresh that touched the module.
pub type UpdateHook = Arc<dyn Fn() + Send + Sync>;

struct Node {
    name: String,
    kind: ModuleKind,
    space: Option<AddrSpace>,
    intrinsic: ParameterSet,
    effective: BTreeMap<usize, ParameterSet>,
    exported: ParameterSet,
    modifiers: ModifierChain,
    preds: Vec<ModuleId>,
    succs: BTreeMap<usize, ModuleId>,
    hooks: Vec<UpdateHook>,
}

#[derive(Default)]
pub struct ModuleGraph {
    nodes: Vec<Option<Node>>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        ModuleGraph::default()
    }

    /// Add a module. Names are unique; `MemoryMapped` modules need a space.
    pub fn register(&mut self, name: &str, kind: ModuleKind, space: Option<AddrSpace>) -> Result<ModuleId> {
        if self.by_name.contains_key(name) {
            return Err(VpError::invalid(format!("module '{}' already registered", name)));
        }
        if kind == ModuleKind::MemoryMapped && space.is_none() {
            return Err(VpError::invalid(format!("memory-mapped module '{}' has no address space", name)));
        }
        let id = ModuleId(self.nodes.len());
        self.nodes.push(Some(Node {
            name: name.to_string(),
            kind,
            space,
            intrinsic: ParameterSet::new(),
            effective: BTreeMap::new(),
            exported: ParameterSet::new(),
            modifiers: ModifierChain::new(),
            preds: Vec::new(),
            succs: BTreeMap::new(),
            hooks: Vec::new(),
        }));
        self.by_name.insert(name.to_string(), id);
        tracing::debug!("registered module '{}' as {}", name, id);
        Ok(id)
    }

    /// Remove a module and every edge touching it, then refresh what used to
    /// point at it.
    pub fn deregister(&mut self, id: ModuleId) -> Result<Vec<UpdateHook>> {
        let node = self
            .nodes
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| VpError::invalid(format!("unknown module {}", id)))?;
        self.by_name.remove(&node.name);
        for succ in node.succs.values() {
            if let Some(Some(s)) = self.nodes.get_mut(succ.0) {
                s.preds.retain(|p| *p != id);
            }
        }
        let preds: HashSet<ModuleId> = node.preds.iter().copied().collect();
        for pred in &preds {
            if let Some(Some(p)) = self.nodes.get_mut(pred.0) {
                p.succs.retain(|_, s| *s != id);
            }
        }
        let mut hooks = Vec::new();
        for pred in preds {
            if self.node(pred).is_ok() {
                hooks.extend(self.refresh(pred)?);
            }
        }
        tracing::debug!("deregistered module '{}'", node.name);
        Ok(hooks)
    }

    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: ModuleId) -> Option<&str> {
        self.node(id).ok().map(|n| n.name.as_str())
    }

    pub fn kind(&self, id: ModuleId) -> Option<ModuleKind> {
        self.node(id).ok().map(|n| n.kind)
    }

    pub fn space(&self, id: ModuleId) -> Option<AddrSpace> {
        self.node(id).ok().and_then(|n| n.space)
    }

    pub fn successor(&self, id: ModuleId, port: usize) -> Option<ModuleId> {
        self.node(id).ok().and_then(|n| n.succs.get(&port).copied())
    }

    pub fn predecessors(&self, id: ModuleId) -> &[ModuleId] {
        self.node(id).map(|n| n.preds.as_slice()).unwrap_or(&[])
    }

    fn node(&self, id: ModuleId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| VpError::invalid(format!("unknown module {}", id)))
    }

    fn node_mut(&mut self, id: ModuleId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| VpError::invalid(format!("unknown module {}", id)))
    }

    /// Bind `succ` to output `port` of `id`.
    pub fn add_successor(&mut self, id: ModuleId, succ: ModuleId, port: usize) -> Result<Vec<UpdateHook>> {
        self.node(succ)?;
        let node = self.node_mut(id)?;
        if let Some(bound) = node.succs.get(&port) {
            return Err(VpError::invalid(format!(
                "port {} of '{}' already bound to {}",
                port, node.name, bound
            )));
        }
        node.succs.insert(port, succ);
        self.node_mut(succ)?.preds.push(id);
        self.refresh(id).inspect_err(|_| {
            if let Ok(n) = self.node_mut(id) {
                n.succs.remove(&port);
            }
            if let Ok(s) = self.node_mut(succ) {
                if let Some(i) = s.preds.iter().rposition(|p| *p == id) {
                    s.preds.remove(i);
                }
            }
        })
    }

    /// A modifier whose propagation fails is not kept.
    pub fn add_modifier(&mut self, id: ModuleId, m: Modifier) -> Result<Vec<UpdateHook>> {
        self.node_mut(id)?.modifiers.push(m);
        self.refresh(id).inspect_err(|_| {
            if let Ok(n) = self.node_mut(id) {
                n.modifiers.pop();
            }
        })
    }

    pub fn modifier_count(&self, id: ModuleId) -> usize {
        self.node(id).map(|n| n.modifiers.len()).unwrap_or(0)
    }

    /// Set an intrinsic parameter. Without a space, the module's own space
    /// (or the whole address range) is used.
    pub fn set_parameter(&mut self, id: ModuleId, space: Option<AddrSpace>, p: Parameter) -> Result<Vec<UpdateHook>> {
        let node = self.node_mut(id)?;
        let space = space.or(node.space).unwrap_or(AddrSpace::MAX);
        let previous = node.intrinsic.clone();
        node.intrinsic.set(space, p)?;
        tracing::debug!("'{}': {} on {}", node.name, p, space);
        self.refresh(id).inspect_err(|_| {
            if let Ok(n) = self.node_mut(id) {
                n.intrinsic = previous;
            }
        })
    }

    pub fn register_update_hook(&mut self, id: ModuleId, hook: UpdateHook) -> Result<()> {
        self.node_mut(id)?.hooks.push(hook);
        Ok(())
    }

    pub fn intrinsic(&self, id: ModuleId) -> Option<&ParameterSet> {
        self.node(id).ok().map(|n| &n.intrinsic)
    }

    /// Parameters seen through output `port` of `id`.
    pub fn effective(&self, id: ModuleId, port: usize) -> Option<&ParameterSet> {
        self.node(id).ok().and_then(|n| n.effective.get(&port))
    }

    /// Parameters `id` exports to its predecessors.
    pub fn exported(&self, id: ModuleId) -> Option<&ParameterSet> {
        self.node(id).ok().map(|n| &n.exported)
    }

    /// Address spaces reachable through `id`, in its predecessors' frame.
    pub fn allowed_spaces(&self, id: ModuleId) -> Result<SpaceSet> {
        let mut visited = HashSet::new();
        self.allowed_outgoing(id, &mut visited)
    }

    fn allowed_outgoing(&self, id: ModuleId, visited: &mut HashSet<ModuleId>) -> Result<SpaceSet> {
        let inner = self.allowed_inner(id, visited)?;
        self.node(id)?.modifiers.apply_spaces(&inner)
    }

    /// Allowed spaces before `id`'s own modifiers apply.
    fn allowed_inner(&self, id: ModuleId, visited: &mut HashSet<ModuleId>) -> Result<SpaceSet> {
        let mut out = SpaceSet::new();
        if !visited.insert(id) {
            return Ok(out);
        }
        let node = self.node(id)?;
        if let (ModuleKind::MemoryMapped, Some(space)) = (node.kind, node.space) {
            out.insert(space);
        }
        for succ in node.succs.values() {
            out.union(&self.allowed_outgoing(*succ, visited)?);
        }
        Ok(out)
    }

    /// Recompute exported sets for `id` and everything that can reach it.
    /// Returns the update hooks of the touched modules; the caller runs
    /// them once the graph is no longer borrowed.
    ///
    /// On error every touched module gets its previous sets back.
    pub fn refresh(&mut self, id: ModuleId) -> Result<Vec<UpdateHook>> {
        let order = self.backward_reachable(id)?;
        let mut saved = Vec::with_capacity(order.len());
        for m in &order {
            let n = self.node_mut(*m)?;
            saved.push((std::mem::take(&mut n.exported), std::mem::take(&mut n.effective)));
        }
        match self.propagate(id, &order) {
            Ok(hooks) => Ok(hooks),
            Err(e) => {
                for (m, (exported, effective)) in order.iter().zip(saved) {
                    let n = self.node_mut(*m)?;
                    n.exported = exported;
                    n.effective = effective;
                }
                Err(e)
            }
        }
    }

    fn propagate(&mut self, id: ModuleId, order: &[ModuleId]) -> Result<Vec<UpdateHook>> {
        let mut queue: VecDeque<ModuleId> = order.iter().copied().collect();
        let mut queued: HashSet<ModuleId> = order.iter().copied().collect();
        let budget = MAX_VISITS_PER_NODE * self.nodes.len().max(1);
        let mut visits = 0;

        while let Some(m) = queue.pop_front() {
            queued.remove(&m);
            visits += 1;
            if visits > budget {
                return Err(VpError::config(format!(
                    "parameter propagation through '{}' does not converge",
                    self.node(m)?.name
                )));
            }
            if self.recompute(m)? {
                for p in self.node(m)?.preds.clone() {
                    if queued.insert(p) {
                        queue.push_back(p);
                    }
                }
            }
        }

        let mut hooks = Vec::new();
        for m in order {
            hooks.extend(self.node(*m)?.hooks.iter().cloned());
        }
        tracing::debug!("refreshed {} module(s) from {} in {} step(s)", order.len(), id, visits);
        Ok(hooks)
    }

    /// `id` first, then its predecessors breadth-first.
    fn backward_reachable(&self, id: ModuleId) -> Result<Vec<ModuleId>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([id]);
        seen.insert(id);
        while let Some(m) = queue.pop_front() {
            order.push(m);
            for p in &self.node(m)?.preds {
                if seen.insert(*p) {
                    queue.push_back(*p);
                }
            }
        }
        Ok(order)
    }

    /// One propagation step for `id`. Returns whether its exported set changed.
    fn recompute(&mut self, id: ModuleId) -> Result<bool> {
        let node = self.node(id)?;
        let mut effective = BTreeMap::new();
        for (port, succ) in &node.succs {
            effective.insert(*port, self.node(*succ)?.exported.clone());
        }

        let mut working = ParameterSet::new();
        for set in effective.values() {
            working.merge(set)?;
        }

        let allowed = self.allowed_inner(id, &mut HashSet::new())?;
        let mut own = node.intrinsic.clone();
        own.trim(&allowed);
        working.add(&own)?;

        let exported = node.modifiers.apply_params(&working)?;
        let node = self.node_mut(id)?;
        node.effective = effective;
        let changed = exported != node.exported;
        node.exported = exported;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::modifier::Sign;
    use crate::param::value::ParamKind;
    use crate::time::SimTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sp(base: u64, end: u64) -> AddrSpace {
        AddrSpace::new(base, end).unwrap()
    }

    #[test]
    fn test_parameters_flow_to_initiator() {
        let mut g = ModuleGraph::new();
        let cpu = g.register("cpu", ModuleKind::Dummy, None).unwrap();
        let bus = g.register("bus", ModuleKind::Intermediate, None).unwrap();
        let ram = g.register("ram", ModuleKind::MemoryMapped, Some(sp(0x0, 0xffff))).unwrap();
        g.add_successor(cpu, bus, 0).unwrap();
        g.add_successor(bus, ram, 0).unwrap();
        g.set_parameter(ram, None, Parameter::blocking(false)).unwrap();
        g.set_parameter(bus, None, Parameter::delay(SimTime::from_ns(5))).unwrap();

        let eff = g.effective(cpu, 0).unwrap();
        assert!(!eff.blocking_enabled(0x1000));
        assert!(eff.blocking_enabled(0x1_0000));
        // the bus delay was trimmed to what the bus can reach
        assert_eq!(eff.delay(0x1000), SimTime::from_ns(5));
        assert_eq!(eff.get(ParamKind::ApproximateDelay, 0x2_0000), None);
    }

    #[test]
    fn test_merge_over_ports_and_translation() {
        let mut g = ModuleGraph::new();
        let bridge = g.register("bridge", ModuleKind::Intermediate, None).unwrap();
        let a = g.register("a", ModuleKind::MemoryMapped, Some(sp(0x0, 0xfff))).unwrap();
        let b = g.register("b", ModuleKind::MemoryMapped, Some(sp(0x1000, 0x1fff))).unwrap();
        g.set_parameter(a, None, Parameter::delay(SimTime::from_ns(2))).unwrap();
        g.set_parameter(b, None, Parameter::delay(SimTime::from_ns(9))).unwrap();
        g.add_successor(bridge, a, 0).unwrap();
        g.add_successor(bridge, b, 1).unwrap();
        g.add_modifier(bridge, Modifier::translator(0x4000_0000, Sign::Plus)).unwrap();

        let out = g.exported(bridge).unwrap();
        assert_eq!(out.delay(0x4000_0010), SimTime::from_ns(2));
        assert_eq!(out.delay(0x4000_1010), SimTime::from_ns(9));
        let allowed = g.allowed_spaces(bridge).unwrap();
        assert!(allowed.contains(0x4000_1fff));
        assert!(!allowed.contains(0x1000));
    }

    #[test]
    fn test_failure_modes() {
        let mut g = ModuleGraph::new();
        let x = g.register("x", ModuleKind::Intermediate, None).unwrap();
        let y = g.register("y", ModuleKind::Intermediate, None).unwrap();
        assert!(matches!(g.register("x", ModuleKind::Dummy, None), Err(VpError::InvalidArgument(_))));
        g.add_successor(x, y, 0).unwrap();
        assert!(matches!(g.add_successor(x, y, 0), Err(VpError::InvalidArgument(_))));

        let r = g.register("r", ModuleKind::MemoryMapped, Some(sp(0x0, 0xff))).unwrap();
        g.add_successor(y, r, 0).unwrap();
        assert!(matches!(
            g.add_modifier(y, Modifier::translator(0x1000, Sign::Minus)),
            Err(VpError::Overflow(_))
        ));
    }

    #[test]
    fn test_graph_usable_after_translator_wrap() {
        let mut g = ModuleGraph::new();
        let cpu = g.register("cpu", ModuleKind::Dummy, None).unwrap();
        let y = g.register("y", ModuleKind::Intermediate, None).unwrap();
        let r = g.register("r", ModuleKind::MemoryMapped, Some(sp(0x0, 0xff))).unwrap();
        g.add_successor(cpu, y, 0).unwrap();
        g.add_successor(y, r, 0).unwrap();
        g.set_parameter(r, None, Parameter::blocking(false)).unwrap();
        let before = g.exported(cpu).unwrap().clone();
        assert!(!before.blocking_enabled(0x10));

        assert!(matches!(
            g.add_modifier(y, Modifier::translator(0x1000, Sign::Minus)),
            Err(VpError::Overflow(_))
        ));
        assert_eq!(g.modifier_count(y), 0);
        assert_eq!(g.exported(cpu), Some(&before));
        assert_eq!(g.effective(cpu, 0), Some(&before));

        g.set_parameter(r, None, Parameter::delay(SimTime::from_ns(3))).unwrap();
        let eff = g.effective(cpu, 0).unwrap();
        assert!(!eff.blocking_enabled(0x10));
        assert_eq!(eff.delay(0x10), SimTime::from_ns(3));
        g.add_modifier(y, Modifier::translator(0x1000, Sign::Plus)).unwrap();
        assert!(!g.exported(cpu).unwrap().blocking_enabled(0x1010));
    }

    #[test]
    fn test_cycle_of_intermediates_converges() {
        let mut g = ModuleGraph::new();
        let a = g.register("a", ModuleKind::Intermediate, None).unwrap();
        let b = g.register("b", ModuleKind::Intermediate, None).unwrap();
        let m = g.register("m", ModuleKind::MemoryMapped, Some(sp(0x0, 0xff))).unwrap();
        g.set_parameter(m, None, Parameter::blocking(false)).unwrap();
        g.add_successor(a, b, 0).unwrap();
        g.add_successor(b, a, 0).unwrap();
        g.add_successor(b, m, 1).unwrap();
        assert!(!g.exported(a).unwrap().blocking_enabled(0x10));
    }

    #[test]
    fn test_hooks_and_deregister() {
        let mut g = ModuleGraph::new();
        let cpu = g.register("cpu", ModuleKind::Dummy, None).unwrap();
        let ram = g.register("ram", ModuleKind::MemoryMapped, Some(sp(0x0, 0xff))).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        g.register_update_hook(cpu, Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        g.add_successor(cpu, ram, 0).unwrap();
        let hooks = g.set_parameter(ram, None, Parameter::blocking(false)).unwrap();
        hooks.iter().for_each(|f| f());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let hooks = g.deregister(ram).unwrap();
        hooks.iter().for_each(|f| f());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(g.find("ram").is_none());
        assert!(g.exported(cpu).unwrap().blocking_enabled(0x10));
    }
}
