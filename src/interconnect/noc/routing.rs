//! Routing tables
//!
//! A table maps `(router, destination router)` to the output port to take.
//! Entries are first-writer-wins, so routes derived from different sources
//! never overwrite each other.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VpError};
use crate::interconnect::noc::topology::{RouterId, PortId, Topology, EAST, NORTH, SOUTH, WEST};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAlgorithm {
    /// Shortest path on the unit-weight graph, ties broken by discovery
    /// order. No deadlock guarantee on arbitrary topologies.
    #[default]
    Dijkstra,
    /// Dimension-ordered, meshes only.
    Xy,
}

#[derive(Clone, Debug, Default)]
pub struct RoutingTable {
    next: Vec<HashMap<RouterId, PortId>>,
    hops: Vec<Vec<Option<u32>>>,
}

impl RoutingTable {
    pub fn new(routers: usize) -> Self {
        RoutingTable {
            next: vec![HashMap::new(); routers],
            hops: vec![vec![None; routers]; routers],
        }
    }

    pub fn build(topo: &Topology, algo: RoutingAlgorithm) -> Result<Self> {
        let mut table = RoutingTable::new(topo.router_count());
        match algo {
            RoutingAlgorithm::Dijkstra => table.fill_shortest(topo),
            RoutingAlgorithm::Xy => table.fill_xy(topo)?,
        }
        table.compute_hops(topo)?;
        tracing::debug!("routing ({:?}) built for {} routers", algo, topo.router_count());
        Ok(table)
    }

    /// Returns `false` (and keeps the old entry) when a route already exists.
    pub fn add_route(&mut self, at: RouterId, dst: RouterId, port: PortId) -> bool {
        match self.next[at].entry(dst) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(port);
                true
            }
        }
    }

    pub fn out_port(&self, at: RouterId, dst: RouterId) -> Option<PortId> {
        self.next.get(at)?.get(&dst).copied()
    }

    /// Links crossed from `src` to `dst` along the established route.
    pub fn hop_count(&self, src: RouterId, dst: RouterId) -> Option<u32> {
        *self.hops.get(src)?.get(dst)?
    }

    /// Sorted `(destination, port)` pairs of one router.
    pub fn routes_of(&self, at: RouterId) -> Vec<(RouterId, PortId)> {
        let mut v: Vec<_> = self.next[at].iter().map(|(d, p)| (*d, *p)).collect();
        v.sort();
        v
    }

    /// Shortest paths from every source over the topology graph. A router
    /// takes its parent from the first-discovered router one hop closer to
    /// the source, leaving it on the lowest such port. Each path is written
    /// into the tables of the routers along it.
    fn fill_shortest(&mut self, topo: &Topology) {
        let n = topo.router_count();
        for src in 0..n {
            let (dist, order) = topo.search_from(src);
            let mut parent: Vec<Option<(RouterId, PortId)>> = vec![None; n];
            for &r in &order {
                let Some(d) = dist[r] else {
                    continue;
                };
                for link in topo.links_from(r) {
                    if link.dst != src && parent[link.dst].is_none() && dist[link.dst] == Some(d + 1) {
                        parent[link.dst] = Some((r, link.src_port));
                    }
                }
            }
            for dst in 0..n {
                if dst == src || dist[dst].is_none() {
                    continue;
                }
                let mut path = Vec::new();
                let mut cur = dst;
                while let Some((prev, port)) = parent[cur] {
                    path.push((prev, port));
                    cur = prev;
                }
                for (router, port) in path.into_iter().rev() {
                    self.add_route(router, dst, port);
                }
            }
        }
    }

    fn fill_xy(&mut self, topo: &Topology) -> Result<()> {
        let (_, y) = topo
            .mesh_dims()
            .ok_or_else(|| VpError::config("XY routing needs a mesh topology"))?;
        let n = topo.router_count();
        for at in 0..n {
            for dst in 0..n {
                if at == dst {
                    continue;
                }
                let (ax, ay) = (at / y, at % y);
                let (dx, dy) = (dst / y, dst % y);
                let port = if dx > ax {
                    EAST
                } else if dx < ax {
                    WEST
                } else if dy > ay {
                    SOUTH
                } else {
                    NORTH
                };
                self.add_route(at, dst, port);
            }
        }
        Ok(())
    }

    fn compute_hops(&mut self, topo: &Topology) -> Result<()> {
        let n = topo.router_count();
        for src in 0..n {
            for dst in 0..n {
                self.hops[src][dst] = self.walk(topo, src, dst)?;
            }
        }
        Ok(())
    }

    fn walk(&self, topo: &Topology, src: RouterId, dst: RouterId) -> Result<Option<u32>> {
        let mut cur = src;
        let mut hops = 0u32;
        while cur != dst {
            let Some(port) = self.out_port(cur, dst) else {
                return Ok(None);
            };
            let link = topo.link_at(cur, port).ok_or_else(|| {
                VpError::config(format!("route {}->{} leaves router {} on unlinked port {}", src, dst, cur, port))
            })?;
            cur = link.dst;
            hops += 1;
            if hops as usize > topo.router_count() {
                return Err(VpError::config(format!("routing loop between {} and {}", src, dst)));
            }
        }
        Ok(Some(hops))
    }

    /// Every destination in `dsts` must be reachable from every source in
    /// `srcs`.
    pub fn check_reachability(&self, srcs: &[RouterId], dsts: &[RouterId]) -> Result<()> {
        for &s in srcs {
            for &d in dsts {
                if self.hop_count(s, d).is_none() {
                    return Err(VpError::config(format!("router {} cannot reach router {}", s, d)));
                }
            }
        }
        Ok(())
    }
}
