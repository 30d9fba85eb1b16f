//! Router graph
//!
//! Routers are nodes of a directed petgraph graph, links are edges tagged
//! with the output port at the source and the input port at the
//! destination. Ports are allocated per router as links are added; local
//! ports (targets and initiators) come after the link ports and are both an
//! input and an output.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VpError};

pub type RouterId = usize;
pub type PortId = usize;

/// Mesh port numbering, clockwise from north.
pub const NORTH: PortId = 0;
pub const EAST: PortId = 1;
pub const SOUTH: PortId = 2;
pub const WEST: PortId = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologySpec {
    Mesh { x: usize, y: usize },
    Ring { n: usize, bidirectional: bool },
    Bus,
}

/// Directed link between two router ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    pub src: RouterId,
    pub src_port: PortId,
    pub dst: RouterId,
    pub dst_port: PortId,
}

pub struct Topology {
    graph: DiGraph<RouterId, (PortId, PortId)>,
    nodes: Vec<NodeIndex>,
    out_ports: Vec<usize>,
    in_ports: Vec<usize>,
    mesh: Option<(usize, usize)>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Topology {
            graph: DiGraph::new(),
            nodes: Vec::new(),
            out_ports: Vec::new(),
            in_ports: Vec::new(),
            mesh: None,
        }
    }

    pub fn from_spec(spec: &TopologySpec) -> Result<Self> {
        match *spec {
            TopologySpec::Mesh { x, y } => Self::mesh(x, y),
            TopologySpec::Ring { n, bidirectional } => Self::ring(n, bidirectional),
            TopologySpec::Bus => {
                let mut t = Topology::new();
                t.add_router(0)?;
                Ok(t)
            }
        }
    }

    /// Routers `0..x*y`; router `(i, j)` has id `i * y + j`.
    pub fn mesh(x: usize, y: usize) -> Result<Self> {
        if x == 0 || y == 0 {
            return Err(VpError::config(format!("empty {}x{} mesh", x, y)));
        }
        let mut t = Topology::new();
        for id in 0..x * y {
            t.add_router(id)?;
        }
        for i in 0..x {
            for j in 0..y {
                let id = i * y + j;
                if j > 0 {
                    t.add_link_ports(id, NORTH, id - 1, SOUTH)?;
                }
                if i + 1 < x {
                    t.add_link_ports(id, EAST, id + y, WEST)?;
                }
                if j + 1 < y {
                    t.add_link_ports(id, SOUTH, id + 1, NORTH)?;
                }
                if i > 0 {
                    t.add_link_ports(id, WEST, id - y, EAST)?;
                }
            }
        }
        for id in 0..x * y {
            t.out_ports[id] = 4;
            t.in_ports[id] = 4;
        }
        t.mesh = Some((x, y));
        Ok(t)
    }

    pub fn ring(n: usize, bidirectional: bool) -> Result<Self> {
        if n == 0 {
            return Err(VpError::config("empty ring"));
        }
        let mut t = Topology::new();
        for id in 0..n {
            t.add_router(id)?;
        }
        if n == 1 {
            return Ok(t);
        }
        for id in 0..n {
            t.add_link(id, (id + 1) % n)?;
        }
        if bidirectional && n > 2 {
            for id in 0..n {
                t.add_link(id, (id + n - 1) % n)?;
            }
        }
        Ok(t)
    }

    /// Routers must be added with consecutive ids.
    pub fn add_router(&mut self, id: RouterId) -> Result<()> {
        if id != self.nodes.len() {
            return Err(VpError::invalid(format!(
                "router {} added out of order (expected {})",
                id,
                self.nodes.len()
            )));
        }
        self.nodes.push(self.graph.add_node(id));
        self.out_ports.push(0);
        self.in_ports.push(0);
        Ok(())
    }

    /// Link `src` to `dst` on freshly allocated ports.
    pub fn add_link(&mut self, src: RouterId, dst: RouterId) -> Result<Link> {
        self.check(src)?;
        self.check(dst)?;
        let link = Link {
            src,
            src_port: self.out_ports[src],
            dst,
            dst_port: self.in_ports[dst],
        };
        self.insert(link);
        Ok(link)
    }

    fn add_link_ports(&mut self, src: RouterId, src_port: PortId, dst: RouterId, dst_port: PortId) -> Result<()> {
        self.check(src)?;
        self.check(dst)?;
        self.insert(Link { src, src_port, dst, dst_port });
        Ok(())
    }

    fn insert(&mut self, link: Link) {
        self.graph.add_edge(self.nodes[link.src], self.nodes[link.dst], (link.src_port, link.dst_port));
        self.out_ports[link.src] = self.out_ports[link.src].max(link.src_port + 1);
        self.in_ports[link.dst] = self.in_ports[link.dst].max(link.dst_port + 1);
    }

    /// Allocate a local port on `router`, usable both ways.
    pub fn add_local_port(&mut self, router: RouterId) -> Result<PortId> {
        self.check(router)?;
        let p = self.out_ports[router].max(self.in_ports[router]);
        self.out_ports[router] = p + 1;
        self.in_ports[router] = p + 1;
        Ok(p)
    }

    fn check(&self, id: RouterId) -> Result<()> {
        if id < self.nodes.len() {
            Ok(())
        } else {
            Err(VpError::invalid(format!("unknown router {}", id)))
        }
    }

    pub fn router_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ports of `router` (inputs and outputs share numbering).
    pub fn port_count(&self, router: RouterId) -> usize {
        self.out_ports[router].max(self.in_ports[router])
    }

    pub fn mesh_dims(&self) -> Option<(usize, usize)> {
        self.mesh
    }

    /// Outgoing links of `router`, by output port.
    pub fn links_from(&self, router: RouterId) -> Vec<Link> {
        let mut out: Vec<Link> = self
            .graph
            .edges_directed(self.nodes[router], Direction::Outgoing)
            .map(|e| {
                let (src_port, dst_port) = *e.weight();
                Link { src: router, src_port, dst: self.graph[e.target()], dst_port }
            })
            .collect();
        out.sort_by_key(|l| l.src_port);
        out
    }

    pub fn links(&self) -> Vec<Link> {
        (0..self.router_count()).flat_map(|r| self.links_from(r)).collect()
    }

    /// Link leaving `router` through `port`, if that port is a link port.
    pub fn link_at(&self, router: RouterId, port: PortId) -> Option<Link> {
        self.links_from(router).into_iter().find(|l| l.src_port == port)
    }

    /// Unit-weight distances from `src`, and the routers in the order a
    /// breadth-first search from `src` discovers them.
    pub fn search_from(&self, src: RouterId) -> (Vec<Option<u32>>, Vec<RouterId>) {
        let start = self.nodes[src];
        let mut dist = vec![None; self.nodes.len()];
        for (node, d) in petgraph::algo::dijkstra(&self.graph, start, None, |_| 1u32) {
            dist[self.graph[node]] = Some(d);
        }
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            order.push(self.graph[node]);
        }
        (dist, order)
    }

    pub fn has_path(&self, src: RouterId, dst: RouterId) -> bool {
        petgraph::algo::has_path_connecting(&self.graph, self.nodes[src], self.nodes[dst], None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_ports_clockwise_from_north() {
        let t = Topology::mesh(2, 2).unwrap();
        // router 0 = (0,0): east to 2, south to 1
        let l0 = t.links_from(0);
        assert_eq!(l0.len(), 2);
        assert_eq!(l0[0], Link { src: 0, src_port: EAST, dst: 2, dst_port: WEST });
        assert_eq!(l0[1], Link { src: 0, src_port: SOUTH, dst: 1, dst_port: NORTH });
        assert_eq!(t.port_count(3), 4);
    }

    #[test]
    fn test_ring_and_local_ports() {
        let mut t = Topology::ring(4, false).unwrap();
        assert_eq!(t.links().len(), 4);
        assert!(t.has_path(3, 2));
        assert_eq!(t.add_local_port(0).unwrap(), 1);
        assert_eq!(t.add_local_port(0).unwrap(), 2);

        let bi = Topology::ring(4, true).unwrap();
        assert_eq!(bi.links().len(), 8);
        let bus = Topology::from_spec(&TopologySpec::Bus).unwrap();
        assert_eq!(bus.router_count(), 1);
        assert!(bus.links().is_empty());
    }
}
