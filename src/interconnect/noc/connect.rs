//! Topology and routing dumps in CONNECT syntax
//!
//! Two files per NoC, `<name>_topology.txt` and `<name>_routing.txt`. They
//! are for offline inspection and HDL generation, never read back.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::interconnect::noc::memory_map::TargetId;
use crate::interconnect::noc::routing::RoutingTable;
use crate::interconnect::noc::topology::Topology;

/// Endpoints as seen by the dump: send ports inject (initiators), receive
/// ports eject (targets).
pub struct Endpoints<'a> {
    pub send: &'a [TargetId],
    pub recv: &'a [TargetId],
}

pub fn topology_text(topo: &Topology, ep: &Endpoints<'_>) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "num_routers = {}", topo.router_count());
    let _ = writeln!(s, "num_user_send_ports = {}", ep.send.len());
    let _ = writeln!(s, "num_user_recv_ports = {}", ep.recv.len());
    for r in 0..topo.router_count() {
        let _ = writeln!(s, "Router R{} num_ports = {}", r, topo.port_count(r));
    }
    for (k, t) in ep.send.iter().enumerate() {
        let _ = writeln!(s, "SendPort {} -> R{}:{}", k, t.router, t.port);
    }
    for (k, t) in ep.recv.iter().enumerate() {
        let _ = writeln!(s, "RecvPort {} -> R{}:{}", k, t.router, t.port);
    }
    for l in topo.links() {
        let _ = writeln!(s, "RouterLink R{}:{} -> R{}:{}", l.src, l.src_port, l.dst, l.dst_port);
    }
    s
}

/// One line per router and receive port: `R<router>: <recv port> -> <out port>`.
pub fn routing_text(topo: &Topology, routing: &RoutingTable, recv: &[TargetId]) -> String {
    let mut s = String::new();
    for r in 0..topo.router_count() {
        for (k, t) in recv.iter().enumerate() {
            let port = if t.router == r { Some(t.port) } else { routing.out_port(r, t.router) };
            match port {
                Some(p) => {
                    let _ = writeln!(s, "R{}: {} -> {}", r, k, p);
                }
                None => {
                    let _ = writeln!(s, "R{}: {} -> unreachable", r, k);
                }
            }
        }
    }
    s
}

/// Write both files into `dir` and return their paths.
pub fn export(
    dir: &Path,
    name: &str,
    topo: &Topology,
    routing: &RoutingTable,
    ep: &Endpoints<'_>,
) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;
    let topo_path = dir.join(format!("{}_topology.txt", name));
    let routing_path = dir.join(format!("{}_routing.txt", name));
    fs::write(&topo_path, topology_text(topo, ep))?;
    fs::write(&routing_path, routing_text(topo, routing, ep.recv))?;
    tracing::info!("{}: CONNECT files written to {}", name, dir.display());
    Ok((topo_path, routing_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconnect::noc::routing::RoutingAlgorithm;

    #[test]
    fn test_export_mesh() {
        let mut topo = Topology::mesh(2, 2).unwrap();
        let t0 = TargetId { router: 0, port: topo.add_local_port(0).unwrap() };
        let t3 = TargetId { router: 3, port: topo.add_local_port(3).unwrap() };
        let i0 = TargetId { router: 0, port: topo.add_local_port(0).unwrap() };
        let routing = RoutingTable::build(&topo, RoutingAlgorithm::Xy).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoints { send: &[i0], recv: &[t0, t3] };
        let (tp, rp) = export(dir.path(), "noc0", &topo, &routing, &ep).unwrap();

        let topo_txt = fs::read_to_string(tp).unwrap();
        assert!(topo_txt.contains("num_routers = 4"));
        assert!(topo_txt.contains("SendPort 0 -> R0:5"));
        assert!(topo_txt.contains("RecvPort 1 -> R3:4"));
        assert!(topo_txt.contains("RouterLink R0:1 -> R2:3"));

        let routing_txt = fs::read_to_string(rp).unwrap();
        assert!(routing_txt.contains("R0: 0 -> 4"));
        assert!(routing_txt.contains("R0: 1 -> 1"));
        assert!(routing_txt.contains("R3: 1 -> 4"));
    }
}
