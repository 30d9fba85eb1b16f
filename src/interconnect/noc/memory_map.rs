//! Address decoding for the NoC

use std::fmt;

use crate::addr::AddrSpace;
use crate::error::{Result, VpError};
use crate::interconnect::noc::topology::{PortId, RouterId};

/// Endpoint of a target or initiator: a local port of a router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId {
    pub router: RouterId,
    pub port: PortId,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.router, self.port)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    /// Sorted by space.
    entries: Vec<(AddrSpace, TargetId)>,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap::default()
    }

    pub fn insert(&mut self, space: AddrSpace, id: TargetId) {
        let idx = self.entries.partition_point(|(s, _)| *s < space);
        self.entries.insert(idx, (space, id));
    }

    /// Fails on the first pair of overlapping windows.
    pub fn check_memory_map(&self) -> Result<()> {
        for pair in self.entries.windows(2) {
            let ((a, ta), (b, tb)) = (pair[0], pair[1]);
            if a.intersects(&b) {
                return Err(VpError::config(format!(
                    "memory map overlap: {} ({}) and {} ({})",
                    a, ta, b, tb
                )));
            }
        }
        Ok(())
    }

    /// Target owning `addr`. Only meaningful once the map is checked.
    pub fn target_for(&self, addr: u64) -> Option<(TargetId, AddrSpace)> {
        let idx = self.entries.partition_point(|(s, _)| s.end() < addr);
        self.entries
            .get(idx)
            .filter(|(s, _)| s.contains(addr))
            .map(|(s, t)| (*t, *s))
    }

    pub fn entries(&self) -> &[(AddrSpace, TargetId)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sp(base: u64, end: u64) -> AddrSpace {
        AddrSpace::new(base, end).unwrap()
    }

    #[test]
    fn test_overlap_rejected() {
        let mut m = MemoryMap::new();
        m.insert(sp(0x0, 0xfff), TargetId { router: 0, port: 4 });
        m.insert(sp(0x800, 0x1fff), TargetId { router: 1, port: 4 });
        assert!(matches!(m.check_memory_map(), Err(VpError::Configuration(_))));
    }

    #[test]
    fn test_checked_map_resolves_at_most_one_target() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut m = MemoryMap::new();
        let mut base = 0u64;
        for r in 0..16 {
            let size = rng.gen_range(1..0x1000u64);
            m.insert(sp(base, base + size - 1), TargetId { router: r, port: 4 });
            base += size + rng.gen_range(0..0x100u64);
        }
        m.check_memory_map().unwrap();
        for _ in 0..2000 {
            let a = rng.gen_range(0..base + 0x100);
            let owners = m.entries().iter().filter(|(s, _)| s.contains(a)).count();
            assert!(owners <= 1);
            assert_eq!(m.target_for(a).is_some(), owners == 1);
        }
    }
}
