//! Analytic NoC timing: hop count and burst length, no contention.

use crate::time::SimTime;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoContentionTiming {
    pub link_bytes: u64,
    pub freq_scaling: f64,
    pub clock: SimTime,
}

impl NoContentionTiming {
    /// Forward and backward header traversal plus the data flits of the
    /// burst: `2 * (hops + 2) + ceil(burst / link_bytes) - 1`, counting at
    /// least one data flit.
    pub fn total_flits(&self, hops: u32, burst: usize) -> u64 {
        let data = (burst as u64).div_ceil(self.link_bytes.max(1)).max(1);
        2 * (hops as u64 + 2) + data - 1
    }

    pub fn cycles(&self, hops: u32, burst: usize) -> u64 {
        let flits = self.total_flits(hops, burst) as f64;
        (flits / self.freq_scaling).ceil() as u64
    }

    /// NoC share of the latency of one transaction.
    pub fn latency(&self, hops: u32, burst: usize) -> SimTime {
        self.clock * self.cycles(hops, burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flit_count() {
        let t = NoContentionTiming { link_bytes: 8, freq_scaling: 1.0, clock: SimTime::from_ns(1) };
        assert_eq!(t.total_flits(0, 8), 4);
        assert_eq!(t.total_flits(3, 8), 10);
        assert_eq!(t.total_flits(3, 64), 17);
        assert_eq!(t.total_flits(1, 0), 6);
        assert_eq!(t.latency(3, 64), SimTime::from_ns(17));

        let half = NoContentionTiming { freq_scaling: 2.0, ..t };
        assert_eq!(half.cycles(3, 64), 9);
    }
}
