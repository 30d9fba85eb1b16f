//! Simulation time
//!
//! Picosecond resolution over a `u64`, which covers ~213 days of simulated
//! time. Arithmetic saturates instead of wrapping.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VpError;

const PS_PER_NS: u64 = 1_000;
const PS_PER_US: u64 = 1_000_000;
const PS_PER_MS: u64 = 1_000_000_000;
const PS_PER_S: u64 = 1_000_000_000_000;

/// A point in, or a span of, simulated time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_ps(ps: u64) -> Self {
        SimTime(ps)
    }

    pub const fn from_ns(ns: u64) -> Self {
        SimTime(ns.saturating_mul(PS_PER_NS))
    }

    pub const fn from_us(us: u64) -> Self {
        SimTime(us.saturating_mul(PS_PER_US))
    }

    pub const fn from_ms(ms: u64) -> Self {
        SimTime(ms.saturating_mul(PS_PER_MS))
    }

    pub const fn from_secs(s: u64) -> Self {
        SimTime(s.saturating_mul(PS_PER_S))
    }

    pub const fn as_ps(self) -> u64 {
        self.0
    }

    pub const fn as_ns(self) -> u64 {
        self.0 / PS_PER_NS
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_sub(self, rhs: SimTime) -> Option<SimTime> {
        self.0.checked_sub(rhs.0).map(SimTime)
    }

    /// Scale by a real factor, rounding to the nearest picosecond.
    pub fn scale(self, factor: f64) -> SimTime {
        SimTime((self.0 as f64 * factor).round() as u64)
    }

    /// Round up to the next multiple of `step` (identity when already aligned).
    pub fn align_up(self, step: SimTime) -> SimTime {
        if step.0 == 0 {
            return self;
        }
        let rem = self.0 % step.0;
        if rem == 0 {
            self
        } else {
            SimTime(self.0.saturating_add(step.0 - rem))
        }
    }

    /// Next multiple of `step` strictly after `self`.
    pub fn next_boundary(self, step: SimTime) -> SimTime {
        if step.0 == 0 {
            return self;
        }
        SimTime((self.0 / step.0).saturating_add(1).saturating_mul(step.0))
    }

    /// Number of whole `period`s contained in `self`.
    pub fn cycles(self, period: SimTime) -> u64 {
        if period.0 == 0 {
            0
        } else {
            self.0 / period.0
        }
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for SimTime {
    fn sub_assign(&mut self, rhs: SimTime) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Mul<u64> for SimTime {
    type Output = SimTime;

    fn mul(self, rhs: u64) -> SimTime {
        SimTime(self.0.saturating_mul(rhs))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ps = self.0;
        if ps == 0 {
            return write!(f, "0 s");
        }
        let units = [(PS_PER_S, "s"), (PS_PER_MS, "ms"), (PS_PER_US, "us"), (PS_PER_NS, "ns")];
        for (scale, name) in units {
            if ps % scale == 0 {
                return write!(f, "{} {}", ps / scale, name);
            }
        }
        write!(f, "{} ps", ps)
    }
}

impl FromStr for SimTime {
    type Err = VpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '_')
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let value: u64 = num
            .replace('_', "")
            .parse()
            .map_err(|_| VpError::invalid(format!("bad time value '{}'", s)))?;
        let scale = match unit.trim() {
            "ps" => 1,
            "ns" => PS_PER_NS,
            "us" => PS_PER_US,
            "ms" => PS_PER_MS,
            "s" => PS_PER_S,
            other => return Err(VpError::invalid(format!("unknown time unit '{}'", other))),
        };
        value
            .checked_mul(scale)
            .map(SimTime)
            .ok_or_else(|| VpError::overflow(format!("time '{}' does not fit in 64 bits of ps", s)))
    }
}

impl Serialize for SimTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for SimTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            u64::deserialize(deserializer).map(SimTime)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_picks_coarsest_exact_unit() {
        assert_eq!(SimTime::from_ms(1).to_string(), "1 ms");
        assert_eq!(SimTime::from_ns(1500).to_string(), "1500 ns");
        assert_eq!(SimTime::from_ps(7).to_string(), "7 ps");
        assert_eq!(SimTime::ZERO.to_string(), "0 s");
    }

    #[test]
    fn test_parse() {
        assert_eq!("10 ns".parse::<SimTime>().unwrap(), SimTime::from_ns(10));
        assert_eq!("1ms".parse::<SimTime>().unwrap(), SimTime::from_ms(1));
        assert_eq!("1_000 us".parse::<SimTime>().unwrap(), SimTime::from_ms(1));
        assert!("10 parsecs".parse::<SimTime>().is_err());
        assert!("ns".parse::<SimTime>().is_err());
    }

    #[test]
    fn test_boundaries() {
        let q = SimTime::from_us(1);
        assert_eq!(SimTime::ZERO.next_boundary(q), q);
        assert_eq!(q.next_boundary(q), q * 2);
        assert_eq!(SimTime::from_ns(1500).align_up(q), q * 2);
        assert_eq!(q.align_up(q), q);
    }

    #[test]
    fn test_saturating_ops() {
        assert_eq!(SimTime::from_ns(1) - SimTime::from_ns(2), SimTime::ZERO);
        assert_eq!(SimTime::MAX + SimTime::from_ns(1), SimTime::MAX);
    }
}
