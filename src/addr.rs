//! Address spaces
//!
//! `AddrSpace` is a closed interval `[base, end]` of the 64-bit physical
//! address space. `SpaceSet` is a normalised union of them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VpError};

/// Closed address interval `[base, end]`. Ordering is lexicographic on
/// `(base, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddrSpace {
    base: u64,
    end: u64,
}

impl AddrSpace {
    /// The whole 64-bit space.
    pub const MAX: AddrSpace = AddrSpace { base: 0, end: u64::MAX };

    pub fn new(base: u64, end: u64) -> Result<Self> {
        if base > end {
            return Err(VpError::invalid(format!(
                "address space base 0x{:x} above end 0x{:x}",
                base, end
            )));
        }
        Ok(AddrSpace { base, end })
    }

    /// `[base, base + size - 1]`.
    pub fn from_size(base: u64, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(VpError::invalid(format!("empty address space at 0x{:x}", base)));
        }
        let end = base.checked_add(size - 1).ok_or_else(|| {
            VpError::overflow(format!("0x{:x} + 0x{:x} wraps the address space", base, size))
        })?;
        Ok(AddrSpace { base, end })
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Number of addresses covered. The full range does not fit in a `u64`.
    pub fn size(&self) -> Result<u64> {
        (self.end - self.base)
            .checked_add(1)
            .ok_or_else(|| VpError::overflow("size of the full 64-bit address space"))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr <= self.end
    }

    pub fn contains_space(&self, other: &AddrSpace) -> bool {
        self.base <= other.base && other.end <= self.end
    }

    pub fn intersects(&self, other: &AddrSpace) -> bool {
        self.base <= other.end && other.base <= self.end
    }

    pub fn intersection(&self, other: &AddrSpace) -> Option<AddrSpace> {
        if !self.intersects(other) {
            return None;
        }
        Some(AddrSpace {
            base: self.base.max(other.base),
            end: self.end.min(other.end),
        })
    }

    /// `self \ other`: at most two disjoint pieces, lower piece first.
    pub fn relative_complement(&self, other: &AddrSpace) -> Vec<AddrSpace> {
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(2);
        if other.base > self.base {
            out.push(AddrSpace { base: self.base, end: other.base - 1 });
        }
        if other.end < self.end {
            out.push(AddrSpace { base: other.end + 1, end: self.end });
        }
        out
    }

    /// True when `other` starts right after `self` ends.
    pub fn is_followed_by(&self, other: &AddrSpace) -> bool {
        self.end != u64::MAX && self.end + 1 == other.base
    }

    /// Shift by `offset` upwards (`up == true`) or downwards.
    pub fn shifted(&self, offset: u64, up: bool) -> Result<AddrSpace> {
        let (base, end) = if up {
            (self.base.checked_add(offset), self.end.checked_add(offset))
        } else {
            (self.base.checked_sub(offset), self.end.checked_sub(offset))
        };
        match (base, end) {
            (Some(base), Some(end)) => Ok(AddrSpace { base, end }),
            _ => Err(VpError::overflow(format!(
                "translating {} by {}0x{:x}",
                self,
                if up { '+' } else { '-' },
                offset
            ))),
        }
    }
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}, 0x{:x}]", self.base, self.end)
    }
}

/// Sorted, coalesced union of address spaces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceSet {
    spaces: Vec<AddrSpace>,
}

impl SpaceSet {
    pub fn new() -> Self {
        SpaceSet { spaces: Vec::new() }
    }

    pub fn full() -> Self {
        SpaceSet { spaces: vec![AddrSpace::MAX] }
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddrSpace> {
        self.spaces.iter()
    }

    pub fn insert(&mut self, space: AddrSpace) {
        self.spaces.push(space);
        self.normalize();
    }

    pub fn union(&mut self, other: &SpaceSet) {
        self.spaces.extend_from_slice(&other.spaces);
        self.normalize();
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.spaces.iter().any(|s| s.contains(addr))
    }

    /// Pieces of `space` covered by this set.
    pub fn intersect_space(&self, space: &AddrSpace) -> Vec<AddrSpace> {
        self.spaces.iter().filter_map(|s| s.intersection(space)).collect()
    }

    /// Pieces of `space` not covered by this set.
    pub fn gaps_in(&self, space: &AddrSpace) -> Vec<AddrSpace> {
        let mut rest = vec![*space];
        for s in &self.spaces {
            rest = rest.iter().flat_map(|r| r.relative_complement(s)).collect();
            if rest.is_empty() {
                break;
            }
        }
        rest
    }

    /// Apply `f` to every space, then renormalise.
    pub fn try_map<F>(&self, mut f: F) -> Result<SpaceSet>
    where
        F: FnMut(&AddrSpace) -> Result<AddrSpace>,
    {
        let spaces = self.spaces.iter().map(|s| f(s)).collect::<Result<Vec<_>>>()?;
        let mut out = SpaceSet { spaces };
        out.normalize();
        Ok(out)
    }

    fn normalize(&mut self) {
        self.spaces.sort();
        let mut merged: Vec<AddrSpace> = Vec::with_capacity(self.spaces.len());
        for s in self.spaces.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.intersects(&s) || last.is_followed_by(&s) {
                    last.end = last.end.max(s.end);
                    continue;
                }
            }
            merged.push(s);
        }
        self.spaces = merged;
    }
}

impl FromIterator<AddrSpace> for SpaceSet {
    fn from_iter<I: IntoIterator<Item = AddrSpace>>(iter: I) -> Self {
        let mut set = SpaceSet { spaces: iter.into_iter().collect() };
        set.normalize();
        set
    }
}
