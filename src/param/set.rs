//! Address-keyed parameter maps

use std::collections::BTreeMap;
use std::fmt;

use crate::addr::{AddrSpace, SpaceSet};
use crate::error::Result;
use crate::param::value::{BlockingTlm, ParamKind, Parameter};
use crate::time::SimTime;

type Entries = Vec<(AddrSpace, Parameter)>;

/// For every parameter kind, a sorted list of non-overlapping address spaces
/// and the value that applies there. Adjacent entries never hold equal values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterSet {
    kinds: BTreeMap<ParamKind, Entries>,
}

impl ParameterSet {
    pub fn new() -> Self {
        ParameterSet { kinds: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Entries for one kind, in address order.
    pub fn entries(&self, kind: ParamKind) -> &[(AddrSpace, Parameter)] {
        self.kinds.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every `(kind, space, value)` triple.
    pub fn iter(&self) -> impl Iterator<Item = (ParamKind, &AddrSpace, &Parameter)> {
        self.kinds
            .iter()
            .flat_map(|(k, es)| es.iter().map(move |(s, v)| (*k, s, v)))
    }

    /// Overwrite `space` with `value`.
    pub fn set(&mut self, space: AddrSpace, value: Parameter) -> Result<()> {
        value.validate()?;
        self.set_with(space, value, |_, new| Ok(*new))
    }

    /// Write `value` over `space`, combining it with the existing value via
    /// `pick(old, new)`. `old` is `None` where no entry existed.
    ///
    /// On error the set is left untouched.
    pub fn set_with<F>(&mut self, space: AddrSpace, value: Parameter, mut pick: F) -> Result<()>
    where
        F: FnMut(Option<&Parameter>, &Parameter) -> Result<Parameter>,
    {
        let kind = value.kind();
        let old = self.entries(kind);
        let mut out: Entries = Vec::with_capacity(old.len() + 2);
        let mut covered = Vec::new();

        for (s, v) in old {
            match s.intersection(&space) {
                None => out.push((*s, *v)),
                Some(i) => {
                    out.extend(s.relative_complement(&space).into_iter().map(|c| (c, *v)));
                    out.push((i, pick(Some(v), &value)?));
                    covered.push(i);
                }
            }
        }
        let covered: SpaceSet = covered.into_iter().collect();
        for gap in covered.gaps_in(&space) {
            out.push((gap, pick(None, &value)?));
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        defrag(&mut out);
        self.put(kind, out);
        Ok(())
    }

    /// Pointwise `max` with `other` (combining the sets of several successors).
    pub fn merge(&mut self, other: &ParameterSet) -> Result<()> {
        for (_, space, value) in other.iter() {
            self.set_with(*space, *value, |old, new| match old {
                Some(o) => o.merge(new),
                None => Ok(*new),
            })?;
        }
        Ok(())
    }

    /// Stack `own` on top of this set: pointwise sum. The delays of `own`
    /// are first scaled by its traversal rate; rate entries are not carried.
    pub fn add(&mut self, own: &ParameterSet) -> Result<()> {
        for (kind, entries) in &own.kinds {
            match kind {
                ParamKind::ApproximateTraversalRate => continue,
                ParamKind::ApproximateDelay => {
                    for (space, value) in entries {
                        for (piece, scaled) in own.scale_delay(space, value) {
                            self.add_one(piece, scaled)?;
                        }
                    }
                }
                _ => {
                    for (space, value) in entries {
                        self.add_one(*space, *value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn add_one(&mut self, space: AddrSpace, value: Parameter) -> Result<()> {
        self.set_with(space, value, |old, new| match old {
            Some(o) => o.add(new),
            None => Ok(*new),
        })
    }

    /// Split a delay entry along this set's traversal-rate entries.
    fn scale_delay(&self, space: &AddrSpace, value: &Parameter) -> Vec<(AddrSpace, Parameter)> {
        let Parameter::ApproximateDelay(d) = value else {
            return vec![(*space, *value)];
        };
        let mut out = Vec::new();
        let mut scaled = Vec::new();
        for (s, r) in self.entries(ParamKind::ApproximateTraversalRate) {
            if let (Some(i), Parameter::ApproximateTraversalRate(rate)) = (s.intersection(space), r) {
                out.push((i, Parameter::ApproximateDelay(d.scale(*rate))));
                scaled.push(i);
            }
        }
        let scaled: SpaceSet = scaled.into_iter().collect();
        out.extend(scaled.gaps_in(space).into_iter().map(|g| (g, *value)));
        out
    }

    /// Drop every key outside `allowed`.
    pub fn trim(&mut self, allowed: &SpaceSet) {
        let kinds = std::mem::take(&mut self.kinds);
        for (kind, entries) in kinds {
            let mut out: Entries = entries
                .into_iter()
                .flat_map(|(s, v)| allowed.intersect_space(&s).into_iter().map(move |i| (i, v)))
                .collect();
            out.sort_by(|a, b| a.0.cmp(&b.0));
            defrag(&mut out);
            self.put(kind, out);
        }
    }

    /// Rebuild with every key passed through `f`.
    pub fn try_map_spaces<F>(&self, mut f: F) -> Result<ParameterSet>
    where
        F: FnMut(&AddrSpace) -> Result<AddrSpace>,
    {
        let mut out = ParameterSet::new();
        for (kind, entries) in &self.kinds {
            let mut mapped = entries
                .iter()
                .map(|(s, v)| Ok((f(s)?, *v)))
                .collect::<Result<Entries>>()?;
            mapped.sort_by(|a, b| a.0.cmp(&b.0));
            defrag(&mut mapped);
            out.put(*kind, mapped);
        }
        Ok(out)
    }

    /// Value at `addr`, if any entry covers it.
    pub fn get(&self, kind: ParamKind, addr: u64) -> Option<Parameter> {
        let entries = self.entries(kind);
        let idx = entries.partition_point(|(s, _)| s.end() < addr);
        entries.get(idx).filter(|(s, _)| s.contains(addr)).map(|(_, v)| *v)
    }

    pub fn get_or_default(&self, kind: ParamKind, addr: u64) -> Parameter {
        self.get(kind, addr).unwrap_or_else(|| Parameter::default_for(kind))
    }

    /// Most restrictive value over `space`; uncovered parts count as the
    /// default.
    pub fn get_range(&self, kind: ParamKind, space: &AddrSpace) -> Result<Parameter> {
        let mut acc: Option<Parameter> = None;
        let mut covered = Vec::new();
        for (s, v) in self.entries(kind) {
            if let Some(i) = s.intersection(space) {
                covered.push(i);
                acc = Some(match acc {
                    Some(a) => a.max_of(v)?,
                    None => *v,
                });
            }
        }
        let covered: SpaceSet = covered.into_iter().collect();
        let default = Parameter::default_for(kind);
        match acc {
            None => Ok(default),
            Some(a) if !covered.gaps_in(space).is_empty() => a.max_of(&default),
            Some(a) => Ok(a),
        }
    }

    /// True when accesses to `addr` must take the blocking path.
    pub fn blocking_enabled(&self, addr: u64) -> bool {
        !matches!(
            self.get(ParamKind::BlockingTlmEnabled, addr),
            Some(Parameter::BlockingTlmEnabled(BlockingTlm::Disabled))
        )
    }

    /// Approximate delay at `addr` (zero if none).
    pub fn delay(&self, addr: u64) -> SimTime {
        match self.get(ParamKind::ApproximateDelay, addr) {
            Some(Parameter::ApproximateDelay(d)) => d,
            _ => SimTime::ZERO,
        }
    }

    fn put(&mut self, kind: ParamKind, entries: Entries) {
        if entries.is_empty() {
            self.kinds.remove(&kind);
        } else {
            self.kinds.insert(kind, entries);
        }
    }
}

/// Coalesce adjacent entries holding equal values. Input must be sorted.
fn defrag(entries: &mut Entries) {
    let mut out: Entries = Vec::with_capacity(entries.len());
    for (s, v) in entries.drain(..) {
        if let Some((last, lv)) = out.last_mut() {
            if *lv == v && last.is_followed_by(&s) {
                // adjacent and equal, base <= end is preserved
                if let Ok(joined) = AddrSpace::new(last.base(), s.end()) {
                    *last = joined;
                    continue;
                }
            }
        }
        out.push((s, v));
    }
    *entries = out;
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (_, s, v) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{} {}", s, v)?;
        }
        if first {
            write!(f, "{{}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(base: u64, end: u64) -> AddrSpace {
        AddrSpace::new(base, end).unwrap()
    }

    fn ns(n: u64) -> Parameter {
        Parameter::delay(SimTime::from_ns(n))
    }

    #[test]
    fn test_set_splits_and_keeps_outside() {
        let mut ps = ParameterSet::new();
        ps.set(sp(0x0, 0xfff), ns(10)).unwrap();
        ps.set(sp(0x400, 0x7ff), ns(20)).unwrap();
        assert_eq!(
            ps.entries(ParamKind::ApproximateDelay),
            &[(sp(0x0, 0x3ff), ns(10)), (sp(0x400, 0x7ff), ns(20)), (sp(0x800, 0xfff), ns(10))]
        );
        assert_eq!(ps.delay(0x3ff), SimTime::from_ns(10));
        assert_eq!(ps.delay(0x400), SimTime::from_ns(20));
        assert_eq!(ps.delay(0x1000), SimTime::ZERO);
    }

    #[test]
    fn test_defrag_coalesces_equal_neighbours() {
        let mut ps = ParameterSet::new();
        ps.set(sp(0x0, 0xff), Parameter::blocking(false)).unwrap();
        ps.set(sp(0x100, 0x1ff), Parameter::blocking(false)).unwrap();
        assert_eq!(ps.entries(ParamKind::BlockingTlmEnabled), &[(sp(0x0, 0x1ff), Parameter::blocking(false))]);
        ps.set(sp(0x80, 0x17f), Parameter::blocking(true)).unwrap();
        ps.set(sp(0x80, 0x17f), Parameter::blocking(false)).unwrap();
        assert_eq!(ps.entries(ParamKind::BlockingTlmEnabled).len(), 1);
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let mut a = ParameterSet::new();
        a.set(sp(0x0, 0xfff), ns(10)).unwrap();
        a.set(sp(0x0, 0x7ff), Parameter::blocking(false)).unwrap();
        let mut b = ParameterSet::new();
        b.set(sp(0x800, 0x1fff), ns(30)).unwrap();
        b.set(sp(0x0, 0xfff), Parameter::blocking(true)).unwrap();

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.delay(0x100), SimTime::from_ns(10));
        assert_eq!(ab.delay(0x900), SimTime::from_ns(30));
        assert!(ab.blocking_enabled(0x100));

        let mut aa = a.clone();
        aa.merge(&a).unwrap();
        assert_eq!(aa, a);
    }

    #[test]
    fn test_add_scales_own_delay_and_drops_rate() {
        let mut own = ParameterSet::new();
        own.set(sp(0x0, 0xfff), ns(100)).unwrap();
        own.set(sp(0x0, 0x7ff), Parameter::traversal_rate(0.5).unwrap()).unwrap();

        let mut w = ParameterSet::new();
        w.set(sp(0x0, 0xfff), ns(10)).unwrap();
        w.add(&own).unwrap();
        assert_eq!(w.delay(0x10), SimTime::from_ns(60));
        assert_eq!(w.delay(0x900), SimTime::from_ns(110));
        assert!(w.entries(ParamKind::ApproximateTraversalRate).is_empty());

        let before = w.clone();
        w.add(&ParameterSet::new()).unwrap();
        assert_eq!(w, before);
    }

    #[test]
    fn test_trim_restricts_keys() {
        let mut ps = ParameterSet::new();
        ps.set(AddrSpace::MAX, ns(5)).unwrap();
        let allowed: SpaceSet = [sp(0x1000, 0x1fff), sp(0x4000, 0x4fff)].into_iter().collect();
        ps.trim(&allowed);
        assert_eq!(ps.entries(ParamKind::ApproximateDelay).len(), 2);
        assert_eq!(ps.get(ParamKind::ApproximateDelay, 0x2000), None);
        assert_eq!(ps.delay(0x4000), SimTime::from_ns(5));
    }

    #[test]
    fn test_get_range_fills_gaps_with_default() {
        let mut ps = ParameterSet::new();
        ps.set(sp(0x0, 0xff), Parameter::blocking(false)).unwrap();
        let all_dmi = ps.get_range(ParamKind::BlockingTlmEnabled, &sp(0x0, 0xff)).unwrap();
        assert_eq!(all_dmi, Parameter::blocking(false));
        let straddle = ps.get_range(ParamKind::BlockingTlmEnabled, &sp(0x80, 0x1ff)).unwrap();
        assert_eq!(straddle, Parameter::blocking(true));
        ps.set(sp(0x100, 0x1ff), ns(7)).unwrap();
        let d = ps.get_range(ParamKind::ApproximateDelay, &sp(0x0, 0x1ff)).unwrap();
        assert_eq!(d, ns(7));
    }
}
