//! Egress modifiers applied to a module's exported parameters

use serde::{Deserialize, Serialize};

use crate::addr::{AddrSpace, SpaceSet};
use crate::error::Result;
use crate::param::set::ParameterSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sign {
    Plus,
    Minus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modifier {
    /// Shift every address key by `±offset`. A bridge that subtracts
    /// `offset` on the way to its successor exports with `Sign::Plus`.
    AddressTranslator { offset: u64, sign: Sign },
}

impl Modifier {
    pub fn translator(offset: u64, sign: Sign) -> Self {
        Modifier::AddressTranslator { offset, sign }
    }

    fn map_space(&self, space: &AddrSpace) -> Result<AddrSpace> {
        match self {
            Modifier::AddressTranslator { offset, sign } => space.shifted(*offset, *sign == Sign::Plus),
        }
    }

    pub fn apply_params(&self, set: &ParameterSet) -> Result<ParameterSet> {
        set.try_map_spaces(|s| self.map_space(s))
    }

    pub fn apply_spaces(&self, spaces: &SpaceSet) -> Result<SpaceSet> {
        spaces.try_map(|s| self.map_space(s))
    }
}

/// Ordered list of modifiers. Applying an empty chain is the identity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModifierChain {
    modifiers: Vec<Modifier>,
}

impl ModifierChain {
    pub fn new() -> Self {
        ModifierChain { modifiers: Vec::new() }
    }

    pub fn push(&mut self, m: Modifier) {
        self.modifiers.push(m);
    }

    pub fn pop(&mut self) -> Option<Modifier> {
        self.modifiers.pop()
    }

    pub fn len(&self) -> usize {
        self.modifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    pub fn apply_params(&self, set: &ParameterSet) -> Result<ParameterSet> {
        let mut out = set.clone();
        for m in &self.modifiers {
            out = m.apply_params(&out)?;
        }
        Ok(out)
    }

    pub fn apply_spaces(&self, spaces: &SpaceSet) -> Result<SpaceSet> {
        let mut out = spaces.clone();
        for m in &self.modifiers {
            out = m.apply_spaces(&out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VpError;
    use crate::param::value::Parameter;
    use crate::time::SimTime;

    #[test]
    fn test_translator_shifts_keys() {
        let mut ps = ParameterSet::new();
        ps.set(AddrSpace::new(0x0, 0xfff).unwrap(), Parameter::delay(SimTime::from_ns(3))).unwrap();
        let mut chain = ModifierChain::new();
        chain.push(Modifier::translator(0x8000_0000, Sign::Plus));
        let out = chain.apply_params(&ps).unwrap();
        assert_eq!(out.delay(0x8000_0010), SimTime::from_ns(3));
        assert_eq!(out.delay(0x10), SimTime::ZERO);
    }

    #[test]
    fn test_translator_wrap_is_overflow() {
        let spaces: SpaceSet = [AddrSpace::new(0x10, 0x1f).unwrap()].into_iter().collect();
        let m = Modifier::translator(0x20, Sign::Minus);
        assert!(matches!(m.apply_spaces(&spaces), Err(VpError::Overflow(_))));
    }
}
