//! Parameter values carried along the fabric graph

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VpError};
use crate::time::SimTime;

/// Discriminant of a [`Parameter`]; a `ParameterSet` keeps one address map
/// per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    BlockingTlmEnabled,
    ApproximateDelay,
    ApproximateTraversalRate,
}

/// Whether accesses must take the timed blocking path.
///
/// `Disabled < Enabled`: enabled is the more restrictive value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingTlm {
    Disabled,
    Enabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// DISABLED lets the DMI fast path serve the access.
    BlockingTlmEnabled(BlockingTlm),
    /// Delay accrued by a blocking access.
    ApproximateDelay(SimTime),
    /// Fraction of a module's own delay that applies (0..=1). Local only.
    ApproximateTraversalRate(f64),
}

impl Parameter {
    pub fn kind(&self) -> ParamKind {
        match self {
            Parameter::BlockingTlmEnabled(_) => ParamKind::BlockingTlmEnabled,
            Parameter::ApproximateDelay(_) => ParamKind::ApproximateDelay,
            Parameter::ApproximateTraversalRate(_) => ParamKind::ApproximateTraversalRate,
        }
    }

    pub fn default_for(kind: ParamKind) -> Parameter {
        match kind {
            ParamKind::BlockingTlmEnabled => Parameter::BlockingTlmEnabled(BlockingTlm::Enabled),
            ParamKind::ApproximateDelay => Parameter::ApproximateDelay(SimTime::ZERO),
            ParamKind::ApproximateTraversalRate => Parameter::ApproximateTraversalRate(1.0),
        }
    }

    pub fn blocking(enabled: bool) -> Parameter {
        Parameter::BlockingTlmEnabled(if enabled { BlockingTlm::Enabled } else { BlockingTlm::Disabled })
    }

    pub fn delay(d: SimTime) -> Parameter {
        Parameter::ApproximateDelay(d)
    }

    /// Traversal rate, rejected outside `[0, 1]`.
    pub fn traversal_rate(rate: f64) -> Result<Parameter> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(VpError::invalid(format!("traversal rate {} outside [0, 1]", rate)));
        }
        Ok(Parameter::ApproximateTraversalRate(rate))
    }

    /// Check that the value is in its domain.
    pub fn validate(&self) -> Result<()> {
        if let Parameter::ApproximateTraversalRate(r) = self {
            Parameter::traversal_rate(*r)?;
        }
        Ok(())
    }

    /// Combine the values exported by two successors at one port: the more
    /// restrictive value wins.
    pub fn merge(&self, other: &Parameter) -> Result<Parameter> {
        match (self, other) {
            (Parameter::BlockingTlmEnabled(a), Parameter::BlockingTlmEnabled(b)) => {
                Ok(Parameter::BlockingTlmEnabled((*a).max(*b)))
            }
            (Parameter::ApproximateDelay(a), Parameter::ApproximateDelay(b)) => {
                Ok(Parameter::ApproximateDelay((*a).max(*b)))
            }
            (Parameter::ApproximateTraversalRate(_), _) | (_, Parameter::ApproximateTraversalRate(_)) => {
                Err(VpError::invalid("traversal rate does not merge"))
            }
            (a, b) => Err(mismatch(a, b)),
        }
    }

    /// Stack a module's own value on top of the propagated one.
    pub fn add(&self, other: &Parameter) -> Result<Parameter> {
        match (self, other) {
            (Parameter::BlockingTlmEnabled(a), Parameter::BlockingTlmEnabled(b)) => {
                Ok(Parameter::BlockingTlmEnabled((*a).max(*b)))
            }
            (Parameter::ApproximateDelay(a), Parameter::ApproximateDelay(b)) => {
                Ok(Parameter::ApproximateDelay(*a + *b))
            }
            (Parameter::ApproximateTraversalRate(_), _) | (_, Parameter::ApproximateTraversalRate(_)) => {
                Err(VpError::invalid("traversal rate does not add"))
            }
            (a, b) => Err(mismatch(a, b)),
        }
    }

    /// Larger of two values of the same kind, used by range queries.
    pub fn max_of(&self, other: &Parameter) -> Result<Parameter> {
        match (self, other) {
            (Parameter::ApproximateTraversalRate(a), Parameter::ApproximateTraversalRate(b)) => {
                Ok(Parameter::ApproximateTraversalRate(a.max(*b)))
            }
            _ => self.merge(other),
        }
    }
}

fn mismatch(a: &Parameter, b: &Parameter) -> VpError {
    VpError::invalid(format!("parameter kind mismatch: {:?} vs {:?}", a.kind(), b.kind()))
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::BlockingTlmEnabled(BlockingTlm::Enabled) => write!(f, "blocking=ENABLED"),
            Parameter::BlockingTlmEnabled(BlockingTlm::Disabled) => write!(f, "blocking=DISABLED"),
            Parameter::ApproximateDelay(d) => write!(f, "delay={}", d),
            Parameter::ApproximateTraversalRate(r) => write!(f, "rate={}", r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_is_max() {
        let en = Parameter::blocking(true);
        let dis = Parameter::blocking(false);
        assert_eq!(en.merge(&dis).unwrap(), en);
        assert_eq!(dis.add(&dis).unwrap(), dis);
    }

    #[test]
    fn test_delay_merge_keeps_worst_and_add_sums() {
        let a = Parameter::delay(SimTime::from_ns(10));
        let b = Parameter::delay(SimTime::from_ns(4));
        assert_eq!(a.merge(&b).unwrap(), a);
        assert_eq!(b.merge(&a).unwrap(), a);
        assert_eq!(a.add(&b).unwrap(), Parameter::delay(SimTime::from_ns(14)));
    }

    #[test]
    fn test_rate_never_combines() {
        let r = Parameter::traversal_rate(0.5).unwrap();
        assert!(r.merge(&r).is_err());
        assert!(r.add(&r).is_err());
        assert!(Parameter::traversal_rate(1.5).is_err());
        assert!(Parameter::blocking(true).merge(&Parameter::delay(SimTime::ZERO)).is_err());
    }
}
