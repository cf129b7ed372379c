// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Violation};
use pergola::{LatticeElt, MaxDef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A point on the federation's logical timeline. Logical time is a finite,
/// non-negative, totally ordered float: NaN, infinities and negative values
/// are rejected at construction, so every `LogicalTime` in the system
/// compares cleanly with every other and survives a JSON round trip.
#[derive(Clone, Copy, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct LogicalTime(f64);

impl LogicalTime {
    pub const ZERO: LogicalTime = LogicalTime(0.0);

    pub fn new(t: f64) -> Result<Self, Error> {
        LogicalTime::try_from(t)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// The earliest time a federate at `self` with lookahead `la` may still
    /// stamp an outgoing message with. Saturates at the largest finite time.
    pub fn plus(self, la: Lookahead) -> LogicalTime {
        LogicalTime((self.0 + la.0).min(f64::MAX))
    }

    /// Returns `self` reduced by `la`, floored at zero.
    pub fn minus(self, la: Lookahead) -> LogicalTime {
        LogicalTime((self.0 - la.0).max(0.0))
    }

    // -0.0 and 0.0 must be the same key for Eq and Hash.
    fn normalized(self) -> f64 {
        if self.0 == 0.0 {
            0.0
        } else {
            self.0
        }
    }
}

impl TryFrom<f64> for LogicalTime {
    type Error = Error;
    fn try_from(t: f64) -> Result<Self, Error> {
        if !t.is_finite() {
            return Err(Violation::InvalidTime(format!("{} is not finite", t)).into());
        }
        if t < 0.0 {
            return Err(Violation::InvalidTime(format!("{} is negative", t)).into());
        }
        Ok(LogicalTime(t))
    }
}

impl From<LogicalTime> for f64 {
    fn from(t: LogicalTime) -> f64 {
        t.0
    }
}

impl PartialEq for LogicalTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LogicalTime {}

impl PartialOrd for LogicalTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().total_cmp(&other.normalized())
    }
}

impl Hash for LogicalTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().to_bits().hash(state)
    }
}

impl fmt::Debug for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The distance past its current time that a federate promises not to
/// send timestamped messages below. Finite and non-negative.
#[derive(Clone, Copy, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Lookahead(f64);

impl Lookahead {
    pub const ZERO: Lookahead = Lookahead(0.0);

    pub fn new(l: f64) -> Result<Self, Error> {
        Lookahead::try_from(l)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Lookahead {
    type Error = Error;
    fn try_from(l: f64) -> Result<Self, Error> {
        if !l.is_finite() || l < 0.0 {
            return Err(Violation::InvalidLookahead(l.to_string()).into());
        }
        Ok(Lookahead(if l == 0.0 { 0.0 } else { l }))
    }
}

impl From<Lookahead> for f64 {
    fn from(l: Lookahead) -> f64 {
        l.0
    }
}

impl PartialEq for Lookahead {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Lookahead {}

impl PartialOrd for Lookahead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lookahead {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Lookahead {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state)
    }
}

impl fmt::Debug for Lookahead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "la{}", self.0)
    }
}

impl fmt::Display for Lookahead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Zero, the default, is the least time.
impl pergola::MaxUnitDefault for LogicalTime {}

/// The local view of federation LBTS only ever moves up, so it is kept as a
/// max-lattice and every recomputation is joined into it.
pub type LbtsLD = MaxDef<LogicalTime>;
pub type LbtsLE = LatticeElt<LbtsLD>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_non_finite_and_negative() {
        assert!(LogicalTime::new(f64::NAN).is_err());
        assert!(LogicalTime::new(-1.0).is_err());
        assert!(LogicalTime::new(f64::INFINITY).is_err());
        assert!(LogicalTime::new(f64::NEG_INFINITY).is_err());
        assert!(LogicalTime::new(f64::MAX).is_ok());
        assert!(Lookahead::new(f64::INFINITY).is_err());
        assert!(Lookahead::new(-0.5).is_err());
    }

    #[test]
    fn negative_zero_is_zero() {
        let a = LogicalTime::new(-0.0).unwrap();
        assert_eq!(a, LogicalTime::ZERO);
        assert!(!(a < LogicalTime::ZERO));
    }

    #[test]
    fn lbts_lattice_keeps_maximum() {
        let lo = LbtsLE::new_from(LogicalTime::new(3.0).unwrap());
        let hi = LbtsLE::new_from(LogicalTime::new(5.0).unwrap());
        let joined = &hi + &lo;
        assert_eq!(joined.value, LogicalTime::new(5.0).unwrap());
        assert!(lo <= hi);
        let from_default = LbtsLE::default() + &lo;
        assert_eq!(from_default.value, LogicalTime::new(3.0).unwrap());
        let converted: LbtsLE = LogicalTime::new(1.0).unwrap().into();
        assert!(converted < lo);
    }

    #[test]
    fn serde_rejects_negative_time() {
        assert!(serde_json::from_str::<LogicalTime>("-2.0").is_err());
        let t: LogicalTime = serde_json::from_str("2.5").unwrap();
        assert_eq!(t.value(), 2.5);
    }

    #[test]
    fn plus_stays_finite() {
        let top = LogicalTime::new(f64::MAX).unwrap();
        let later = top.plus(Lookahead::new(f64::MAX).unwrap());
        assert_eq!(later, top);
        let text = serde_json::to_string(&later).unwrap();
        assert_eq!(serde_json::from_str::<LogicalTime>(&text).unwrap(), top);
    }
}
