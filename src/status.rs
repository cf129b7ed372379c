// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{LogicalTime, Lookahead};
use serde::{Deserialize, Serialize};
use std::cmp::max;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Advancing {
    Idle,      // No request outstanding.
    Requested, // Waiting for LBTS to reach `requested`.
    Granted,   // Last request granted; the next request consumes it.
}

/// Time regulation and time constrained are each off, on, or on their way
/// to on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Switch {
    Off,
    Pending,
    On,
}

/// What one federate is known to have promised about the timestamps it may
/// still send. Each federate keeps one of these for itself and a replica
/// for every peer it knows; replicas only ever move forward.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStatus {
    pub current: LogicalTime,
    pub requested: LogicalTime, // Meaningful only while `Requested`.
    pub lookahead: Lookahead,
    pub advancing: Advancing,
    // A bound already announced under a larger lookahead. Shrinking the
    // lookahead cannot take back a promise, so the bound stays at least
    // this until time catches up with it.
    pub floor: LogicalTime,
    // Only regulating federates hold back LBTS; a pending one already does.
    pub regulation: Switch,
    // Only constrained federates wait for LBTS before a grant or delivery.
    pub constraint: Switch,
}

impl TimeStatus {
    pub fn new(lookahead: Lookahead) -> Self {
        TimeStatus {
            current: LogicalTime::ZERO,
            requested: LogicalTime::ZERO,
            lookahead,
            advancing: Advancing::Idle,
            floor: LogicalTime::ZERO,
            regulation: Switch::On,
            constraint: Switch::On,
        }
    }

    pub fn is_regulating(&self) -> bool {
        self.regulation == Switch::On
    }

    pub fn holds_back_lbts(&self) -> bool {
        self.regulation != Switch::Off
    }

    pub fn is_constrained(&self) -> bool {
        self.constraint == Switch::On
    }

    pub fn is_requesting(&self) -> bool {
        self.advancing == Advancing::Requested
    }

    /// Earliest timestamp this federate may still put on an outgoing message.
    pub fn bound(&self) -> LogicalTime {
        let base = if self.is_requesting() {
            self.requested
        } else {
            self.current
        };
        max(base.plus(self.lookahead), self.floor)
    }

    pub fn set_lookahead(&mut self, lookahead: Lookahead) {
        self.floor = self.bound();
        self.lookahead = lookahead;
    }

    /// Fold a (possibly stale) report about the same federate into this
    /// replica. Times only move forward; a report that is behind what we
    /// already know changes nothing. The switches are taken as reported.
    /// Returns true when the bound moved.
    pub fn merge(&mut self, other: &TimeStatus) -> bool {
        let before = self.bound();
        if other.current > self.current {
            self.current = other.current;
            if self.is_requesting() && self.requested <= self.current {
                self.advancing = Advancing::Granted;
            }
        }
        if other.is_requesting()
            && other.requested > self.current
            && other.requested >= self.requested
        {
            self.requested = other.requested;
            self.advancing = Advancing::Requested;
        }
        if other.lookahead != self.lookahead && other.bound() >= self.bound() {
            self.set_lookahead(other.lookahead);
        }
        self.floor = max(self.floor, other.floor);
        self.regulation = other.regulation;
        self.constraint = other.constraint;
        self.bound() > before
    }
}
