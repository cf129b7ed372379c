// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Inbound messages waiting to be dispatched.
//!
//! Receive-order messages are kept in arrival order, which keeps every
//! sender's messages in the order it sent them. Timestamped messages wait
//! in a heap until LBTS says nothing earlier can still arrive. A federate
//! that is not time-constrained takes them as they come.

use crate::{FederateHandle, FederateState, LogicalTime, Message, MessageKind};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use tracing::warn;

struct Stamped {
    timestamp: LogicalTime,
    // Our own grant sorts after everything else at the same time.
    rank: u8,
    seq: u64,
    message: Message,
}

impl Stamped {
    fn key(&self) -> (LogicalTime, u8, u64) {
        (self.timestamp, self.rank, self.seq)
    }
}

impl PartialEq for Stamped {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Stamped {}

impl PartialOrd for Stamped {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamped {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
pub struct InboundQueue {
    receive_order: VecDeque<Message>,
    time_order: BinaryHeap<Reverse<Stamped>>,
    seq: u64,
    warning_threshold: usize,
    warned: bool,
}

fn is_own_grant(local: FederateHandle, m: &Message) -> bool {
    m.kind() == MessageKind::TimeAdvanceGrant && m.target == Some(local)
}

impl InboundQueue {
    pub fn new(warning_threshold: usize) -> Self {
        InboundQueue {
            warning_threshold,
            ..InboundQueue::default()
        }
    }

    pub fn len(&self) -> usize {
        self.receive_order.len() + self.time_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of timestamped messages still held back.
    pub fn pending_time_ordered(&self) -> usize {
        self.time_order.len()
    }

    /// The earliest held-back timestamp, if any.
    pub fn next_timestamp(&self) -> Option<LogicalTime> {
        self.time_order.peek().map(|Reverse(s)| s.timestamp)
    }

    pub fn push(&mut self, state: &FederateState, message: Message) {
        let own_grant = is_own_grant(state.handle, &message);
        let constrained = state.time_status().is_constrained();
        match message.timestamp {
            Some(_) if !constrained && !own_grant => self.receive_order.push_back(message),
            Some(ts) if ts < state.current_time() && !own_grant => {
                warn!(
                    "federate {} got {} below its granted time {}",
                    state.handle,
                    message,
                    state.current_time()
                );
                self.receive_order.push_back(message);
            }
            Some(timestamp) => {
                self.seq += 1;
                self.time_order.push(Reverse(Stamped {
                    timestamp,
                    rank: if own_grant { 1 } else { 0 },
                    seq: self.seq,
                    message,
                }));
            }
            None => self.receive_order.push_back(message),
        }
        let depth = self.len();
        if depth > self.warning_threshold {
            if !self.warned {
                warn!(
                    "federate {} inbound queue depth {} above {}",
                    state.handle, depth, self.warning_threshold
                );
                self.warned = true;
            }
        } else {
            self.warned = false;
        }
    }

    fn releasable(&self, state: &FederateState) -> bool {
        match self.next_timestamp() {
            None => false,
            Some(_) if !state.time_status().is_constrained() => true,
            Some(ts) => {
                let limit = if state.time_status().is_requesting() {
                    state.time_status().requested
                } else {
                    state.current_time()
                };
                ts <= state.lbts() && ts <= limit
            }
        }
    }

    /// The next message that may be dispatched now: receive-order first,
    /// then any timestamped message that became safe.
    pub fn pop(&mut self, state: &FederateState) -> Option<Message> {
        if let Some(m) = self.receive_order.pop_front() {
            return Some(m);
        }
        if self.releasable(state) {
            return self.time_order.pop().map(|Reverse(s)| s.message);
        }
        None
    }

    /// Everything still queued, in the order it would have been released.
    pub fn drain_all(&mut self) -> Vec<Message> {
        let mut out: Vec<Message> = self.receive_order.drain(..).collect();
        let mut held: Vec<Stamped> = self.time_order.drain().map(|Reverse(s)| s).collect();
        held.sort();
        out.extend(held.into_iter().map(|s| s.message));
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Advancing, LbtsLE, Lookahead, Payload};

    const A: FederateHandle = FederateHandle(1);
    const B: FederateHandle = FederateHandle(2);

    fn t(v: f64) -> LogicalTime {
        LogicalTime::new(v).unwrap()
    }

    fn state(current: f64, lbts: f64) -> FederateState {
        let mut st = FederateState::new(A, "a", Lookahead::ZERO);
        st.time.current = t(current);
        st.lbts = LbtsLE::new_from(t(lbts));
        st
    }

    fn stamped(v: f64) -> Message {
        Message::new(B, Payload::FederationLbts { lbts: t(v) }).at(Some(t(v)))
    }

    fn plain() -> Message {
        Message::new(B, Payload::ResignFederation { action: 4 })
    }

    #[test]
    fn receive_order_first_then_safe_timestamps() {
        let mut q = InboundQueue::new(100);
        let mut st = state(5.0, 10.0);
        st.time.requested = t(8.0);
        st.time.advancing = Advancing::Requested;
        q.push(&st, stamped(7.0));
        q.push(&st, stamped(6.0));
        q.push(&st, stamped(9.0));
        q.push(&st, plain());
        assert_eq!(q.pop(&st).map(|m| m.timestamp), Some(None));
        assert_eq!(q.pop(&st).and_then(|m| m.timestamp), Some(t(6.0)));
        assert_eq!(q.pop(&st).and_then(|m| m.timestamp), Some(t(7.0)));
        // 9.0 is past the requested time.
        assert!(q.pop(&st).is_none());
        assert_eq!(q.pending_time_ordered(), 1);
    }

    #[test]
    fn own_grant_sorts_last_at_its_time() {
        let mut q = InboundQueue::new(100);
        let st = {
            let mut s = state(4.0, 10.0);
            s.time.requested = t(6.0);
            s.time.advancing = Advancing::Requested;
            s
        };
        let grant = Message::new(A, Payload::TimeAdvanceGrant { time: t(6.0) })
            .at(Some(t(6.0)))
            .to(A);
        q.push(&st, grant);
        q.push(&st, stamped(6.0));
        assert_eq!(q.pop(&st).map(|m| m.kind()), Some(MessageKind::FederationLbts));
        assert_eq!(q.pop(&st).map(|m| m.kind()), Some(MessageKind::TimeAdvanceGrant));
    }

    #[test]
    fn late_timestamp_goes_straight_through() {
        let mut q = InboundQueue::new(100);
        let st = state(5.0, 5.0);
        q.push(&st, stamped(2.0));
        assert_eq!(q.pending_time_ordered(), 0);
        assert!(q.pop(&st).is_some());
    }

    #[test]
    fn held_until_lbts_moves() {
        let mut q = InboundQueue::new(1);
        let mut st = state(3.0, 3.0);
        q.push(&st, stamped(4.0));
        q.push(&st, stamped(3.5));
        assert!(q.pop(&st).is_none());
        st.lbts = LbtsLE::new_from(t(4.0));
        st.time.current = t(4.0);
        let order: Vec<_> = std::iter::from_fn(|| q.pop(&st)).map(|m| m.timestamp).collect();
        assert_eq!(order, vec![Some(t(3.5)), Some(t(4.0))]);
        assert!(q.is_empty());
    }

    #[test]
    fn unconstrained_takes_timestamps_as_they_come() {
        let mut q = InboundQueue::new(100);
        let mut st = state(5.0, 5.0);
        q.push(&st, stamped(9.0));
        assert_eq!(q.pending_time_ordered(), 1);
        st.time.constraint = crate::Switch::Off;
        q.push(&st, stamped(8.0));
        q.push(&st, stamped(2.0));
        let order: Vec<_> = std::iter::from_fn(|| q.pop(&st)).map(|m| m.timestamp).collect();
        assert_eq!(order, vec![Some(t(8.0)), Some(t(2.0)), Some(t(9.0))]);
    }
}
