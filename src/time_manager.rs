// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Time advance under the lower-bound-timestamp rule.
//!
//! Every federate keeps its own `TimeStatus` and a replica of each peer's.
//! The local LBTS is the least bound among itself and every regulating
//! peer, joined into a max-lattice so it never moves backwards. A
//! constrained federate's own pending request is granted the moment its
//! requested time is at or below that LBTS; an unconstrained one is
//! granted at once. Nobody decides grants for anybody else. Peers learn of
//! the grant from the `TimeAdvanceGrant` the granted federate broadcasts.
//!
//! Turning regulation on is a handshake. Every peer starts counting the
//! federate at once, holding it to the peer's own LBTS as a floor, and
//! reports that floor back; the federate is regulating once it has heard
//! from everyone, with its time moved up to honour the highest floor.

use crate::{
    Advancing, Callback, FederateHandle, FederateState, LbtsLE, LogicalTime, MessageContext,
    MessageKind, Payload, Result, ServiceHandler, Side, Switch, Verdict, Violation,
};
use crate::pipeline::Handler;
use std::cmp::max;
use tracing::{debug, trace};

/// The least bound over every regulating peer and ourselves.
pub fn computed_lbts(state: &FederateState) -> LogicalTime {
    state
        .peers
        .values()
        .filter(|p| p.status.holds_back_lbts())
        .map(|p| p.status.bound())
        .fold(state.time.bound(), std::cmp::min)
}

/// Recompute LBTS after any time status changed and fire our own grant if
/// it became safe.
pub(crate) fn refresh(state: &mut FederateState, ctx: &mut MessageContext) {
    let before = state.lbts.value;
    let lbts = state.lbts.clone() + &LbtsLE::new_from(computed_lbts(state));
    state.lbts = lbts;
    if state.lbts.value > before {
        trace!("federate {} lbts advanced to {}", state.handle, state.lbts.value);
        let m = state.message(Payload::FederationLbts {
            lbts: state.lbts.value,
        });
        ctx.loopback(m);
    }
    if state.time.constraint == Switch::Pending && state.time.current <= state.lbts.value {
        enable_constrained(state, ctx);
    }
    try_grant(state, ctx);
}

fn try_grant(state: &mut FederateState, ctx: &mut MessageContext) {
    if !state.time.is_requesting() || !state.join_complete() {
        return;
    }
    let t = state.time.requested;
    if state.time.is_constrained() && t > state.lbts.value {
        trace!(
            "federate {} holding request for {} at lbts {}",
            state.handle,
            t,
            state.lbts.value
        );
        return;
    }
    state.time.current = t;
    state.time.advancing = Advancing::Granted;
    debug!("federate {} granted advance to {}", state.handle, t);
    let grant = state.message(Payload::TimeAdvanceGrant { time: t });
    ctx.broadcast(grant.clone());
    // Our own copy goes through the time-ordered queue so it is delivered
    // after every message stamped at or below `t`.
    ctx.loopback(grant.to(state.handle).at(Some(t)));
}

pub(crate) fn request_advance(state: &mut FederateState, target: LogicalTime) -> Result<()> {
    state.require_joined()?;
    if state.time.is_requesting() {
        return Err(Violation::AdvancePending.into());
    }
    if state.time.regulation == Switch::Pending {
        return Err(Violation::RegulationPending.into());
    }
    if state.time.constraint == Switch::Pending {
        return Err(Violation::ConstraintPending.into());
    }
    if target < state.time.current {
        return Err(Violation::AdvanceIntoPast {
            requested: target,
            current: state.time.current,
        }
        .into());
    }
    state.time.requested = target;
    state.time.advancing = Advancing::Requested;
    debug!("federate {} requested advance to {}", state.handle, target);
    Ok(())
}

/// The timestamp an outgoing message actually carries. A federate that is
/// not regulating sends everything in receive order.
pub(crate) fn send_time(
    state: &FederateState,
    timestamp: Option<LogicalTime>,
) -> Result<Option<LogicalTime>> {
    let ts = match timestamp {
        None => return Ok(None),
        Some(ts) => ts,
    };
    if !state.time.is_regulating() {
        trace!("federate {} not regulating, sending {} in receive order", state.handle, ts);
        return Ok(None);
    }
    if !state.join_complete() {
        return Err(Violation::JoinInProgress.into());
    }
    let bound = state.time.bound();
    if ts < bound {
        return Err(Violation::TimestampBelowBound {
            timestamp: ts,
            bound,
        }
        .into());
    }
    Ok(Some(ts))
}

fn complete_regulation(state: &mut FederateState, ctx: &mut MessageContext) {
    let la = state.time.lookahead;
    state.time.floor = max(state.time.floor, state.regulation_floor);
    state.time.current = max(state.time.current, state.time.floor.minus(la));
    state.time.regulation = Switch::On;
    debug!("federate {} regulating at {}", state.handle, state.time.current);
    ctx.callback(Callback::TimeRegulationEnabled {
        time: state.time.current,
    });
}

fn enable_constrained(state: &mut FederateState, ctx: &mut MessageContext) {
    state.time.constraint = Switch::On;
    debug!("federate {} constrained at {}", state.handle, state.time.current);
    ctx.callback(Callback::TimeConstrainedEnabled {
        time: state.time.current,
    });
}

/// After a peer leaves it has no floor left to report.
pub(crate) fn forget_peer(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    federate: FederateHandle,
) {
    if state.regulation_awaiting.remove(&federate).is_some()
        && state.regulation_awaiting.is_empty()
        && state.time.regulation == Switch::Pending
    {
        complete_regulation(state, ctx);
    }
}

fn on_request(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::TimeAdvanceRequest { time } = ctx.request.payload {
        request_advance(state, time)?;
        let m = state.message(Payload::TimeAdvanceRequest { time });
        ctx.broadcast(m);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_peer_request(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::TimeAdvanceRequest { time } = ctx.request.payload {
        let peer = state
            .peers
            .get_mut(&from)
            .ok_or(Violation::UnknownFederate(from))?;
        let r = &mut peer.status;
        if time >= r.current && (!r.is_requesting() || time >= r.requested) {
            r.requested = time;
            r.advancing = Advancing::Requested;
        }
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_grant(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if ctx.request.target != Some(state.handle) {
        return Ok(Verdict::Vetoed("grant addressed to another federate"));
    }
    if let Payload::TimeAdvanceGrant { time } = ctx.request.payload {
        if state.time.advancing == Advancing::Granted && state.time.current == time {
            ctx.callback(Callback::TimeAdvanceGranted { time });
        } else {
            trace!(
                "federate {} ignoring stale grant for {} from {}",
                state.handle,
                time,
                ctx.source()
            );
        }
    }
    Ok(Verdict::Handled)
}

fn on_peer_grant(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let granted = ctx.request.target.unwrap_or(ctx.request.source);
    if granted == state.handle {
        return Ok(Verdict::Vetoed("grant addressed to us"));
    }
    if let Payload::TimeAdvanceGrant { time } = ctx.request.payload {
        let peer = state
            .peers
            .get_mut(&granted)
            .ok_or(Violation::UnknownFederate(granted))?;
        let r = &mut peer.status;
        if time > r.current {
            r.current = time;
        }
        if r.is_requesting() && r.requested <= r.current {
            r.advancing = Advancing::Granted;
        }
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_lookahead(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::ModifyLookahead { lookahead } = ctx.request.payload {
        state.require_joined()?;
        state.time.set_lookahead(lookahead);
        debug!("federate {} lookahead now {}", state.handle, lookahead);
        let m = state.message(Payload::ModifyLookahead { lookahead });
        ctx.broadcast(m);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_peer_lookahead(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::ModifyLookahead { lookahead } = ctx.request.payload {
        let peer = state
            .peers
            .get_mut(&from)
            .ok_or(Violation::UnknownFederate(from))?;
        peer.status.set_lookahead(lookahead);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_enable_regulation(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::EnableTimeRegulation { lookahead } = ctx.request.payload {
        if !state.join_complete() {
            return Err(Violation::JoinInProgress.into());
        }
        match state.time.regulation {
            Switch::On => return Err(Violation::RegulationAlreadyEnabled.into()),
            Switch::Pending => return Err(Violation::RegulationPending.into()),
            Switch::Off => (),
        }
        if state.time.is_requesting() {
            return Err(Violation::AdvancePending.into());
        }
        state.time.lookahead = lookahead;
        state.time.regulation = Switch::Pending;
        state.regulation_awaiting = state.peers.keys().cloned().collect();
        state.regulation_floor = LogicalTime::ZERO;
        debug!(
            "federate {} enabling regulation with lookahead {}, awaiting {} floors",
            state.handle,
            lookahead,
            state.regulation_awaiting.len()
        );
        let m = state.message(Payload::EnableTimeRegulation { lookahead });
        ctx.broadcast(m);
        if state.regulation_awaiting.is_empty() {
            complete_regulation(state, ctx);
        }
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_peer_enable_regulation(
    ctx: &mut MessageContext,
    state: &mut FederateState,
) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::EnableTimeRegulation { lookahead } = ctx.request.payload {
        let floor = state.lbts();
        let peer = state
            .peers
            .get_mut(&from)
            .ok_or(Violation::UnknownFederate(from))?;
        let r = &mut peer.status;
        r.lookahead = lookahead;
        r.floor = max(r.floor, floor);
        r.regulation = Switch::On;
        trace!("federate {} holds {} to floor {}", state.handle, from, floor);
        let m = state.message(Payload::RegulationFloor { floor });
        ctx.unicast(from, m);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_regulation_floor(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::RegulationFloor { floor } = ctx.request.payload {
        if state.time.regulation != Switch::Pending
            || state.regulation_awaiting.remove(&from).is_none()
        {
            trace!("federate {} ignoring stale floor from {}", state.handle, from);
            return Ok(Verdict::Handled);
        }
        state.regulation_floor = max(state.regulation_floor, floor);
        if state.regulation_awaiting.is_empty() {
            complete_regulation(state, ctx);
            refresh(state, ctx);
        }
    }
    Ok(Verdict::Handled)
}

fn on_disable_regulation(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::DisableTimeRegulation = ctx.request.payload {
        match state.time.regulation {
            Switch::Off => return Err(Violation::RegulationNotEnabled.into()),
            Switch::Pending => return Err(Violation::RegulationPending.into()),
            Switch::On => (),
        }
        state.time.regulation = Switch::Off;
        debug!("federate {} no longer regulating", state.handle);
        let m = state.message(Payload::DisableTimeRegulation);
        ctx.broadcast(m);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_peer_disable_regulation(
    ctx: &mut MessageContext,
    state: &mut FederateState,
) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::DisableTimeRegulation = ctx.request.payload {
        let peer = state
            .peers
            .get_mut(&from)
            .ok_or(Violation::UnknownFederate(from))?;
        peer.status.regulation = Switch::Off;
        trace!("federate {} stops counting {}", state.handle, from);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_enable_constrained(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::EnableTimeConstrained = ctx.request.payload {
        state.require_joined()?;
        match state.time.constraint {
            Switch::On => return Err(Violation::ConstraintAlreadyEnabled.into()),
            Switch::Pending => return Err(Violation::ConstraintPending.into()),
            Switch::Off => (),
        }
        if state.time.is_requesting() {
            return Err(Violation::AdvancePending.into());
        }
        // Nothing below our time may still be on its way once we are
        // constrained, so wait for LBTS to catch up.
        state.time.constraint = Switch::Pending;
        trace!("federate {} waiting for lbts to reach {}", state.handle, state.time.current);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_disable_constrained(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::DisableTimeConstrained = ctx.request.payload {
        match state.time.constraint {
            Switch::Off => return Err(Violation::ConstraintNotEnabled.into()),
            Switch::Pending => return Err(Violation::ConstraintPending.into()),
            Switch::On => (),
        }
        state.time.constraint = Switch::Off;
        debug!("federate {} no longer constrained", state.handle);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_lbts(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::FederationLbts { lbts } = ctx.request.payload {
        trace!("federate {} observed lbts {}", state.handle, lbts);
    }
    Ok(Verdict::Handled)
}

pub(crate) fn handlers() -> Vec<Box<dyn Handler>> {
    use MessageKind::*;
    vec![
        ServiceHandler::new("time.request", TimeAdvanceRequest, Side::Outgoing, on_request),
        ServiceHandler::new(
            "time.request.peer",
            TimeAdvanceRequest,
            Side::Incoming,
            on_peer_request,
        ),
        ServiceHandler::new("time.grant", TimeAdvanceGrant, Side::Either, on_grant),
        ServiceHandler::new("time.grant.peer", TimeAdvanceGrant, Side::Either, on_peer_grant),
        ServiceHandler::new("time.lookahead", ModifyLookahead, Side::Outgoing, on_lookahead),
        ServiceHandler::new(
            "time.lookahead.peer",
            ModifyLookahead,
            Side::Incoming,
            on_peer_lookahead,
        ),
        ServiceHandler::new("time.lbts", FederationLbts, Side::Outgoing, on_lbts),
        ServiceHandler::new(
            "time.regulation.enable",
            EnableTimeRegulation,
            Side::Outgoing,
            on_enable_regulation,
        ),
        ServiceHandler::new(
            "time.regulation.enable.peer",
            EnableTimeRegulation,
            Side::Incoming,
            on_peer_enable_regulation,
        ),
        ServiceHandler::new(
            "time.regulation.floor",
            RegulationFloor,
            Side::Incoming,
            on_regulation_floor,
        ),
        ServiceHandler::new(
            "time.regulation.disable",
            DisableTimeRegulation,
            Side::Outgoing,
            on_disable_regulation,
        ),
        ServiceHandler::new(
            "time.regulation.disable.peer",
            DisableTimeRegulation,
            Side::Incoming,
            on_peer_disable_regulation,
        ),
        ServiceHandler::new(
            "time.constrained.enable",
            EnableTimeConstrained,
            Side::Outgoing,
            on_enable_constrained,
        ),
        ServiceHandler::new(
            "time.constrained.disable",
            DisableTimeConstrained,
            Side::Outgoing,
            on_disable_constrained,
        ),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Destination, Error, FederateHandle, HandlerRegistry, Lookahead, Message, PeerRecord,
        TimeStatus,
    };
    use proptest::prelude::*;

    fn t(v: f64) -> LogicalTime {
        LogicalTime::new(v).unwrap()
    }

    fn la(v: f64) -> Lookahead {
        Lookahead::new(v).unwrap()
    }

    const A: FederateHandle = FederateHandle(1);
    const B: FederateHandle = FederateHandle(2);

    // A at 5.0 with lookahead 1.0, B at 4.0 with lookahead 2.0.
    fn two_federates() -> FederateState {
        let mut st = FederateState::new(A, "a", la(1.0));
        st.joined = true;
        st.time.current = t(5.0);
        let mut b = TimeStatus::new(la(2.0));
        b.current = t(4.0);
        st.peers.insert(
            B,
            PeerRecord {
                name: Some("b".into()),
                status: b,
            },
        );
        st.lbts = LbtsLE::new_from(computed_lbts(&st));
        st
    }

    fn tar(from: FederateHandle, time: f64) -> Message {
        Message::new(from, Payload::TimeAdvanceRequest { time: t(time) })
    }

    fn grants_in(outcome: &crate::Outcome) -> Vec<LogicalTime> {
        outcome
            .outbound
            .iter()
            .filter(|o| o.destination == Destination::Local)
            .filter_map(|o| match o.message.payload {
                Payload::TimeAdvanceGrant { time } => Some(time),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lbts_is_least_bound() {
        let st = two_federates();
        assert_eq!(st.lbts(), t(6.0));
    }

    #[test]
    fn request_at_lbts_is_granted() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        let out = reg.dispatch(&mut st, tar(A, 6.0)).unwrap();
        assert_eq!(grants_in(&out), vec![t(6.0)]);
        assert_eq!(st.current_time(), t(6.0));
        assert_eq!(st.time.advancing, Advancing::Granted);
    }

    #[test]
    fn request_past_lbts_waits_for_peer() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        let out = reg.dispatch(&mut st, tar(A, 6.5)).unwrap();
        assert!(grants_in(&out).is_empty());
        assert_eq!(st.current_time(), t(5.0));

        // B asks for 5.0: its bound becomes 7.0, LBTS becomes 7.0.
        let out = reg.dispatch(&mut st, tar(B, 5.0)).unwrap();
        assert_eq!(grants_in(&out), vec![t(6.5)]);
        assert_eq!(st.lbts(), t(7.0));
    }

    #[test]
    fn second_request_while_pending_is_rejected() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        reg.dispatch(&mut st, tar(A, 9.0)).unwrap();
        let err = reg.dispatch(&mut st, tar(A, 10.0));
        assert_eq!(err, Err(Error::Protocol(Violation::AdvancePending)));
        let err = reg.dispatch(&mut two_federates(), tar(A, 1.0));
        assert!(matches!(err, Err(Error::Protocol(Violation::AdvanceIntoPast { .. }))));
    }

    #[test]
    fn misaddressed_grant_is_not_applied() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        reg.dispatch(&mut st, tar(A, 9.0)).unwrap();
        // A peer relays a grant it thinks we are owed; our LBTS says no.
        let forged = Message::new(B, Payload::TimeAdvanceGrant { time: t(9.0) }).to(A);
        let out = reg.dispatch(&mut st, forged).unwrap();
        assert!(out.callbacks.is_empty());
        assert_eq!(st.current_time(), t(5.0));
    }

    #[test]
    fn peer_grant_moves_replica() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        let g = Message::new(B, Payload::TimeAdvanceGrant { time: t(8.0) });
        reg.dispatch(&mut st, g).unwrap();
        assert_eq!(st.peer_status(B).map(|s| s.current), Some(t(8.0)));
        // A's own bound, 6.0, now limits.
        assert_eq!(st.lbts(), t(6.0));
    }

    #[test]
    fn lookahead_decrease_keeps_lbts() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        let m = Message::new(B, Payload::ModifyLookahead { lookahead: la(0.5) });
        reg.dispatch(&mut st, m).unwrap();
        assert_eq!(st.lbts(), t(6.0));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Request(bool, f64),
        PeerGrant(f64),
        Lookahead(bool, f64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), 0.0..20.0f64).prop_map(|(p, v)| Op::Request(p, v)),
            (0.0..20.0f64).prop_map(Op::PeerGrant),
            (any::<bool>(), 0.0..3.0f64).prop_map(|(p, v)| Op::Lookahead(p, v)),
        ]
    }

    proptest! {
        #[test]
        fn lbts_never_decreases(ops in proptest::collection::vec(op(), 1..40)) {
            let reg = HandlerRegistry::standard().unwrap();
            let mut st = two_federates();
            let mut last = st.lbts();
            for o in ops {
                let m = match o {
                    Op::Request(local, v) => tar(if local { A } else { B }, v),
                    Op::PeerGrant(v) => Message::new(B, Payload::TimeAdvanceGrant { time: t(v) }),
                    Op::Lookahead(local, v) => Message::new(
                        if local { A } else { B },
                        Payload::ModifyLookahead { lookahead: la(v) },
                    ),
                };
                let _ = reg.dispatch(&mut st, m);
                prop_assert!(st.lbts() >= last);
                prop_assert_eq!(st.lbts(), computed_lbts(&st));
                if st.time.advancing == Advancing::Granted {
                    prop_assert!(st.current_time() <= st.lbts());
                }
                last = st.lbts();
            }
        }
    }

    fn switched(m: Payload) -> Message {
        Message::new(A, m)
    }

    #[test]
    fn lbts_skips_peers_that_do_not_regulate() {
        let mut st = two_federates();
        st.peers.get_mut(&B).unwrap().status.current = t(2.0);
        assert_eq!(computed_lbts(&st), t(4.0));
        st.peers.get_mut(&B).unwrap().status.regulation = Switch::Pending;
        assert_eq!(computed_lbts(&st), t(4.0));
        st.peers.get_mut(&B).unwrap().status.regulation = Switch::Off;
        assert_eq!(computed_lbts(&st), t(6.0));
    }

    #[test]
    fn regulation_waits_for_every_floor() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        st.time.regulation = Switch::Off;
        let enable = || switched(Payload::EnableTimeRegulation { lookahead: la(1.0) });
        let out = reg.dispatch(&mut st, enable()).unwrap();
        assert_eq!(st.time.regulation, Switch::Pending);
        assert!(out.callbacks.is_empty());
        assert_eq!(out.outbound[0].destination, Destination::Broadcast);
        assert_eq!(
            reg.dispatch(&mut st, enable()),
            Err(Error::Protocol(Violation::RegulationPending))
        );
        assert_eq!(
            reg.dispatch(&mut st, tar(A, 9.0)),
            Err(Error::Protocol(Violation::RegulationPending))
        );

        let floor = Message::new(B, Payload::RegulationFloor { floor: t(8.0) }).to(A);
        let out = reg.dispatch(&mut st, floor.clone()).unwrap();
        assert!(st.time.is_regulating());
        assert_eq!(st.current_time(), t(7.0));
        assert_eq!(out.callbacks, vec![Callback::TimeRegulationEnabled { time: t(7.0) }]);

        // A repeated floor changes nothing.
        let out = reg.dispatch(&mut st, floor).unwrap();
        assert!(out.callbacks.is_empty());
    }

    #[test]
    fn resignation_completes_a_pending_regulation() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        st.time.regulation = Switch::Off;
        reg.dispatch(&mut st, switched(Payload::EnableTimeRegulation { lookahead: la(1.0) }))
            .unwrap();
        let resign = Message::new(B, Payload::ResignFederation { action: 4 });
        let out = reg.dispatch(&mut st, resign).unwrap();
        assert!(st.time.is_regulating());
        assert!(out
            .callbacks
            .contains(&Callback::TimeRegulationEnabled { time: t(5.0) }));
    }

    #[test]
    fn peer_starting_to_regulate_is_held_to_our_lbts() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        st.peers.get_mut(&B).unwrap().status.regulation = Switch::Off;
        let enable = Message::new(B, Payload::EnableTimeRegulation { lookahead: la(0.5) });
        let out = reg.dispatch(&mut st, enable).unwrap();
        let replica = st.peer_status(B).copied().unwrap();
        assert!(replica.is_regulating());
        assert_eq!(replica.floor, t(6.0));
        assert_eq!(replica.bound(), t(6.0));
        assert_eq!(st.lbts(), t(6.0));
        assert!(out.outbound.iter().any(|o| o.destination == Destination::Federate(B)
            && o.message.payload == Payload::RegulationFloor { floor: t(6.0) }));

        let disable = Message::new(B, Payload::DisableTimeRegulation);
        reg.dispatch(&mut st, disable).unwrap();
        assert_eq!(st.peer_status(B).map(|s| s.regulation), Some(Switch::Off));
    }

    #[test]
    fn unconstrained_request_is_granted_past_lbts() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        st.time.constraint = Switch::Off;
        let out = reg.dispatch(&mut st, tar(A, 9.0)).unwrap();
        assert_eq!(grants_in(&out), vec![t(9.0)]);
        assert_eq!(st.current_time(), t(9.0));
    }

    #[test]
    fn constraint_waits_for_lbts_to_reach_current_time() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = two_federates();
        st.time.constraint = Switch::Off;
        st.time.current = t(7.0);
        assert_eq!(
            reg.dispatch(&mut st, switched(Payload::DisableTimeConstrained)),
            Err(Error::Protocol(Violation::ConstraintNotEnabled))
        );
        let out = reg.dispatch(&mut st, switched(Payload::EnableTimeConstrained)).unwrap();
        assert_eq!(st.time.constraint, Switch::Pending);
        assert!(out.callbacks.is_empty());

        // B moving to 8.0 lifts LBTS to A's own bound of 8.0.
        let g = Message::new(B, Payload::TimeAdvanceGrant { time: t(8.0) });
        let out = reg.dispatch(&mut st, g).unwrap();
        assert!(st.time.is_constrained());
        assert_eq!(out.callbacks, vec![Callback::TimeConstrainedEnabled { time: t(7.0) }]);
        assert_eq!(
            reg.dispatch(&mut st, switched(Payload::EnableTimeConstrained)),
            Err(Error::Protocol(Violation::ConstraintAlreadyEnabled))
        );
    }

    #[test]
    fn non_regulating_sends_lose_their_timestamp() {
        let mut st = two_federates();
        assert_eq!(send_time(&st, Some(t(6.5))), Ok(Some(t(6.5))));
        assert!(send_time(&st, Some(t(5.5))).is_err());
        st.time.regulation = Switch::Off;
        assert_eq!(send_time(&st, Some(t(0.5))), Ok(None));
        assert_eq!(send_time(&st, None), Ok(None));
    }
}
