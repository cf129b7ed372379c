// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Joining and leaving a federation.
//!
//! There is no central registrar. A newcomer attaches to the transport,
//! which tells it who is already there, and broadcasts a join. Every
//! existing member answers with a role call describing itself; once the
//! newcomer has heard from everybody on its roster the join is complete
//! and it may start sending timestamped messages.

use crate::objects::{claims_of, discover, install_object, registered_by, remove_object};
use crate::ownership::{apply_claims, forget_requests_of, release_all_of};
use crate::pipeline::Handler;
use crate::time_manager::{self, refresh};
use crate::{
    sync, Callback, Error, FederateHandle, FederateState, Lookahead, MessageContext, MessageKind,
    ObjectHandle, Payload, PeerRecord, ResignAction, Result, RoleCall, ServiceHandler, Side,
    TimeStatus, Verdict, Violation,
};
use itertools::Itertools;
use std::cmp::max;
use std::sync::Arc;
use tracing::{debug, trace};

/// Seed replicas for the members the transport reported at attach time.
/// They count at bound zero until their role calls arrive.
pub(crate) fn admit_roster(state: &mut FederateState, roster: &[FederateHandle]) {
    for f in roster.iter().filter(|f| **f != state.handle) {
        if !state.peers.contains_key(f) {
            state.peers.insert(
                *f,
                PeerRecord {
                    name: None,
                    status: TimeStatus::new(Lookahead::ZERO),
                },
            );
        }
    }
}

fn complete_join(state: &mut FederateState, ctx: &mut MessageContext) {
    let la = state.time.lookahead;
    state.time.current = max(state.time.current, state.time.floor.minus(la));
    let federation = state.federation.clone().unwrap_or_default();
    debug!(
        "federate {} completed join of {:?} at {}",
        state.handle, federation, state.time.current
    );
    ctx.callback(Callback::JoinCompleted {
        federation,
        time: state.time.current,
    });
}

fn on_create(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::CreateFederation { federation, model } = ctx.request.payload.clone() {
        if state.joined {
            return Err(Error::AlreadyJoined);
        }
        model.validate()?;
        trace!("federate {} adopting model of {:?}", state.handle, federation);
        state.federation = Some(federation);
        state.model = Arc::new(model);
    }
    Ok(Verdict::Handled)
}

fn on_join(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::JoinFederation {
        federation,
        federate_name,
        ..
    } = ctx.request.payload.clone()
    {
        if state.joined {
            return Err(Error::AlreadyJoined);
        }
        if state.federation.as_deref() != Some(federation.as_str()) {
            return Err(Error::FederationNotFound(federation));
        }
        state.name = federate_name.clone();
        state.joined = true;
        state.awaiting_role_call = state.peers.keys().cloned().collect();
        debug!(
            "federate {} joining {:?} as {:?}, awaiting {} role calls",
            state.handle,
            federation,
            federate_name,
            state.awaiting_role_call.len()
        );
        let m = state.message(Payload::JoinFederation {
            federation,
            federate_name,
            status: state.time,
        });
        ctx.broadcast(m);
        if state.awaiting_role_call.is_empty() {
            complete_join(state, ctx);
        }
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_peer_join(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::JoinFederation {
        federation,
        federate_name,
        status,
    } = ctx.request.payload.clone()
    {
        state.require_joined()?;
        if state.federation.as_deref() != Some(federation.as_str()) {
            return Ok(Verdict::Vetoed("join of another federation"));
        }
        let mut rec = state.peers.get(&from).cloned().unwrap_or(PeerRecord {
            name: None,
            status: TimeStatus::new(status.lookahead),
        });
        rec.status.merge(&status);
        // The newcomer must not pull our LBTS back below what we already
        // promised, so it starts out no lower than that.
        let newcomer_floor = state.lbts();
        rec.status.floor = max(rec.status.floor, newcomer_floor);
        rec.name = Some(federate_name.clone());
        state.peers.insert(from, rec);
        debug!(
            "federate {} admitting {} ({:?}) at floor {}",
            state.handle, from, federate_name, newcomer_floor
        );
        ctx.callback(Callback::FederateJoined {
            federate: from,
            name: federate_name,
        });
        let me = state.handle;
        let m = state.message(Payload::RoleCall(RoleCall {
            federate_name: state.name.clone(),
            status: state.time,
            newcomer_floor,
            objects: registered_by(state, me),
            claims: claims_of(state, me),
            sync_points: sync::snapshot(state),
        }));
        ctx.unicast(from, m);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_role_call(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if ctx.request.target != Some(state.handle) {
        return Err(Violation::WrongAddressee {
            addressed_to: ctx.request.target,
            delivered_to: state.handle,
        }
        .into());
    }
    let from = ctx.source();
    if let Payload::RoleCall(rc) = ctx.request.payload.clone() {
        state.require_joined()?;
        let mut rec = state.peers.get(&from).cloned().unwrap_or(PeerRecord {
            name: None,
            status: TimeStatus::new(rc.status.lookahead),
        });
        rec.status.merge(&rc.status);
        if rec.name.is_none() {
            ctx.callback(Callback::FederateJoined {
                federate: from,
                name: rc.federate_name.clone(),
            });
        }
        rec.name = Some(rc.federate_name.clone());
        state.peers.insert(from, rec);

        for (object, class) in rc.objects.iter() {
            if !state.knows_object(*object) && !state.deleted_objects.contains(object) {
                install_object(state, *object, *class, &[]);
                discover(state, ctx, *object, *class);
            }
        }
        let grouped = rc
            .claims
            .iter()
            .map(|(o, a, c)| (*o, (*a, *c)))
            .into_group_map();
        for (object, claims) in grouped.into_iter().sorted_by_key(|(o, _)| *o) {
            apply_claims(state, ctx, object, &claims);
        }
        for snap in rc.sync_points.iter() {
            sync::install_snapshot(state, snap);
        }

        if state.awaiting_role_call.remove(&from).is_some() {
            state.time.floor = max(state.time.floor, rc.newcomer_floor);
            trace!(
                "federate {} got role call from {}, {} outstanding",
                state.handle,
                from,
                state.awaiting_role_call.len()
            );
            if state.awaiting_role_call.is_empty() {
                complete_join(state, ctx);
            }
        }
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

fn on_resign(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::ResignFederation { action } = ctx.request.payload {
        let resign = ResignAction::from_code(action)?;
        state.require_joined()?;
        let me = state.handle;
        let kept = state
            .owned_keys()
            .into_iter()
            .filter(|_| !resign.releases_attributes())
            .filter(|k| !(resign.deletes_objects() && k.object.registrant() == me))
            .count();
        if kept > 0 {
            return Err(Violation::FederateOwnsAttributes(kept).into());
        }
        debug!("federate {} resigning with {:?}", me, resign);
        let m = state.message(Payload::ResignFederation { action });
        ctx.broadcast(m);
        state.joined = false;
        state.awaiting_role_call.clear();
    }
    Ok(Verdict::Handled)
}

fn on_peer_resign(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::ResignFederation { action } = ctx.request.payload {
        let resign = ResignAction::from_code(action)?;
        state.require_known(from)?;
        if resign.releases_attributes() {
            release_all_of(state, ctx, from);
        }
        if resign.deletes_objects() {
            let gone: Vec<ObjectHandle> = state
                .objects
                .keys()
                .filter(|o| o.registrant() == from)
                .cloned()
                .collect();
            for object in gone {
                if remove_object(state, object) {
                    ctx.callback(Callback::ObjectRemoved {
                        object,
                        tag: Vec::new(),
                        timestamp: None,
                    });
                }
            }
        }
        forget_requests_of(state, from);
        state.peers.remove(&from);
        state.departed.insert(from);
        debug!("federate {} saw {} resign with {:?}", state.handle, from, resign);
        ctx.callback(Callback::FederateResigned {
            federate: from,
            action: resign,
        });
        if state.awaiting_role_call.remove(&from).is_some() && state.awaiting_role_call.is_empty()
        {
            complete_join(state, ctx);
        }
        time_manager::forget_peer(state, ctx, from);
        sync::forget_member(state, ctx, from);
        refresh(state, ctx);
    }
    Ok(Verdict::Handled)
}

pub(crate) fn handlers() -> Vec<Box<dyn Handler>> {
    use MessageKind::*;
    vec![
        ServiceHandler::new("federation.create", CreateFederation, Side::Outgoing, on_create),
        ServiceHandler::new("federation.join", JoinFederation, Side::Outgoing, on_join),
        ServiceHandler::new("federation.join.peer", JoinFederation, Side::Incoming, on_peer_join),
        ServiceHandler::new("federation.role-call", RoleCall, Side::Incoming, on_role_call),
        ServiceHandler::new("federation.resign", ResignFederation, Side::Outgoing, on_resign),
        ServiceHandler::new(
            "federation.resign.peer",
            ResignFederation,
            Side::Incoming,
            on_peer_resign,
        ),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        AttributeHandle, AttributeKey, Destination, HandlerRegistry, LogicalTime, Message,
        ObjectModel, Outcome, OwnershipClaim,
    };

    const A: FederateHandle = FederateHandle(1);
    const B: FederateHandle = FederateHandle(2);
    const C: FederateHandle = FederateHandle(3);

    fn t(v: f64) -> LogicalTime {
        LogicalTime::new(v).unwrap()
    }

    fn model() -> ObjectModel {
        ObjectModel::new().with_object_class(1, "Tank", &["pos", "fuel"])
    }

    fn joined(
        reg: &HandlerRegistry,
        me: FederateHandle,
        roster: &[FederateHandle],
    ) -> (FederateState, Outcome) {
        let mut st = FederateState::new(me, "x", Lookahead::new(1.0).unwrap());
        let create = Message::new(
            me,
            Payload::CreateFederation {
                federation: "f".into(),
                model: model(),
            },
        );
        reg.dispatch(&mut st, create).unwrap();
        admit_roster(&mut st, roster);
        let join = Message::new(
            me,
            Payload::JoinFederation {
                federation: "f".into(),
                federate_name: format!("fed{}", me.0),
                status: st.time,
            },
        );
        let out = reg.dispatch(&mut st, join).unwrap();
        (st, out)
    }

    fn role_call_in(out: &Outcome) -> Option<Message> {
        out.outbound
            .iter()
            .filter(|o| o.destination != Destination::Local)
            .find(|o| o.message.kind() == MessageKind::RoleCall)
            .map(|o| o.message.clone())
    }

    fn join_broadcast(out: &Outcome) -> Message {
        out.outbound
            .iter()
            .find(|o| o.destination == Destination::Broadcast)
            .map(|o| o.message.clone())
            .unwrap()
    }

    #[test]
    fn first_member_completes_at_once() {
        let reg = HandlerRegistry::standard().unwrap();
        let (st, out) = joined(&reg, A, &[]);
        assert!(st.join_complete());
        assert!(out
            .callbacks
            .iter()
            .any(|c| matches!(c, Callback::JoinCompleted { .. })));
    }

    #[test]
    fn newcomer_waits_for_role_call_and_adopts_floor() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut a, _) = joined(&reg, A, &[]);
        a.time.current = t(10.0);
        let mut ctx = MessageContext::new(a.message(Payload::FederationLbts { lbts: t(0.0) }), A);
        refresh(&mut a, &mut ctx);
        assert_eq!(a.lbts(), t(11.0));
        let o = a.alloc_object().unwrap();
        install_object(&mut a, o, crate::ObjectClassHandle(1), &[AttributeHandle(1)]);

        let (mut b, out) = joined(&reg, B, &[A]);
        assert!(!b.join_complete());
        assert_eq!(b.lbts(), t(0.0));

        let out = reg.dispatch(&mut a, join_broadcast(&out)).unwrap();
        assert_eq!(a.peer_status(B).map(|s| s.bound()), Some(t(11.0)));
        assert_eq!(a.lbts(), t(11.0));
        let rc = role_call_in(&out).unwrap();

        let out = reg.dispatch(&mut b, rc).unwrap();
        assert!(b.join_complete());
        assert_eq!(b.current_time(), t(10.0));
        assert_eq!(b.time.bound(), t(11.0));
        assert!(b.knows_object(o));
        assert_eq!(b.owner(o, AttributeHandle(1)), Some(A));
        assert!(out.callbacks.iter().any(|c| matches!(c, Callback::JoinCompleted { .. })));
    }

    #[test]
    fn timestamped_send_waits_for_join() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut b, _) = joined(&reg, B, &[A]);
        let m = Message::new(
            B,
            Payload::SendInteraction {
                class: crate::InteractionClassHandle(1),
                parameters: Default::default(),
                tag: vec![],
            },
        )
        .at(Some(t(5.0)));
        b.model = Arc::new(model().with_interaction_class(1, "Fire", &[]));
        b.interests
            .published_interactions
            .insert(crate::InteractionClassHandle(1));
        assert_eq!(
            reg.dispatch(&mut b, m),
            Err(Error::Protocol(Violation::JoinInProgress))
        );
    }

    #[test]
    fn resign_codes_are_checked() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut a, _) = joined(&reg, A, &[]);
        let o = a.alloc_object().unwrap();
        install_object(&mut a, o, crate::ObjectClassHandle(1), &[AttributeHandle(1)]);
        let bad = Message::new(A, Payload::ResignFederation { action: 9 });
        assert_eq!(
            reg.dispatch(&mut a, bad),
            Err(Error::Protocol(Violation::InvalidResignAction(9)))
        );
        let keep = Message::new(A, Payload::ResignFederation { action: 4 });
        assert_eq!(
            reg.dispatch(&mut a, keep),
            Err(Error::Protocol(Violation::FederateOwnsAttributes(1)))
        );
        assert!(a.is_joined());
        let delete = Message::new(A, Payload::ResignFederation { action: 2 });
        reg.dispatch(&mut a, delete).unwrap();
        assert!(!a.is_joined());
    }

    #[test]
    fn peers_apply_resign_action() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut a, _) = joined(&reg, A, &[]);
        let (_, out) = joined(&reg, B, &[A]);
        reg.dispatch(&mut a, join_broadcast(&out)).unwrap();
        let o = ObjectHandle::compose(B, 1);
        install_object(&mut a, o, crate::ObjectClassHandle(1), &[AttributeHandle(1)]);
        let q = ObjectHandle::compose(A, 1);
        install_object(&mut a, q, crate::ObjectClassHandle(1), &[]);
        a.ownership.insert(
            AttributeKey::new(q, AttributeHandle(2)),
            crate::OwnershipRecord {
                claim: crate::ownership::ClaimLE::new_from(OwnershipClaim {
                    epoch: 2,
                    owner: Some(B),
                }),
                pending: Default::default(),
            },
        );

        let resign = Message::new(B, Payload::ResignFederation { action: 3 });
        let out = reg.dispatch(&mut a, resign).unwrap();
        assert!(!a.knows_object(o));
        assert!(a.knows_object(q));
        assert_eq!(a.owner(q, AttributeHandle(2)), None);
        assert!(!a.knows(B));
        assert!(out
            .callbacks
            .iter()
            .any(|c| matches!(c, Callback::FederateResigned { federate, .. } if *federate == B)));
    }

    #[test]
    fn role_call_for_someone_else_is_refused() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut a, _) = joined(&reg, A, &[]);
        let (_, out) = joined(&reg, B, &[A]);
        let out = reg.dispatch(&mut a, join_broadcast(&out)).unwrap();
        let rc = role_call_in(&out).unwrap();

        let (mut c, _) = joined(&reg, C, &[A]);
        assert_eq!(
            reg.dispatch(&mut c, rc),
            Err(Error::Protocol(Violation::WrongAddressee {
                addressed_to: Some(B),
                delivered_to: C,
            }))
        );
        assert!(!c.join_complete());
    }

    #[test]
    fn peer_registration_with_another_class_is_refused() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut a, _) = joined(&reg, A, &[]);
        let (_, out) = joined(&reg, B, &[A]);
        reg.dispatch(&mut a, join_broadcast(&out)).unwrap();
        let o = ObjectHandle::compose(B, 1);
        install_object(&mut a, o, crate::ObjectClassHandle(1), &[]);
        let clash = Message::new(
            B,
            Payload::RegisterObject {
                object: o,
                class: crate::ObjectClassHandle(2),
                attributes: vec![],
            },
        );
        assert_eq!(
            reg.dispatch(&mut a, clash),
            Err(Error::Protocol(Violation::ObjectExists(o)))
        );
    }

    #[test]
    fn role_call_discovers_only_subscribed_classes() {
        let reg = HandlerRegistry::standard().unwrap();
        let (mut a, _) = joined(&reg, A, &[]);
        let o = a.alloc_object().unwrap();
        install_object(&mut a, o, crate::ObjectClassHandle(1), &[]);

        let (mut b, out) = joined(&reg, B, &[A]);
        let out = reg.dispatch(&mut a, join_broadcast(&out)).unwrap();
        let rc = role_call_in(&out).unwrap();
        let (mut c, _) = joined(&reg, C, &[A]);
        c.interests
            .subscribed_objects
            .insert(crate::ObjectClassHandle(1), vec![AttributeHandle(1)].into_iter().collect());

        let out_b = reg.dispatch(&mut b, rc.clone()).unwrap();
        assert!(b.knows_object(o));
        assert!(!b.has_discovered(o));
        assert!(!out_b
            .callbacks
            .iter()
            .any(|cb| matches!(cb, Callback::ObjectDiscovered { .. })));

        let mut rc_c = rc;
        rc_c.target = Some(C);
        let out_c = reg.dispatch(&mut c, rc_c).unwrap();
        assert!(c.has_discovered(o));
        assert!(out_c
            .callbacks
            .iter()
            .any(|cb| matches!(cb, Callback::ObjectDiscovered { object, .. } if *object == o)));

        // Deleting objects on resign only tells those who discovered them.
        let resign = Message::new(A, Payload::ResignFederation { action: 2 });
        let out_b = reg.dispatch(&mut b, resign.clone()).unwrap();
        let out_c = reg.dispatch(&mut c, resign).unwrap();
        let removed = |out: &Outcome| {
            out.callbacks
                .iter()
                .filter(|cb| matches!(cb, Callback::ObjectRemoved { .. }))
                .count()
        };
        assert_eq!(removed(&out_b), 0);
        assert_eq!(removed(&out_c), 1);
        assert!(!b.knows_object(o));
    }
}
