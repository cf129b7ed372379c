// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::pipeline::Handler;
use crate::time_manager::send_time;
use crate::{
    AttributeHandle, AttributeKey, Callback, FederateHandle, FederateState, MessageContext,
    MessageKind, ObjectClassHandle, ObjectHandle, ObjectRecord, OwnershipClaim,
    Payload, Response, Result, ServiceHandler, Side, Verdict, Violation,
};
use crate::ownership::ClaimLE;
use std::collections::BTreeMap;
use tracing::{debug, trace};

fn registrant_claim(object: ObjectHandle) -> OwnershipClaim {
    OwnershipClaim {
        epoch: 1,
        owner: Some(object.registrant()),
    }
}

// Install an object and its registrant's initial claims. Claims that
// already arrived from later transfers order above these and survive.
pub(crate) fn install_object(
    state: &mut FederateState,
    object: ObjectHandle,
    class: ObjectClassHandle,
    attributes: &[AttributeHandle],
) {
    state.objects.insert(object, ObjectRecord { class });
    for a in attributes {
        let key = AttributeKey::new(object, *a);
        let mut rec = state.record(&key);
        rec.claim = rec.claim.clone() + &ClaimLE::new_from(registrant_claim(object));
        state.ownership.insert(key, rec);
    }
}

/// Tell the application about a peer's object if it subscribes to the
/// class and has not heard of the object yet.
pub(crate) fn discover(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    class: ObjectClassHandle,
) {
    if object.registrant() == state.handle
        || state.discovered.contains(&object)
        || state.interests.subscribed_attributes(class).is_none()
    {
        return;
    }
    state.discovered.insert(object);
    ctx.callback(Callback::ObjectDiscovered { object, class });
}

/// Returns whether the application had discovered the object.
pub(crate) fn remove_object(state: &mut FederateState, object: ObjectHandle) -> bool {
    state.objects.remove(&object);
    state.deleted_objects.insert(object);
    let keys: Vec<AttributeKey> = state
        .ownership
        .keys()
        .filter(|k| k.object == object)
        .cloned()
        .collect();
    for k in keys {
        state.ownership.remove(&k);
    }
    state.discovered.remove(&object).is_some()
}

fn on_register(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::RegisterObject {
        class, attributes, ..
    } = ctx.request.payload.clone()
    {
        state.require_joined()?;
        let cls = state
            .model
            .object_class(class)
            .ok_or_else(|| Violation::NotInModel(class.to_string()))?;
        let published = state
            .interests
            .published_attributes(class)
            .cloned()
            .ok_or(Violation::ObjectClassNotPublished(class))?;
        let attributes: Vec<AttributeHandle> = if attributes.is_empty() {
            published.iter().cloned().collect()
        } else {
            for a in attributes.iter() {
                if !cls.attributes.contains_key(a) {
                    return Err(Violation::NotInModel(format!("{} of {}", a, cls.name)).into());
                }
                if !published.contains(a) {
                    return Err(Violation::AttributeNotPublished(class, *a).into());
                }
            }
            attributes
        };
        let object = state.alloc_object()?;
        install_object(state, object, class, &attributes);
        debug!("federate {} registered {} of class {}", state.handle, object, class);
        let m = state.message(Payload::RegisterObject {
            object,
            class,
            attributes,
        });
        ctx.broadcast(m);
        ctx.respond(Response::Registered(object));
    }
    Ok(Verdict::Handled)
}

fn on_peer_register(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::RegisterObject {
        object,
        class,
        attributes,
    } = ctx.request.payload.clone()
    {
        if object.registrant() != from {
            return Err(Violation::NotRegistrant(object).into());
        }
        if let Some(known) = state.objects.get(&object) {
            if known.class != class {
                return Err(Violation::ObjectExists(object).into());
            }
        }
        // A role call may already have told us about it.
        if state.knows_object(object) || state.deleted_objects.contains(&object) {
            trace!("federate {} already knows {}", state.handle, object);
            return Ok(Verdict::Handled);
        }
        install_object(state, object, class, &attributes);
        discover(state, ctx, object, class);
    }
    Ok(Verdict::Handled)
}

fn on_delete(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::DeleteObject { object, tag } = ctx.request.payload.clone() {
        state.require_joined()?;
        if !state.knows_object(object) {
            return Err(Violation::UnknownObject(object).into());
        }
        if object.registrant() != state.handle {
            return Err(Violation::NotRegistrant(object).into());
        }
        let ts = send_time(state, ctx.request.timestamp)?;
        remove_object(state, object);
        debug!("federate {} deleted {}", state.handle, object);
        let m = state.message(Payload::DeleteObject { object, tag }).at(ts);
        ctx.broadcast(m);
    }
    Ok(Verdict::Handled)
}

fn on_peer_delete(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::DeleteObject { object, tag } = ctx.request.payload.clone() {
        if object.registrant() != from {
            return Err(Violation::NotRegistrant(object).into());
        }
        if !state.knows_object(object) {
            trace!("federate {} has no {} to delete", state.handle, object);
            return Ok(Verdict::Handled);
        }
        if remove_object(state, object) {
            ctx.callback(Callback::ObjectRemoved {
                object,
                tag,
                timestamp: ctx.request.timestamp,
            });
        }
    }
    Ok(Verdict::Handled)
}

fn on_update(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::UpdateAttributes {
        object,
        values,
        tag,
    } = ctx.request.payload.clone()
    {
        state.require_joined()?;
        let attributes: Vec<AttributeHandle> = values.keys().cloned().collect();
        for k in state.keys(object, &attributes)? {
            if state.record(&k).owner() != Some(state.handle) {
                return Err(Violation::AttributeNotOwned(k).into());
            }
        }
        let ts = send_time(state, ctx.request.timestamp)?;
        let m = state
            .message(Payload::UpdateAttributes {
                object,
                values,
                tag,
            })
            .at(ts);
        ctx.broadcast(m);
    }
    Ok(Verdict::Handled)
}

fn on_peer_update(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::UpdateAttributes {
        object,
        values,
        tag,
    } = ctx.request.payload.clone()
    {
        let class = match state.objects.get(&object) {
            Some(r) if state.discovered.contains(&object) => r.class,
            _ => {
                trace!("federate {} dropping update of undiscovered {}", state.handle, object);
                return Ok(Verdict::Handled);
            }
        };
        let values: BTreeMap<AttributeHandle, Vec<u8>> =
            match state.interests.subscribed_attributes(class) {
                Some(wanted) => values.into_iter().filter(|(a, _)| wanted.contains(a)).collect(),
                None => BTreeMap::new(),
            };
        if values.is_empty() {
            trace!("federate {} subscribes to nothing updated on {}", state.handle, object);
            return Ok(Verdict::Handled);
        }
        ctx.callback(Callback::AttributesReflected {
            object,
            values,
            tag,
            timestamp: ctx.request.timestamp,
            from,
        });
    }
    Ok(Verdict::Handled)
}

fn on_interaction(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::SendInteraction {
        class,
        parameters,
        tag,
    } = ctx.request.payload.clone()
    {
        state.require_joined()?;
        let cls = state
            .model
            .interaction_class(class)
            .ok_or_else(|| Violation::NotInModel(class.to_string()))?;
        if let Some(p) = parameters.keys().find(|p| !cls.parameters.contains_key(p)) {
            return Err(Violation::NotInModel(format!("{} of {}", p, cls.name)).into());
        }
        if !state.interests.publishes_interaction(class) {
            return Err(Violation::InteractionClassNotPublished(class).into());
        }
        let ts = send_time(state, ctx.request.timestamp)?;
        let m = state
            .message(Payload::SendInteraction {
                class,
                parameters,
                tag,
            })
            .at(ts);
        ctx.broadcast(m);
    }
    Ok(Verdict::Handled)
}

fn on_peer_interaction(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::SendInteraction {
        class,
        parameters,
        tag,
    } = ctx.request.payload.clone()
    {
        if !state.interests.subscribes_interaction(class) {
            trace!("federate {} not subscribed to {}", state.handle, class);
            return Ok(Verdict::Handled);
        }
        ctx.callback(Callback::InteractionReceived {
            class,
            parameters,
            tag,
            timestamp: ctx.request.timestamp,
            from,
        });
    }
    Ok(Verdict::Handled)
}

fn on_request_update(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::RequestObjectUpdate { object, attributes } = ctx.request.payload.clone() {
        state.require_joined()?;
        state.keys(object, &attributes)?;
        let m = state.message(Payload::RequestObjectUpdate { object, attributes });
        ctx.broadcast(m);
    }
    Ok(Verdict::Handled)
}

fn on_peer_request_update(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::RequestObjectUpdate { object, attributes } = ctx.request.payload.clone() {
        let me: FederateHandle = state.handle;
        let mine: Vec<AttributeHandle> = attributes
            .into_iter()
            .filter(|a| state.owner(object, *a) == Some(me))
            .collect();
        if !mine.is_empty() {
            ctx.callback(Callback::ProvideUpdate {
                object,
                attributes: mine,
            });
        }
    }
    Ok(Verdict::Handled)
}

/// Objects this federate registered and still knows, for a role call.
pub(crate) fn registered_by(
    state: &FederateState,
    federate: FederateHandle,
) -> Vec<(ObjectHandle, ObjectClassHandle)> {
    state
        .objects
        .iter()
        .filter(|(o, _)| o.registrant() == federate)
        .map(|(o, r)| (*o, r.class))
        .collect()
}

/// Claims naming `federate` as owner, for a role call.
pub(crate) fn claims_of(
    state: &FederateState,
    federate: FederateHandle,
) -> Vec<(ObjectHandle, AttributeHandle, OwnershipClaim)> {
    state
        .ownership
        .iter()
        .filter(|(_, r)| r.owner() == Some(federate))
        .map(|(k, r)| (k.object, k.attribute, r.claim.value))
        .collect()
}

pub(crate) fn handlers() -> Vec<Box<dyn Handler>> {
    use MessageKind::*;
    vec![
        ServiceHandler::new("object.register", RegisterObject, Side::Outgoing, on_register),
        ServiceHandler::new(
            "object.register.peer",
            RegisterObject,
            Side::Incoming,
            on_peer_register,
        ),
        ServiceHandler::new("object.delete", DeleteObject, Side::Outgoing, on_delete),
        ServiceHandler::new("object.delete.peer", DeleteObject, Side::Incoming, on_peer_delete),
        ServiceHandler::new("object.update", UpdateAttributes, Side::Outgoing, on_update),
        ServiceHandler::new("object.update.peer", UpdateAttributes, Side::Incoming, on_peer_update),
        ServiceHandler::new("object.interaction", SendInteraction, Side::Outgoing, on_interaction),
        ServiceHandler::new(
            "object.interaction.peer",
            SendInteraction,
            Side::Incoming,
            on_peer_interaction,
        ),
        ServiceHandler::new(
            "object.request-update",
            RequestObjectUpdate,
            Side::Outgoing,
            on_request_update,
        ),
        ServiceHandler::new(
            "object.request-update.peer",
            RequestObjectUpdate,
            Side::Incoming,
            on_peer_request_update,
        ),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Error, HandlerRegistry, Lookahead, Message, ObjectModel, PeerRecord, TimeStatus};
    use std::sync::Arc;

    const A: FederateHandle = FederateHandle(1);
    const B: FederateHandle = FederateHandle(2);
    const TANK: ObjectClassHandle = ObjectClassHandle(1);
    const POS: AttributeHandle = AttributeHandle(1);
    const FUEL: AttributeHandle = AttributeHandle(2);

    fn federate() -> FederateState {
        let mut st = FederateState::new(A, "a", Lookahead::ZERO);
        st.joined = true;
        st.model = Arc::new(ObjectModel::new().with_object_class(1, "Tank", &["pos", "fuel"]));
        st.peers.insert(
            B,
            PeerRecord {
                name: None,
                status: TimeStatus::new(Lookahead::ZERO),
            },
        );
        st
    }

    fn register(attributes: Vec<AttributeHandle>) -> Message {
        Message::new(
            A,
            Payload::RegisterObject {
                object: ObjectHandle(0),
                class: TANK,
                attributes,
            },
        )
    }

    #[test]
    fn registration_follows_publication() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = federate();
        assert_eq!(
            reg.dispatch(&mut st, register(vec![])),
            Err(Error::Protocol(Violation::ObjectClassNotPublished(TANK)))
        );
        st.interests
            .published_objects
            .insert(TANK, std::iter::once(POS).collect());
        assert_eq!(
            reg.dispatch(&mut st, register(vec![FUEL])),
            Err(Error::Protocol(Violation::AttributeNotPublished(TANK, FUEL)))
        );
        let out = reg.dispatch(&mut st, register(vec![])).unwrap();
        let object = match out.response {
            Some(Response::Registered(o)) => o,
            r => panic!("unexpected response {:?}", r),
        };
        assert_eq!(st.owner(object, POS), Some(A));
        assert_eq!(st.owner(object, FUEL), None);
    }

    #[test]
    fn peer_objects_are_discovered_once_subscribed() {
        let reg = HandlerRegistry::standard().unwrap();
        let mut st = federate();
        let object = ObjectHandle::compose(B, 1);
        let theirs = |payload| Message::new(B, payload);
        let registered = Payload::RegisterObject {
            object,
            class: TANK,
            attributes: vec![POS],
        };
        let out = reg.dispatch(&mut st, theirs(registered)).unwrap();
        assert!(st.knows_object(object));
        assert!(out.callbacks.is_empty());

        let mut values = BTreeMap::new();
        values.insert(POS, b"1,1".to_vec());
        let update = Payload::UpdateAttributes {
            object,
            values,
            tag: vec![],
        };
        let out = reg.dispatch(&mut st, theirs(update.clone())).unwrap();
        assert!(out.callbacks.is_empty());

        st.interests
            .subscribed_objects
            .insert(TANK, std::iter::once(POS).collect());
        let tick = st.message(Payload::FederationLbts { lbts: st.lbts() });
        let mut ctx = MessageContext::new(tick, A);
        discover(&mut st, &mut ctx, object, TANK);
        discover(&mut st, &mut ctx, object, TANK);
        assert_eq!(ctx.callbacks().len(), 1);
        let out = reg.dispatch(&mut st, theirs(update)).unwrap();
        assert!(matches!(
            out.callbacks[..],
            [Callback::AttributesReflected { from: B, .. }]
        ));
    }
}
