// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Publication and subscription.
//!
//! A federate may only register instances of, own attributes of, or send
//! interactions of classes it publishes, and it only hears about what it
//! subscribes to. Interests are local: every message still goes to every
//! member, and the receiver filters against its own subscriptions.

use crate::objects::discover;
use crate::ownership::relinquish;
use crate::pipeline::Handler;
use crate::{
    AttributeHandle, AttributeKey, FederateState, InteractionClassHandle, MessageContext,
    MessageKind, ObjectClassHandle, ObjectHandle, Payload, Pending, Result, ServiceHandler, Side,
    Verdict, Violation,
};
use im::{OrdMap, OrdSet};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interest {
    Publish,
    Subscribe,
}

/// What one federate has declared, per class.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct Interests {
    pub published_objects: OrdMap<ObjectClassHandle, OrdSet<AttributeHandle>>,
    pub subscribed_objects: OrdMap<ObjectClassHandle, OrdSet<AttributeHandle>>,
    pub published_interactions: OrdSet<InteractionClassHandle>,
    pub subscribed_interactions: OrdSet<InteractionClassHandle>,
}

impl Interests {
    fn objects(&self, interest: Interest) -> &OrdMap<ObjectClassHandle, OrdSet<AttributeHandle>> {
        match interest {
            Interest::Publish => &self.published_objects,
            Interest::Subscribe => &self.subscribed_objects,
        }
    }

    fn objects_mut(
        &mut self,
        interest: Interest,
    ) -> &mut OrdMap<ObjectClassHandle, OrdSet<AttributeHandle>> {
        match interest {
            Interest::Publish => &mut self.published_objects,
            Interest::Subscribe => &mut self.subscribed_objects,
        }
    }

    fn interactions_mut(&mut self, interest: Interest) -> &mut OrdSet<InteractionClassHandle> {
        match interest {
            Interest::Publish => &mut self.published_interactions,
            Interest::Subscribe => &mut self.subscribed_interactions,
        }
    }

    pub fn publishes(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> bool {
        self.published_objects
            .get(&class)
            .map_or(false, |s| s.contains(&attribute))
    }

    pub fn published_attributes(
        &self,
        class: ObjectClassHandle,
    ) -> Option<&OrdSet<AttributeHandle>> {
        self.published_objects.get(&class)
    }

    pub fn subscribed_attributes(
        &self,
        class: ObjectClassHandle,
    ) -> Option<&OrdSet<AttributeHandle>> {
        self.subscribed_objects.get(&class)
    }

    pub fn publishes_interaction(&self, class: InteractionClassHandle) -> bool {
        self.published_interactions.contains(&class)
    }

    pub fn subscribes_interaction(&self, class: InteractionClassHandle) -> bool {
        self.subscribed_interactions.contains(&class)
    }
}

fn not_declared(interest: Interest, class: ObjectClassHandle) -> Violation {
    match interest {
        Interest::Publish => Violation::ObjectClassNotPublished(class),
        Interest::Subscribe => Violation::ObjectClassNotSubscribed(class),
    }
}

// Attributes that stop being published lose their owner. Fails, changing
// nothing, if one of them is still being acquired by us.
fn drop_published(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    class: ObjectClassHandle,
    removed: &OrdSet<AttributeHandle>,
) -> Result<()> {
    let me = state.handle;
    let objects: Vec<ObjectHandle> = state
        .objects
        .iter()
        .filter(|(_, r)| r.class == class)
        .map(|(o, _)| *o)
        .collect();
    let mut owned: Vec<(ObjectHandle, Vec<AttributeKey>)> = Vec::new();
    for object in objects {
        let mut keys = Vec::new();
        for a in removed.iter() {
            let key = AttributeKey::new(object, *a);
            let rec = state.record(&key);
            if matches!(rec.pending, Pending::Acquire { by, .. } if by == me) {
                return Err(Violation::TransferPending(key).into());
            }
            if rec.owner() == Some(me) {
                keys.push(key);
            }
        }
        if !keys.is_empty() {
            owned.push((object, keys));
        }
    }
    for (object, keys) in owned {
        relinquish(state, ctx, object, &keys);
    }
    Ok(())
}

fn declare_object_class(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    interest: Interest,
    class: ObjectClassHandle,
    attributes: &[AttributeHandle],
) -> Result<()> {
    state.require_joined()?;
    let cls = state
        .model
        .object_class(class)
        .ok_or_else(|| Violation::NotInModel(class.to_string()))?;
    if attributes.is_empty() {
        return Err(Violation::EmptyAttributeSet.into());
    }
    if let Some(a) = attributes.iter().find(|a| !cls.attributes.contains_key(a)) {
        return Err(Violation::NotInModel(format!("{} of {}", a, cls.name)).into());
    }
    let wanted: OrdSet<AttributeHandle> = attributes.iter().cloned().collect();
    let before = state
        .interests
        .objects(interest)
        .get(&class)
        .cloned()
        .unwrap_or_default();
    if interest == Interest::Publish {
        drop_published(state, ctx, class, &before.relative_complement(wanted.clone()))?;
    }
    debug!(
        "federate {} {:?} {} attributes {}",
        state.handle,
        interest,
        class,
        wanted.iter().join(",")
    );
    state.interests.objects_mut(interest).insert(class, wanted);
    if interest == Interest::Subscribe {
        let known: Vec<ObjectHandle> = state
            .objects
            .iter()
            .filter(|(_, r)| r.class == class)
            .map(|(o, _)| *o)
            .collect();
        for object in known {
            discover(state, ctx, object, class);
        }
    }
    Ok(())
}

fn withdraw_object_class(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    interest: Interest,
    class: ObjectClassHandle,
) -> Result<()> {
    state.require_joined()?;
    let before = state
        .interests
        .objects(interest)
        .get(&class)
        .cloned()
        .ok_or_else(|| not_declared(interest, class))?;
    if interest == Interest::Publish {
        drop_published(state, ctx, class, &before)?;
    }
    debug!("federate {} withdrew {:?} of {}", state.handle, interest, class);
    state.interests.objects_mut(interest).remove(&class);
    Ok(())
}

fn on_declare_object(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::DeclareObjectClass {
        interest,
        class,
        attributes,
    } = ctx.request.payload.clone()
    {
        declare_object_class(state, ctx, interest, class, &attributes)?;
    }
    Ok(Verdict::Handled)
}

fn on_withdraw_object(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::WithdrawObjectClass { interest, class } = ctx.request.payload {
        withdraw_object_class(state, ctx, interest, class)?;
    }
    Ok(Verdict::Handled)
}

fn on_declare_interaction(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::DeclareInteractionClass { interest, class } = ctx.request.payload {
        state.require_joined()?;
        if state.model.interaction_class(class).is_none() {
            return Err(Violation::NotInModel(class.to_string()).into());
        }
        debug!("federate {} {:?} {}", state.handle, interest, class);
        state.interests.interactions_mut(interest).insert(class);
    }
    Ok(Verdict::Handled)
}

fn on_withdraw_interaction(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::WithdrawInteractionClass { interest, class } = ctx.request.payload {
        state.require_joined()?;
        if state.interests.interactions_mut(interest).remove(&class).is_none() {
            return Err(match interest {
                Interest::Publish => Violation::InteractionClassNotPublished(class),
                Interest::Subscribe => Violation::InteractionClassNotSubscribed(class),
            }
            .into());
        }
        debug!("federate {} withdrew {:?} of {}", state.handle, interest, class);
    }
    Ok(Verdict::Handled)
}

pub(crate) fn handlers() -> Vec<Box<dyn Handler>> {
    vec![
        ServiceHandler::new(
            "declare.object",
            MessageKind::DeclareObjectClass,
            Side::Outgoing,
            on_declare_object,
        ),
        ServiceHandler::new(
            "declare.object.withdraw",
            MessageKind::WithdrawObjectClass,
            Side::Outgoing,
            on_withdraw_object,
        ),
        ServiceHandler::new(
            "declare.interaction",
            MessageKind::DeclareInteractionClass,
            Side::Outgoing,
            on_declare_interaction,
        ),
        ServiceHandler::new(
            "declare.interaction.withdraw",
            MessageKind::WithdrawInteractionClass,
            Side::Outgoing,
            on_withdraw_interaction,
        ),
    ]
}
