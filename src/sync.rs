// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Synchronization points.
//!
//! Registration is decided without a coordinator. The registrant asks every
//! other member whether the label is free; a member that already holds a
//! claim for the label answers in favour of whichever claimant has the
//! lower handle, and a label that is already announced is never free. Only
//! a registrant that hears "yes" from everyone announces, so at most one
//! registration of a label can succeed.
//!
//! Achieved reports accumulate in a set-union lattice, which makes a repeat
//! report from the same federate a no-op.

use crate::pipeline::Handler;
use crate::{
    Callback, FederateHandle, FederateState, MessageContext, MessageKind, Payload, Result,
    ServiceHandler, Side, Verdict, Violation,
};
use im::OrdSet;
use itertools::Itertools;
use pergola::{ArcOrdSetWithUnion, LatticeElt};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub type AchievedLD = ArcOrdSetWithUnion<FederateHandle>;
pub type AchievedLE = LatticeElt<AchievedLD>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncState {
    Unannounced,  // Only achieved reports heard so far.
    Requested,    // A registration claim is being decided.
    Announced,    // Waiting for the synchronization set.
    Synchronized, // Retired.
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SyncPoint {
    pub label: String,
    pub registrant: Option<FederateHandle>,
    pub tag: Vec<u8>,
    pub state: SyncState,
    // While requested: the set asked for, `None` meaning everyone. Once
    // announced it is always explicit.
    pub required: Option<OrdSet<FederateHandle>>,
    pub achieved: AchievedLE,
    // Registrant only: members yet to answer the registration request.
    pub awaiting: OrdSet<FederateHandle>,
}

impl SyncPoint {
    fn placeholder(label: &str) -> Self {
        SyncPoint {
            label: label.to_string(),
            registrant: None,
            tag: Vec::new(),
            state: SyncState::Unannounced,
            required: None,
            achieved: AchievedLE::default(),
            awaiting: OrdSet::new(),
        }
    }

    fn claim(
        label: &str,
        registrant: FederateHandle,
        tag: &[u8],
        required: Option<OrdSet<FederateHandle>>,
    ) -> Self {
        SyncPoint {
            registrant: Some(registrant),
            tag: tag.to_vec(),
            state: SyncState::Requested,
            required,
            ..SyncPoint::placeholder(label)
        }
    }

    pub fn requires(&self, federate: FederateHandle) -> bool {
        match &self.required {
            Some(set) => set.contains(&federate),
            None => true,
        }
    }

    fn achieve(&mut self, federate: FederateHandle) -> bool {
        if self.achieved.value.contains(&federate) {
            return false;
        }
        let joined = self.achieved.clone() + &AchievedLE::new_from(OrdSet::unit(federate));
        self.achieved = joined;
        true
    }
}

/// A sync point as carried in a role call.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub label: String,
    pub registrant: FederateHandle,
    pub tag: Vec<u8>,
    pub state: SyncState,
    pub federates: Vec<FederateHandle>,
    pub achieved: Vec<FederateHandle>,
}

pub(crate) fn snapshot(state: &FederateState) -> Vec<SyncSnapshot> {
    state
        .sync_points
        .values()
        .filter(|p| matches!(p.state, SyncState::Announced | SyncState::Synchronized))
        .filter_map(|p| {
            Some(SyncSnapshot {
                label: p.label.clone(),
                registrant: p.registrant?,
                tag: p.tag.clone(),
                state: p.state,
                federates: p.required.iter().flatten().cloned().collect(),
                achieved: p.achieved.value.iter().cloned().collect(),
            })
        })
        .collect()
}

pub(crate) fn install_snapshot(state: &mut FederateState, snap: &SyncSnapshot) {
    let mut point = state
        .sync_points
        .get(&snap.label)
        .cloned()
        .unwrap_or_else(|| SyncPoint::placeholder(&snap.label));
    if point.state >= snap.state && point.state != SyncState::Unannounced {
        for f in snap.achieved.iter() {
            point.achieve(*f);
        }
    } else {
        point.registrant = Some(snap.registrant);
        point.tag = snap.tag.clone();
        point.state = snap.state;
        point.required = Some(snap.federates.iter().cloned().collect());
        point.awaiting = OrdSet::new();
        for f in snap.achieved.iter() {
            point.achieve(*f);
        }
    }
    state.sync_points.insert(snap.label.clone(), point);
}

fn fail_registration(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    label: &str,
    reason: String,
) {
    debug!("federate {} registration of {:?} failed: {}", state.handle, label, reason);
    ctx.callback(Callback::SyncRegistrationFailed {
        label: label.to_string(),
        reason,
    });
}

pub(crate) fn register(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    label: &str,
    tag: &[u8],
    federates: Option<&[FederateHandle]>,
) -> Result<()> {
    state.require_joined()?;
    if label.is_empty() {
        return Err(Violation::EmptySyncLabel.into());
    }
    let required: Option<OrdSet<FederateHandle>> = match federates {
        Some(fs) => {
            for f in fs {
                state.require_known(*f)?;
            }
            Some(fs.iter().cloned().collect())
        }
        None => None,
    };
    let mut point = SyncPoint::claim(label, state.handle, tag, required);
    if let Some(existing) = state.sync_points.get(label) {
        match existing.state {
            SyncState::Requested | SyncState::Announced => {
                return Err(Violation::SyncLabelInUse(label.to_string()).into())
            }
            // Reports that raced ahead of any announcement are kept.
            SyncState::Unannounced => point.achieved = existing.achieved.clone(),
            SyncState::Synchronized => (),
        }
    }
    point.awaiting = state.peers.keys().cloned().collect();
    debug!("federate {} registering sync point {:?}", state.handle, label);
    state.sync_points.insert(label.to_string(), point);
    let m = state.message(Payload::SyncRegistrationRequest {
        label: label.to_string(),
        tag: tag.to_vec(),
        federates: federates.map(|fs| fs.to_vec()),
    });
    ctx.broadcast(m);
    maybe_announce(state, ctx, label);
    Ok(())
}

// Registrant side: once nobody is left to answer, the label is ours.
fn maybe_announce(state: &mut FederateState, ctx: &mut MessageContext, label: &str) {
    let mut point = match state.sync_points.get(label) {
        Some(p)
            if p.state == SyncState::Requested
                && p.registrant == Some(state.handle)
                && p.awaiting.is_empty() =>
        {
            p.clone()
        }
        _ => return,
    };
    let required = point.required.clone().unwrap_or_else(|| state.members());
    point.state = SyncState::Announced;
    point.required = Some(required.clone());
    debug!(
        "federate {} announcing sync point {:?} for {}",
        state.handle,
        label,
        required.iter().join(",")
    );
    ctx.callback(Callback::SyncRegistrationSucceeded {
        label: label.to_string(),
    });
    if point.requires(state.handle) {
        ctx.callback(Callback::SyncPointAnnounced {
            label: label.to_string(),
            tag: point.tag.clone(),
        });
    }
    let m = state.message(Payload::SyncPointAnnounce {
        label: label.to_string(),
        tag: point.tag.clone(),
        federates: required.iter().cloned().collect(),
    });
    state.sync_points.insert(label.to_string(), point);
    ctx.broadcast(m);
    check_synchronized(state, ctx, label);
}

/// Fire the synchronized transition if the set has all reported. Edge
/// triggered: a point leaves `Announced` exactly once. The set is the one
/// announced, shrunk only by resignations; a member this federate has not
/// heard from yet still counts.
pub(crate) fn check_synchronized(state: &mut FederateState, ctx: &mut MessageContext, label: &str) {
    let point = match state.sync_points.get_mut(label) {
        Some(p) if p.state == SyncState::Announced => p,
        _ => return,
    };
    let complete = match &point.required {
        Some(required) => required.iter().all(|f| point.achieved.value.contains(f)),
        None => false,
    };
    if !complete {
        return;
    }
    point.state = SyncState::Synchronized;
    let local_required = point.requires(state.handle);
    debug!("federate {} sync point {:?} synchronized", state.handle, label);
    if local_required {
        ctx.callback(Callback::FederationSynchronized {
            label: label.to_string(),
        });
    }
}

pub(crate) fn achieve(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    label: &str,
) -> Result<()> {
    state.require_joined()?;
    let me = state.handle;
    let point = state
        .sync_points
        .get_mut(label)
        .filter(|p| p.state == SyncState::Announced || p.state == SyncState::Synchronized)
        .ok_or_else(|| Violation::SyncPointNotAnnounced(label.to_string()))?;
    if !point.requires(me) {
        return Err(Violation::NotInSyncSet(label.to_string()).into());
    }
    if !point.achieve(me) {
        trace!("federate {} already achieved {:?}", me, label);
        return Ok(());
    }
    let m = state.message(Payload::SyncPointAchieved {
        label: label.to_string(),
    });
    ctx.broadcast(m);
    check_synchronized(state, ctx, label);
    Ok(())
}

/// After a member leaves: it can no longer answer or achieve.
pub(crate) fn forget_member(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    federate: FederateHandle,
) {
    let labels: Vec<String> = state.sync_points.keys().cloned().collect();
    for label in labels {
        if let Some(p) = state.sync_points.get_mut(&label) {
            p.awaiting.remove(&federate);
            if p.state == SyncState::Requested && p.registrant == Some(federate) {
                state.sync_points.remove(&label);
                continue;
            }
            if let Some(required) = p.required.as_mut() {
                required.remove(&federate);
            }
        }
        maybe_announce(state, ctx, &label);
        check_synchronized(state, ctx, &label);
    }
}

fn on_register(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::SyncRegistrationRequest {
        label,
        tag,
        federates,
    } = ctx.request.payload.clone()
    {
        register(state, ctx, &label, &tag, federates.as_deref())?;
    }
    Ok(Verdict::Handled)
}

fn on_peer_register(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::SyncRegistrationRequest {
        label,
        tag,
        federates,
    } = ctx.request.payload.clone()
    {
        let required = federates.map(|fs| fs.into_iter().collect());
        let existing = state.sync_points.get(&label).cloned();
        let accepted = match existing {
            None => {
                state
                    .sync_points
                    .insert(label.clone(), SyncPoint::claim(&label, from, &tag, required));
                true
            }
            Some(p) => match (p.state, p.registrant) {
                (SyncState::Unannounced, _) | (SyncState::Synchronized, _) => {
                    let mut claim = SyncPoint::claim(&label, from, &tag, required);
                    if p.state == SyncState::Unannounced {
                        claim.achieved = p.achieved.clone();
                    }
                    state.sync_points.insert(label.clone(), claim);
                    true
                }
                (SyncState::Requested, Some(holder)) if holder == from => true,
                (SyncState::Requested, Some(holder)) if from < holder => {
                    let mut claim = SyncPoint::claim(&label, from, &tag, required);
                    claim.achieved = p.achieved.clone();
                    state.sync_points.insert(label.clone(), claim);
                    if holder == state.handle {
                        fail_registration(
                            state,
                            ctx,
                            &label,
                            Violation::SyncLabelInUse(label.clone()).to_string(),
                        );
                    }
                    true
                }
                _ => false,
            },
        };
        trace!(
            "federate {} {} registration of {:?} by {}",
            state.handle,
            if accepted { "accepts" } else { "rejects" },
            label,
            from
        );
        let m = state.message(Payload::SyncRegistrationResponse { label, accepted });
        ctx.unicast(from, m);
    }
    Ok(Verdict::Handled)
}

fn on_response(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    if let Payload::SyncRegistrationResponse { label, accepted } = ctx.request.payload.clone() {
        let me = state.handle;
        let point = match state.sync_points.get_mut(&label) {
            Some(p) if p.state == SyncState::Requested && p.registrant == Some(me) => p,
            _ => {
                trace!("federate {} ignoring stale response for {:?}", me, label);
                return Ok(Verdict::Handled);
            }
        };
        if accepted {
            point.awaiting.remove(&from);
            maybe_announce(state, ctx, &label);
        } else {
            state.sync_points.remove(&label);
            fail_registration(
                state,
                ctx,
                &label,
                Violation::SyncLabelInUse(label.clone()).to_string(),
            );
        }
    }
    Ok(Verdict::Handled)
}

fn on_announce(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::SyncPointAnnounce {
        label,
        tag,
        federates,
    } = ctx.request.payload.clone()
    {
        let mut point = state
            .sync_points
            .get(&label)
            .cloned()
            .unwrap_or_else(|| SyncPoint::placeholder(&label));
        if matches!(point.state, SyncState::Announced | SyncState::Synchronized)
            && point.registrant == Some(from)
        {
            return Ok(Verdict::Handled);
        }
        let required: OrdSet<FederateHandle> = federates
            .into_iter()
            .filter(|f| !state.departed.contains(f))
            .collect();
        point.registrant = Some(from);
        point.tag = tag.clone();
        point.state = SyncState::Announced;
        point.awaiting = OrdSet::new();
        // Reports from outside the set never count.
        let counted = point.achieved.value.clone().intersection(required.clone());
        point.achieved = AchievedLE::new_from(counted);
        point.required = Some(required);
        let local_required = point.requires(state.handle);
        state.sync_points.insert(label.clone(), point);
        debug!("federate {} sync point {:?} announced by {}", state.handle, label, from);
        if local_required {
            ctx.callback(Callback::SyncPointAnnounced {
                label: label.clone(),
                tag,
            });
        }
        check_synchronized(state, ctx, &label);
    }
    Ok(Verdict::Handled)
}

fn on_achieve(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::SyncPointAchieved { label } = ctx.request.payload.clone() {
        achieve(state, ctx, &label)?;
    }
    Ok(Verdict::Handled)
}

fn on_peer_achieve(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::SyncPointAchieved { label } = ctx.request.payload.clone() {
        let point = state
            .sync_points
            .entry(label.clone())
            .or_insert_with(|| SyncPoint::placeholder(&label));
        if point.required.is_some() && !point.requires(from) {
            trace!(
                "federate {} ignoring achieve of {:?} by outsider {}",
                state.handle,
                label,
                from
            );
            return Ok(Verdict::Handled);
        }
        if point.achieve(from) {
            check_synchronized(state, ctx, &label);
        }
    }
    Ok(Verdict::Handled)
}

pub(crate) fn handlers() -> Vec<Box<dyn Handler>> {
    use MessageKind::*;
    vec![
        ServiceHandler::new("sync.register", SyncRegistrationRequest, Side::Outgoing, on_register),
        ServiceHandler::new(
            "sync.register.peer",
            SyncRegistrationRequest,
            Side::Incoming,
            on_peer_register,
        ),
        ServiceHandler::new("sync.response", SyncRegistrationResponse, Side::Incoming, on_response),
        ServiceHandler::new("sync.announce", SyncPointAnnounce, Side::Incoming, on_announce),
        ServiceHandler::new("sync.achieve", SyncPointAchieved, Side::Outgoing, on_achieve),
        ServiceHandler::new(
            "sync.achieve.peer",
            SyncPointAchieved,
            Side::Incoming,
            on_peer_achieve,
        ),
    ]
}
