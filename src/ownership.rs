// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Attribute ownership transfer.
//!
//! Who owns a key is a claim `(epoch, owner)` held in a max-lattice, so
//! reports from different peers can be merged in any order and still land
//! on the same answer. Every transfer writes a claim one epoch above the
//! one it replaces. The current owner is the arbiter for negotiated
//! transfers: it accepts at most one pending transfer per key and rejects
//! anything else outright, which leaves retrying to the requester.

use crate::pipeline::Handler;
use crate::{
    AttributeHandle, AttributeKey, Callback, FederateHandle, FederateState, MessageContext,
    MessageKind, ObjectHandle, Payload, Response, Result, ServiceHandler, Side, Verdict,
    Violation,
};
use itertools::Itertools;
use pergola::{LatticeElt, MaxDef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// A statement that `owner` holds a key as of `epoch`. A later epoch always
/// wins; two claims in the same epoch are broken towards the lower federate
/// handle, and any owner beats "unowned".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnershipClaim {
    pub epoch: u64,
    pub owner: Option<FederateHandle>,
}

impl OwnershipClaim {
    pub fn succeed(&self, owner: Option<FederateHandle>) -> OwnershipClaim {
        OwnershipClaim {
            epoch: self.epoch + 1,
            owner,
        }
    }
}

// Manually implement Ord since #[derive(Ord)] would prefer higher handles.
impl Ord for OwnershipClaim {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch.cmp(&other.epoch).then_with(|| match (self.owner, other.owner) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => b.cmp(&a),
        })
    }
}

impl PartialOrd for OwnershipClaim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// The default claim (epoch 0, unowned) is below every real claim.
impl pergola::MaxUnitDefault for OwnershipClaim {}

pub type ClaimLD = MaxDef<OwnershipClaim>;
pub type ClaimLE = LatticeElt<ClaimLD>;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Pending {
    None,
    Acquire { by: FederateHandle, tag: Vec<u8> },
    Divest,
}

impl Default for Pending {
    fn default() -> Self {
        Pending::None
    }
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub claim: ClaimLE,
    pub pending: Pending,
}

/// The per-key state machine, as seen from one federate.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum OwnershipState {
    Unowned,
    Owned(FederateHandle),
    PendingAcquire {
        owner: Option<FederateHandle>,
        by: FederateHandle,
    },
    PendingDivest(FederateHandle),
}

impl OwnershipRecord {
    pub fn owner(&self) -> Option<FederateHandle> {
        self.claim.value.owner
    }

    pub fn state(&self) -> OwnershipState {
        match (&self.pending, self.owner()) {
            (Pending::Acquire { by, .. }, owner) => {
                OwnershipState::PendingAcquire { owner, by: *by }
            }
            (Pending::Divest, Some(o)) => OwnershipState::PendingDivest(o),
            (_, Some(o)) => OwnershipState::Owned(o),
            (_, None) => OwnershipState::Unowned,
        }
    }

    fn merge(&mut self, claim: OwnershipClaim) {
        let joined = self.claim.clone() + &ClaimLE::new_from(claim);
        self.claim = joined;
    }
}

fn attrs(keys: &[AttributeKey]) -> Vec<AttributeHandle> {
    keys.iter().map(|k| k.attribute).collect()
}

// Record new claims locally and tell everyone.
fn publish_claims(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    claims: Vec<(AttributeHandle, OwnershipClaim)>,
) {
    for (a, c) in claims.iter() {
        let key = AttributeKey::new(object, *a);
        let mut rec = state.record(&key);
        rec.merge(*c);
        rec.pending = Pending::None;
        state.ownership.insert(key, rec);
    }
    let m = state.message(Payload::OwnershipChanged { object, claims });
    ctx.broadcast(m);
}

fn claim_all(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    keys: &[AttributeKey],
) {
    let me = Some(state.handle);
    let claims = keys
        .iter()
        .map(|k| (k.attribute, state.record(k).claim.value.succeed(me)))
        .collect();
    publish_claims(state, ctx, object, claims);
    debug!(
        "federate {} acquired {} of {}",
        state.handle,
        keys.iter().map(|k| k.attribute).join(","),
        object
    );
    ctx.callback(Callback::OwnershipAcquired {
        object,
        attributes: attrs(keys),
    });
}

/// True, with ownership taken on the spot, when every key is unowned and
/// free of pending transfers; false, with nothing changed, otherwise.
pub(crate) fn acquire_if_available(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    attributes: &[AttributeHandle],
) -> Result<bool> {
    state.require_joined()?;
    let keys = state.keys(object, attributes)?;
    state.require_published(&keys)?;
    for k in keys.iter() {
        if state.record(k).owner() == Some(state.handle) {
            return Err(Violation::AttributeAlreadyOwned(*k).into());
        }
    }
    let available = keys
        .iter()
        .all(|k| state.ownership_state(*k) == OwnershipState::Unowned);
    if available {
        claim_all(state, ctx, object, &keys);
    } else {
        trace!("federate {} found {} unavailable", state.handle, object);
    }
    Ok(available)
}

pub(crate) fn acquire_negotiated(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    attributes: &[AttributeHandle],
    tag: &[u8],
) -> Result<()> {
    state.require_joined()?;
    let keys = state.keys(object, attributes)?;
    state.require_published(&keys)?;
    for k in keys.iter() {
        let rec = state.record(k);
        if rec.owner() == Some(state.handle) {
            return Err(Violation::AttributeAlreadyOwned(*k).into());
        }
        if rec.pending != Pending::None {
            return Err(Violation::TransferPending(*k).into());
        }
    }
    let (free, owned): (Vec<AttributeKey>, Vec<AttributeKey>) =
        keys.iter().copied().partition(|k| state.record(k).owner().is_none());
    if !free.is_empty() {
        claim_all(state, ctx, object, &free);
    }
    let by_owner: BTreeMap<FederateHandle, Vec<AttributeKey>> = owned
        .into_iter()
        .filter_map(|k| state.record(&k).owner().map(|o| (o, k)))
        .into_group_map()
        .into_iter()
        .collect();
    for (owner, keys) in by_owner {
        for k in keys.iter() {
            let mut rec = state.record(k);
            rec.pending = Pending::Acquire {
                by: state.handle,
                tag: tag.to_vec(),
            };
            state.ownership.insert(*k, rec);
        }
        debug!(
            "federate {} asking {} to release {} of {}",
            state.handle,
            owner,
            keys.iter().map(|k| k.attribute).join(","),
            object
        );
        let m = state.message(Payload::AttributeAcquire {
            object,
            attributes: attrs(&keys),
            if_available: false,
            tag: tag.to_vec(),
        });
        ctx.unicast(owner, m);
    }
    Ok(())
}

// The owner's side of a negotiated acquisition.
fn arbitrate(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    attributes: &[AttributeHandle],
    tag: &[u8],
) -> Result<()> {
    let by = ctx.source();
    state.require_known(by)?;
    let reject = |state: &FederateState, ctx: &mut MessageContext, reason: String| {
        debug!("federate {} rejecting acquisition by {}: {}", state.handle, by, reason);
        let m = state.message(Payload::AcquisitionRejected {
            object,
            attributes: attributes.to_vec(),
            reason,
        });
        ctx.unicast(by, m);
    };
    let keys = match state.keys(object, attributes) {
        Ok(keys) => keys,
        Err(e) => {
            reject(state, ctx, e.to_string());
            return Ok(());
        }
    };
    for k in keys.iter() {
        let rec = state.record(k);
        if rec.owner() != Some(state.handle) {
            reject(state, ctx, Violation::AttributeNotOwned(*k).to_string());
            return Ok(());
        }
        if rec.pending != Pending::None {
            reject(state, ctx, Violation::TransferPending(*k).to_string());
            return Ok(());
        }
    }
    for k in keys.iter() {
        let mut rec = state.record(k);
        rec.pending = Pending::Acquire {
            by,
            tag: tag.to_vec(),
        };
        state.ownership.insert(*k, rec);
    }
    ctx.callback(Callback::ReleaseRequested {
        object,
        attributes: attrs(&keys),
        by,
        tag: tag.to_vec(),
    });
    Ok(())
}

pub(crate) fn release(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    attributes: &[AttributeHandle],
) -> Result<()> {
    state.require_joined()?;
    let keys = state.keys(object, attributes)?;
    let mut to: BTreeMap<FederateHandle, Vec<(AttributeHandle, OwnershipClaim)>> = BTreeMap::new();
    for k in keys.iter() {
        let rec = state.record(k);
        match (&rec.pending, rec.owner()) {
            (Pending::Acquire { by, .. }, Some(o)) if o == state.handle && *by != state.handle => {
                to.entry(*by)
                    .or_default()
                    .push((k.attribute, rec.claim.value.succeed(Some(*by))));
            }
            _ => return Err(Violation::NoPendingAcquisition(*k).into()),
        }
    }
    for (by, claims) in to {
        debug!("federate {} releasing to {} on {}", state.handle, by, object);
        publish_claims(state, ctx, object, claims);
    }
    Ok(())
}

pub(crate) fn divest(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    attributes: &[AttributeHandle],
) -> Result<()> {
    state.require_joined()?;
    let keys = state.keys(object, attributes)?;
    for k in keys.iter() {
        let rec = state.record(k);
        if rec.owner() != Some(state.handle) {
            return Err(Violation::AttributeNotOwned(*k).into());
        }
        if rec.pending != Pending::None {
            return Err(Violation::TransferPending(*k).into());
        }
    }
    for k in keys.iter() {
        let mut rec = state.record(k);
        rec.pending = Pending::Divest;
        state.ownership.insert(*k, rec);
    }
    ctx.callback(Callback::DivestitureConfirmationRequested {
        object,
        attributes: attrs(&keys),
    });
    Ok(())
}

pub(crate) fn confirm_divestiture(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    attributes: &[AttributeHandle],
) -> Result<()> {
    state.require_joined()?;
    let keys = state.keys(object, attributes)?;
    let mut claims = Vec::with_capacity(keys.len());
    for k in keys.iter() {
        let rec = state.record(k);
        if rec.pending != Pending::Divest {
            return Err(Violation::NoPendingDivestiture(*k).into());
        }
        claims.push((k.attribute, rec.claim.value.succeed(None)));
    }
    publish_claims(state, ctx, object, claims);
    debug!("federate {} divested {}", state.handle, object);
    ctx.callback(Callback::OwnershipDivested {
        object,
        attributes: attrs(&keys),
    });
    Ok(())
}

/// Give up keys this federate owns without waiting for anyone to take
/// them. The caller checks ownership.
pub(crate) fn relinquish(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    keys: &[AttributeKey],
) {
    let claims = keys
        .iter()
        .map(|k| (k.attribute, state.record(k).claim.value.succeed(None)))
        .collect();
    publish_claims(state, ctx, object, claims);
    debug!(
        "federate {} relinquished {} of {}",
        state.handle,
        keys.iter().map(|k| k.attribute).join(","),
        object
    );
    ctx.callback(Callback::OwnershipDivested {
        object,
        attributes: attrs(keys),
    });
}

/// Fold ownership claims from a peer into the local table, then settle
/// anything this federate was waiting on for those keys.
pub(crate) fn apply_claims(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    object: ObjectHandle,
    claims: &[(AttributeHandle, OwnershipClaim)],
) {
    if state.deleted_objects.contains(&object) {
        trace!("federate {} ignoring claims on deleted {}", state.handle, object);
        return;
    }
    let me = state.handle;
    let mut gained = Vec::new();
    let mut lost = Vec::new();
    let mut passed = Vec::new();
    let mut freed = Vec::new();
    for (a, c) in claims.iter() {
        let key = AttributeKey::new(object, *a);
        let mut rec = state.record(&key);
        let before = rec.owner();
        rec.merge(*c);
        let after = rec.owner();
        if before != after {
            match &rec.pending {
                Pending::Acquire { by, .. } if *by == me => {
                    if after == Some(me) {
                        rec.pending = Pending::None;
                    } else if after.is_none() {
                        freed.push(key);
                    } else {
                        rec.pending = Pending::None;
                        passed.push(*a);
                    }
                }
                _ => rec.pending = Pending::None,
            }
            if after == Some(me) {
                gained.push(*a);
            } else if before == Some(me) {
                lost.push(*a);
            }
        }
        state.ownership.insert(key, rec);
    }
    if !gained.is_empty() {
        debug!("federate {} now owns {} of {}", me, gained.iter().join(","), object);
        ctx.callback(Callback::OwnershipAcquired {
            object,
            attributes: gained,
        });
    }
    if !lost.is_empty() {
        debug!("federate {} lost {} of {}", me, lost.iter().join(","), object);
        ctx.callback(Callback::OwnershipRevoked {
            object,
            attributes: lost,
        });
    }
    if !passed.is_empty() {
        ctx.callback(Callback::AcquisitionRejected {
            object,
            attributes: passed,
            reason: "ownership passed to another federate".into(),
        });
    }
    // A key we were waiting for went free: take it.
    if !freed.is_empty() {
        claim_all(state, ctx, object, &freed);
    }
}

/// Make every key held by `federate` unowned, as each peer would on its
/// own when that federate resigns releasing its attributes.
pub(crate) fn release_all_of(
    state: &mut FederateState,
    ctx: &mut MessageContext,
    federate: FederateHandle,
) {
    let held: Vec<(AttributeKey, OwnershipClaim)> = state
        .ownership
        .iter()
        .filter(|(_, r)| r.owner() == Some(federate))
        .map(|(k, r)| (*k, r.claim.value.succeed(None)))
        .collect();
    let grouped = held
        .into_iter()
        .map(|(k, c)| (k.object, (k.attribute, c)))
        .into_group_map();
    for (object, claims) in grouped.into_iter().sorted_by_key(|(o, _)| *o) {
        apply_claims(state, ctx, object, &claims);
    }
}

/// Drop pending transfers that were waiting on `federate`.
pub(crate) fn forget_requests_of(state: &mut FederateState, federate: FederateHandle) {
    let stale: Vec<AttributeKey> = state
        .ownership
        .iter()
        .filter(|(_, r)| matches!(r.pending, Pending::Acquire { by, .. } if by == federate))
        .map(|(k, _)| *k)
        .collect();
    for k in stale {
        let mut rec = state.record(&k);
        rec.pending = Pending::None;
        state.ownership.insert(k, rec);
    }
}

fn on_acquire(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::AttributeAcquire {
        object,
        attributes,
        if_available,
        tag,
    } = ctx.request.payload.clone()
    {
        if if_available {
            let got = acquire_if_available(state, ctx, object, &attributes)?;
            ctx.respond(Response::Acquired(got));
        } else {
            acquire_negotiated(state, ctx, object, &attributes, &tag)?;
        }
    }
    Ok(Verdict::Handled)
}

fn on_peer_acquire(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::AttributeAcquire {
        object,
        attributes,
        if_available,
        tag,
    } = ctx.request.payload.clone()
    {
        if if_available {
            // Settled by the requester alone; peers only see the claims.
            return Ok(Verdict::Vetoed("if-available acquisitions are local"));
        }
        arbitrate(state, ctx, object, &attributes, &tag)?;
    }
    Ok(Verdict::Handled)
}

fn on_release(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::AttributeRelease { object, attributes } = ctx.request.payload.clone() {
        release(state, ctx, object, &attributes)?;
    }
    Ok(Verdict::Handled)
}

fn on_divest(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::AttributeDivest {
        object,
        attributes,
        confirm,
    } = ctx.request.payload.clone()
    {
        if confirm {
            confirm_divestiture(state, ctx, object, &attributes)?;
        } else {
            divest(state, ctx, object, &attributes)?;
        }
    }
    Ok(Verdict::Handled)
}

fn on_query(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::QueryAttributeOwnership { object, attribute } = ctx.request.payload {
        state.require_joined()?;
        for k in state.keys(object, &[attribute])? {
            let owner = state.record(&k).owner();
            ctx.callback(Callback::AttributeOwnershipInformed {
                object,
                attribute,
                owner,
            });
        }
    }
    Ok(Verdict::Handled)
}

fn on_changed(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    let from = ctx.source();
    state.require_known(from)?;
    if let Payload::OwnershipChanged { object, claims } = ctx.request.payload.clone() {
        apply_claims(state, ctx, object, &claims);
    }
    Ok(Verdict::Handled)
}

fn on_rejected(ctx: &mut MessageContext, state: &mut FederateState) -> Result<Verdict> {
    if let Payload::AcquisitionRejected {
        object,
        attributes,
        reason,
    } = ctx.request.payload.clone()
    {
        let me = state.handle;
        let mut cleared = Vec::new();
        for a in attributes.iter() {
            let key = AttributeKey::new(object, *a);
            let mut rec = state.record(&key);
            if matches!(rec.pending, Pending::Acquire { by, .. } if by == me) {
                rec.pending = Pending::None;
                state.ownership.insert(key, rec);
                cleared.push(*a);
            }
        }
        if !cleared.is_empty() {
            ctx.callback(Callback::AcquisitionRejected {
                object,
                attributes: cleared,
                reason,
            });
        }
    }
    Ok(Verdict::Handled)
}

pub(crate) fn handlers() -> Vec<Box<dyn Handler>> {
    use MessageKind::*;
    vec![
        ServiceHandler::new("ownership.acquire", AttributeAcquire, Side::Outgoing, on_acquire),
        ServiceHandler::new(
            "ownership.acquire.peer",
            AttributeAcquire,
            Side::Incoming,
            on_peer_acquire,
        ),
        ServiceHandler::new("ownership.release", AttributeRelease, Side::Outgoing, on_release),
        ServiceHandler::new("ownership.divest", AttributeDivest, Side::Outgoing, on_divest),
        ServiceHandler::new("ownership.query", QueryAttributeOwnership, Side::Outgoing, on_query),
        ServiceHandler::new("ownership.changed", OwnershipChanged, Side::Incoming, on_changed),
        ServiceHandler::new("ownership.rejected", AcquisitionRejected, Side::Incoming, on_rejected),
    ]
}
