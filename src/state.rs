// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    AttributeHandle, AttributeKey, Error, FederateHandle, Interests, LbtsLE, Lookahead,
    LogicalTime, Message, ObjectClassHandle, ObjectHandle, ObjectModel, OwnershipRecord,
    OwnershipState, Payload, Result, SyncPoint, SyncState, TimeStatus, Violation,
};
use im::{OrdMap, OrdSet};
use std::sync::Arc;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: Option<String>, // Unknown until the peer's role call arrives.
    pub status: TimeStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectRecord {
    pub class: ObjectClassHandle,
}

/// The ground truth of one federate: its own time status, a replica of
/// every peer's, the ownership table, the known sync points and the object
/// instances it knows about. Handlers get `&mut` access for exactly one
/// dispatch and never keep references past it.
///
/// Every collection is an `im` persistent structure, so the pipeline can
/// take a snapshot before a handler runs and put it back if the handler
/// vetoes or fails. That is what makes each transition all-or-nothing.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FederateState {
    pub handle: FederateHandle,
    pub(crate) name: String,
    pub(crate) federation: Option<String>,
    pub(crate) model: Arc<ObjectModel>,
    pub(crate) joined: bool,

    pub(crate) time: TimeStatus,
    pub(crate) peers: OrdMap<FederateHandle, PeerRecord>,
    pub(crate) awaiting_role_call: OrdSet<FederateHandle>,
    // Handles are never reused, so a resigned federate stays gone.
    pub(crate) departed: OrdSet<FederateHandle>,
    pub(crate) lbts: LbtsLE,
    // While enabling regulation: peers yet to report the floor they hold
    // us to, and the highest floor reported so far.
    pub(crate) regulation_awaiting: OrdSet<FederateHandle>,
    pub(crate) regulation_floor: LogicalTime,

    pub(crate) interests: Interests,
    pub(crate) objects: OrdMap<ObjectHandle, ObjectRecord>,
    pub(crate) deleted_objects: OrdSet<ObjectHandle>,
    // Peers' objects the application has been told about.
    pub(crate) discovered: OrdSet<ObjectHandle>,
    pub(crate) next_object_serial: u32,
    pub(crate) ownership: OrdMap<AttributeKey, OwnershipRecord>,

    pub(crate) sync_points: OrdMap<String, SyncPoint>,
}

impl FederateState {
    pub fn new(handle: FederateHandle, name: &str, lookahead: Lookahead) -> Self {
        FederateState {
            handle,
            name: name.to_string(),
            federation: None,
            model: Arc::new(ObjectModel::default()),
            joined: false,
            time: TimeStatus::new(lookahead),
            peers: OrdMap::new(),
            awaiting_role_call: OrdSet::new(),
            departed: OrdSet::new(),
            lbts: LbtsLE::default(),
            regulation_awaiting: OrdSet::new(),
            regulation_floor: LogicalTime::ZERO,
            interests: Interests::default(),
            objects: OrdMap::new(),
            deleted_objects: OrdSet::new(),
            discovered: OrdSet::new(),
            next_object_serial: 1,
            ownership: OrdMap::new(),
            sync_points: OrdMap::new(),
        }
    }

    /// A fresh message from this federate.
    pub fn message(&self, payload: Payload) -> Message {
        Message::new(self.handle, payload)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn federation(&self) -> Option<&str> {
        self.federation.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn join_complete(&self) -> bool {
        self.joined && self.awaiting_role_call.is_empty()
    }

    pub fn time_status(&self) -> &TimeStatus {
        &self.time
    }

    pub fn current_time(&self) -> LogicalTime {
        self.time.current
    }

    /// The local view of federation LBTS.
    pub fn lbts(&self) -> LogicalTime {
        self.lbts.value
    }

    pub fn peer_status(&self, peer: FederateHandle) -> Option<&TimeStatus> {
        self.peers.get(&peer).map(|p| &p.status)
    }

    pub fn knows(&self, federate: FederateHandle) -> bool {
        federate == self.handle || self.peers.contains_key(&federate)
    }

    /// Every federate this one believes is joined, itself included.
    pub fn members(&self) -> OrdSet<FederateHandle> {
        let mut m: OrdSet<FederateHandle> = self.peers.keys().cloned().collect();
        m.insert(self.handle);
        m
    }

    pub fn owner(
        &self,
        object: ObjectHandle,
        attribute: AttributeHandle,
    ) -> Option<FederateHandle> {
        self.ownership
            .get(&AttributeKey::new(object, attribute))
            .and_then(|r| r.owner())
    }

    pub fn ownership_state(&self, key: AttributeKey) -> OwnershipState {
        self.ownership
            .get(&key)
            .map(|r| r.state())
            .unwrap_or(OwnershipState::Unowned)
    }

    pub fn knows_object(&self, object: ObjectHandle) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn interests(&self) -> &Interests {
        &self.interests
    }

    pub fn has_discovered(&self, object: ObjectHandle) -> bool {
        self.discovered.contains(&object)
    }

    pub fn sync_state(&self, label: &str) -> Option<SyncState> {
        self.sync_points.get(label).map(|s| s.state)
    }

    pub(crate) fn require_joined(&self) -> Result<()> {
        if self.joined {
            Ok(())
        } else {
            Err(Error::NotJoined)
        }
    }

    pub(crate) fn require_known(&self, federate: FederateHandle) -> Result<()> {
        if self.knows(federate) {
            Ok(())
        } else {
            Err(Violation::UnknownFederate(federate).into())
        }
    }

    pub(crate) fn alloc_object(&mut self) -> Result<ObjectHandle> {
        let serial = self.next_object_serial;
        self.next_object_serial = serial
            .checked_add(1)
            .ok_or(Violation::ObjectHandlesExhausted)?;
        Ok(ObjectHandle::compose(self.handle, serial))
    }

    /// Resolve `attributes` of `object` into ownership keys, checking them
    /// against the object's class.
    pub(crate) fn keys(
        &self,
        object: ObjectHandle,
        attributes: &[AttributeHandle],
    ) -> Result<Vec<AttributeKey>> {
        if attributes.is_empty() {
            return Err(Violation::EmptyAttributeSet.into());
        }
        let rec = self
            .objects
            .get(&object)
            .ok_or(Violation::UnknownObject(object))?;
        let class = self
            .model
            .object_class(rec.class)
            .ok_or_else(|| Violation::NotInModel(rec.class.to_string()))?;
        let mut keys = Vec::with_capacity(attributes.len());
        for a in attributes {
            if !class.attributes.contains_key(a) {
                return Err(Violation::NotInModel(format!("{} of {}", a, class.name)).into());
            }
            let k = AttributeKey::new(object, *a);
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        Ok(keys)
    }

    /// Only published attributes may be owned.
    pub(crate) fn require_published(&self, keys: &[AttributeKey]) -> Result<()> {
        for k in keys {
            let class = self
                .objects
                .get(&k.object)
                .map(|r| r.class)
                .ok_or(Violation::UnknownObject(k.object))?;
            if !self.interests.publishes(class, k.attribute) {
                return Err(Violation::AttributeNotPublished(class, k.attribute).into());
            }
        }
        Ok(())
    }

    pub(crate) fn record(&self, key: &AttributeKey) -> OwnershipRecord {
        self.ownership.get(key).cloned().unwrap_or_default()
    }

    /// Attribute keys this federate currently holds.
    pub fn owned_keys(&self) -> Vec<AttributeKey> {
        self.ownership
            .iter()
            .filter(|(_, r)| r.owner() == Some(self.handle))
            .map(|(k, _)| *k)
            .collect()
    }
}
