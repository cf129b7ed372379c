// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    AttributeHandle, FederateHandle, InteractionClassHandle, Interest, LogicalTime, Lookahead,
    ObjectClassHandle, ObjectHandle, ObjectModel, OwnershipClaim, ParameterHandle, Result,
    SyncSnapshot, TimeStatus, Violation,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Discriminates the payload variants. The handler registry is keyed on this.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    CreateFederation,
    JoinFederation,
    RoleCall,
    ResignFederation,
    TimeAdvanceRequest,
    TimeAdvanceGrant,
    ModifyLookahead,
    FederationLbts,
    EnableTimeRegulation,
    DisableTimeRegulation,
    RegulationFloor,
    EnableTimeConstrained,
    DisableTimeConstrained,
    DeclareObjectClass,
    WithdrawObjectClass,
    DeclareInteractionClass,
    WithdrawInteractionClass,
    RegisterObject,
    DeleteObject,
    UpdateAttributes,
    SendInteraction,
    RequestObjectUpdate,
    AttributeAcquire,
    AttributeRelease,
    AttributeDivest,
    OwnershipChanged,
    AcquisitionRejected,
    QueryAttributeOwnership,
    SyncRegistrationRequest,
    SyncRegistrationResponse,
    SyncPointAnnounce,
    SyncPointAchieved,
}

impl MessageKind {
    pub const ALL: [MessageKind; 32] = [
        MessageKind::CreateFederation,
        MessageKind::JoinFederation,
        MessageKind::RoleCall,
        MessageKind::ResignFederation,
        MessageKind::TimeAdvanceRequest,
        MessageKind::TimeAdvanceGrant,
        MessageKind::ModifyLookahead,
        MessageKind::FederationLbts,
        MessageKind::EnableTimeRegulation,
        MessageKind::DisableTimeRegulation,
        MessageKind::RegulationFloor,
        MessageKind::EnableTimeConstrained,
        MessageKind::DisableTimeConstrained,
        MessageKind::DeclareObjectClass,
        MessageKind::WithdrawObjectClass,
        MessageKind::DeclareInteractionClass,
        MessageKind::WithdrawInteractionClass,
        MessageKind::RegisterObject,
        MessageKind::DeleteObject,
        MessageKind::UpdateAttributes,
        MessageKind::SendInteraction,
        MessageKind::RequestObjectUpdate,
        MessageKind::AttributeAcquire,
        MessageKind::AttributeRelease,
        MessageKind::AttributeDivest,
        MessageKind::OwnershipChanged,
        MessageKind::AcquisitionRejected,
        MessageKind::QueryAttributeOwnership,
        MessageKind::SyncRegistrationRequest,
        MessageKind::SyncRegistrationResponse,
        MessageKind::SyncPointAnnounce,
        MessageKind::SyncPointAchieved,
    ];
}

/// What a resigning federate wants done with the things it leaves behind.
/// Travels as a raw code so that bad codes can be reported, not just
/// refused by the decoder.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResignAction {
    ReleaseAttributes,
    DeleteObjects,
    DeleteObjectsAndReleaseAttributes,
    NoAction,
}

impl ResignAction {
    pub fn code(self) -> u8 {
        match self {
            ResignAction::ReleaseAttributes => 1,
            ResignAction::DeleteObjects => 2,
            ResignAction::DeleteObjectsAndReleaseAttributes => 3,
            ResignAction::NoAction => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<ResignAction> {
        match code {
            1 => Ok(ResignAction::ReleaseAttributes),
            2 => Ok(ResignAction::DeleteObjects),
            3 => Ok(ResignAction::DeleteObjectsAndReleaseAttributes),
            4 => Ok(ResignAction::NoAction),
            c => Err(Violation::InvalidResignAction(c).into()),
        }
    }

    pub fn releases_attributes(self) -> bool {
        matches!(
            self,
            ResignAction::ReleaseAttributes | ResignAction::DeleteObjectsAndReleaseAttributes
        )
    }

    pub fn deletes_objects(self) -> bool {
        matches!(
            self,
            ResignAction::DeleteObjects | ResignAction::DeleteObjectsAndReleaseAttributes
        )
    }
}

/// Everything an existing member tells a newcomer about itself, so the
/// newcomer can rebuild its replicas without a central snapshot service.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCall {
    pub federate_name: String,
    pub status: TimeStatus,
    // The bound the sender assumed for the newcomer when it joined; the
    // newcomer adopts the largest of these as its own floor.
    pub newcomer_floor: LogicalTime,
    pub objects: Vec<(ObjectHandle, ObjectClassHandle)>,
    pub claims: Vec<(ObjectHandle, AttributeHandle, OwnershipClaim)>,
    pub sync_points: Vec<SyncSnapshot>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    CreateFederation {
        federation: String,
        model: ObjectModel,
    },
    JoinFederation {
        federation: String,
        federate_name: String,
        status: TimeStatus,
    },
    RoleCall(RoleCall),
    // The raw resign-action code; it is validated by the handler since it
    // may arrive from a peer speaking a different dialect.
    ResignFederation {
        action: u8,
    },

    TimeAdvanceRequest {
        time: LogicalTime,
    },
    TimeAdvanceGrant {
        time: LogicalTime,
    },
    ModifyLookahead {
        lookahead: Lookahead,
    },
    FederationLbts {
        lbts: LogicalTime,
    },
    EnableTimeRegulation {
        lookahead: Lookahead,
    },
    DisableTimeRegulation,
    // A peer's answer to `EnableTimeRegulation`: the least time the new
    // regulator may still send at.
    RegulationFloor {
        floor: LogicalTime,
    },
    EnableTimeConstrained,
    DisableTimeConstrained,

    DeclareObjectClass {
        interest: Interest,
        class: ObjectClassHandle,
        attributes: Vec<AttributeHandle>,
    },
    WithdrawObjectClass {
        interest: Interest,
        class: ObjectClassHandle,
    },
    DeclareInteractionClass {
        interest: Interest,
        class: InteractionClassHandle,
    },
    WithdrawInteractionClass {
        interest: Interest,
        class: InteractionClassHandle,
    },

    RegisterObject {
        object: ObjectHandle,
        class: ObjectClassHandle,
        attributes: Vec<AttributeHandle>,
    },
    DeleteObject {
        object: ObjectHandle,
        tag: Vec<u8>,
    },
    UpdateAttributes {
        object: ObjectHandle,
        values: BTreeMap<AttributeHandle, Vec<u8>>,
        tag: Vec<u8>,
    },
    SendInteraction {
        class: InteractionClassHandle,
        parameters: BTreeMap<ParameterHandle, Vec<u8>>,
        tag: Vec<u8>,
    },
    RequestObjectUpdate {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },

    AttributeAcquire {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
        if_available: bool,
        tag: Vec<u8>,
    },
    AttributeRelease {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },
    AttributeDivest {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
        confirm: bool,
    },
    OwnershipChanged {
        object: ObjectHandle,
        claims: Vec<(AttributeHandle, OwnershipClaim)>,
    },
    AcquisitionRejected {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
        reason: String,
    },
    QueryAttributeOwnership {
        object: ObjectHandle,
        attribute: AttributeHandle,
    },

    SyncRegistrationRequest {
        label: String,
        tag: Vec<u8>,
        federates: Option<Vec<FederateHandle>>,
    },
    SyncRegistrationResponse {
        label: String,
        accepted: bool,
    },
    // Announcements always name the synchronization set explicitly, so
    // every federate agrees on it whatever joins later.
    SyncPointAnnounce {
        label: String,
        tag: Vec<u8>,
        federates: Vec<FederateHandle>,
    },
    SyncPointAchieved {
        label: String,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::CreateFederation { .. } => MessageKind::CreateFederation,
            Payload::JoinFederation { .. } => MessageKind::JoinFederation,
            Payload::RoleCall(..) => MessageKind::RoleCall,
            Payload::ResignFederation { .. } => MessageKind::ResignFederation,
            Payload::TimeAdvanceRequest { .. } => MessageKind::TimeAdvanceRequest,
            Payload::TimeAdvanceGrant { .. } => MessageKind::TimeAdvanceGrant,
            Payload::ModifyLookahead { .. } => MessageKind::ModifyLookahead,
            Payload::FederationLbts { .. } => MessageKind::FederationLbts,
            Payload::EnableTimeRegulation { .. } => MessageKind::EnableTimeRegulation,
            Payload::DisableTimeRegulation => MessageKind::DisableTimeRegulation,
            Payload::RegulationFloor { .. } => MessageKind::RegulationFloor,
            Payload::EnableTimeConstrained => MessageKind::EnableTimeConstrained,
            Payload::DisableTimeConstrained => MessageKind::DisableTimeConstrained,
            Payload::DeclareObjectClass { .. } => MessageKind::DeclareObjectClass,
            Payload::WithdrawObjectClass { .. } => MessageKind::WithdrawObjectClass,
            Payload::DeclareInteractionClass { .. } => MessageKind::DeclareInteractionClass,
            Payload::WithdrawInteractionClass { .. } => MessageKind::WithdrawInteractionClass,
            Payload::RegisterObject { .. } => MessageKind::RegisterObject,
            Payload::DeleteObject { .. } => MessageKind::DeleteObject,
            Payload::UpdateAttributes { .. } => MessageKind::UpdateAttributes,
            Payload::SendInteraction { .. } => MessageKind::SendInteraction,
            Payload::RequestObjectUpdate { .. } => MessageKind::RequestObjectUpdate,
            Payload::AttributeAcquire { .. } => MessageKind::AttributeAcquire,
            Payload::AttributeRelease { .. } => MessageKind::AttributeRelease,
            Payload::AttributeDivest { .. } => MessageKind::AttributeDivest,
            Payload::OwnershipChanged { .. } => MessageKind::OwnershipChanged,
            Payload::AcquisitionRejected { .. } => MessageKind::AcquisitionRejected,
            Payload::QueryAttributeOwnership { .. } => MessageKind::QueryAttributeOwnership,
            Payload::SyncRegistrationRequest { .. } => MessageKind::SyncRegistrationRequest,
            Payload::SyncRegistrationResponse { .. } => MessageKind::SyncRegistrationResponse,
            Payload::SyncPointAnnounce { .. } => MessageKind::SyncPointAnnounce,
            Payload::SyncPointAchieved { .. } => MessageKind::SyncPointAchieved,
        }
    }

    /// Whether the message must be processed on receipt instead of waiting
    /// behind the inbound queue.
    pub fn requires_immediate(&self) -> bool {
        match self {
            Payload::CreateFederation { .. }
            | Payload::JoinFederation { .. }
            | Payload::RoleCall(..)
            | Payload::EnableTimeRegulation { .. }
            | Payload::RegulationFloor { .. }
            | Payload::SyncRegistrationRequest { .. }
            | Payload::SyncRegistrationResponse { .. } => true,
            Payload::AttributeAcquire { if_available, .. } => *if_available,
            _ => false,
        }
    }
}

/// A message is a plain value: it names federates by handle and never holds
/// a reference into anyone's state. `target` is set for point-to-point
/// messages and left empty for broadcasts; `timestamp` is set for messages
/// that must be delivered in time-stamp order.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub source: FederateHandle,
    pub target: Option<FederateHandle>,
    pub timestamp: Option<LogicalTime>,
    pub immediate: bool,
    pub payload: Payload,
}

impl Message {
    pub fn new(source: FederateHandle, payload: Payload) -> Message {
        Message {
            source,
            target: None,
            timestamp: None,
            immediate: payload.requires_immediate(),
            payload,
        }
    }

    pub fn to(mut self, target: FederateHandle) -> Message {
        self.target = Some(target);
        self
    }

    pub fn at(mut self, timestamp: Option<LogicalTime>) -> Message {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from {}", self.kind(), self.source)?;
        if let Some(t) = self.target {
            write!(f, " to {}", t)?;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " @{}", ts)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_are_listed_once() {
        let mut all = MessageKind::ALL.to_vec();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), MessageKind::ALL.len());
    }

    #[test]
    fn resign_codes() {
        for a in [
            ResignAction::ReleaseAttributes,
            ResignAction::DeleteObjects,
            ResignAction::DeleteObjectsAndReleaseAttributes,
            ResignAction::NoAction,
        ] {
            assert_eq!(ResignAction::from_code(a.code()), Ok(a));
        }
        assert!(ResignAction::from_code(0).is_err());
        assert!(ResignAction::from_code(9).is_err());
    }

    #[test]
    fn immediacy_follows_payload() {
        let acquire = |if_available| Payload::AttributeAcquire {
            object: ObjectHandle(1),
            attributes: vec![AttributeHandle(1)],
            if_available,
            tag: vec![],
        };
        assert!(Message::new(FederateHandle(1), acquire(true)).immediate);
        assert!(!Message::new(FederateHandle(1), acquire(false)).immediate);
        let m = Message::new(
            FederateHandle(1),
            Payload::TimeAdvanceRequest {
                time: LogicalTime::ZERO,
            },
        );
        assert!(!m.immediate);
        let floor = Payload::RegulationFloor {
            floor: LogicalTime::ZERO,
        };
        assert!(Message::new(FederateHandle(1), floor).immediate);
        assert!(!Message::new(FederateHandle(1), Payload::DisableTimeRegulation).immediate);
    }
}
