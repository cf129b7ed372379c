// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    AttributeHandle, AttributeKey, FederateHandle, InteractionClassHandle, LogicalTime,
    MessageKind, ObjectClassHandle, ObjectHandle,
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    /// Bad handler registration or bad initial properties. Only ever raised
    /// while setting things up.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] Violation),

    #[error("no handler accepted {kind:?} from {from} (vetoed: {vetoed})")]
    UnhandledMessage {
        kind: MessageKind,
        from: FederateHandle,
        vetoed: bool,
    },

    #[error("could not decode message: {0}")]
    Decode(String),

    #[error("could not encode message: {0}")]
    Encode(String),

    #[error("federate {0} is no longer attached to the bus")]
    Disconnected(FederateHandle),

    #[error("federation {0:?} does not exist")]
    FederationNotFound(String),

    #[error("federation {0:?} already exists")]
    FederationExists(String),

    #[error("federation {0:?} still has joined federates")]
    FederatesStillJoined(String),

    #[error("federate name {0:?} is already in use")]
    FederateNameInUse(String),

    #[error("federate is not joined to a federation")]
    NotJoined,

    #[error("federate is already joined to a federation")]
    AlreadyJoined,

    #[error("time advance was abandoned before it was granted")]
    AdvanceAbandoned,
}

/// The ways a request can break the coordination protocol. Each is reported
/// back to whoever asked; none of them leaves partial state behind.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum Violation {
    #[error("invalid logical time: {0}")]
    InvalidTime(String),

    #[error("invalid lookahead: {0}")]
    InvalidLookahead(String),

    #[error("message addressed to {addressed_to:?} delivered to {delivered_to}")]
    WrongAddressee {
        addressed_to: Option<FederateHandle>,
        delivered_to: FederateHandle,
    },

    #[error("message from unknown federate {0}")]
    UnknownFederate(FederateHandle),

    #[error("invalid resign action code {0}")]
    InvalidResignAction(u8),

    #[error("federate is still collecting role calls from its peers")]
    JoinInProgress,

    #[error("a time advance is already pending")]
    AdvancePending,

    #[error("time regulation is already enabled")]
    RegulationAlreadyEnabled,

    #[error("time regulation is not enabled")]
    RegulationNotEnabled,

    #[error("enabling time regulation is still pending")]
    RegulationPending,

    #[error("time constrained is already enabled")]
    ConstraintAlreadyEnabled,

    #[error("time constrained is not enabled")]
    ConstraintNotEnabled,

    #[error("enabling time constrained is still pending")]
    ConstraintPending,

    #[error("cannot advance to {requested}, already at {current}")]
    AdvanceIntoPast {
        requested: LogicalTime,
        current: LogicalTime,
    },

    #[error("timestamp {timestamp} is below the promised bound {bound}")]
    TimestampBelowBound {
        timestamp: LogicalTime,
        bound: LogicalTime,
    },

    #[error("object {0} is not known")]
    UnknownObject(ObjectHandle),

    #[error("object {0} is already registered")]
    ObjectExists(ObjectHandle),

    #[error("no object handles left to allocate")]
    ObjectHandlesExhausted,

    #[error("class or member {0} is not in the object model")]
    NotInModel(String),

    #[error("object class {0} is not published")]
    ObjectClassNotPublished(ObjectClassHandle),

    #[error("attribute {1} of object class {0} is not published")]
    AttributeNotPublished(ObjectClassHandle, AttributeHandle),

    #[error("object class {0} is not subscribed")]
    ObjectClassNotSubscribed(ObjectClassHandle),

    #[error("interaction class {0} is not published")]
    InteractionClassNotPublished(InteractionClassHandle),

    #[error("interaction class {0} is not subscribed")]
    InteractionClassNotSubscribed(InteractionClassHandle),

    #[error("only the registrant may delete {0}")]
    NotRegistrant(ObjectHandle),

    #[error("attribute {0} is not owned by the requesting federate")]
    AttributeNotOwned(AttributeKey),

    #[error("attribute {0} is already owned by the requesting federate")]
    AttributeAlreadyOwned(AttributeKey),

    #[error("attribute {0} already has a transfer in progress")]
    TransferPending(AttributeKey),

    #[error("attribute {0} has no pending acquisition to release to")]
    NoPendingAcquisition(AttributeKey),

    #[error("attribute {0} has no pending divestiture to confirm")]
    NoPendingDivestiture(AttributeKey),

    #[error("no attributes were named")]
    EmptyAttributeSet,

    #[error("resigning federate still owns {0} attribute(s)")]
    FederateOwnsAttributes(usize),

    #[error("sync point label must not be empty")]
    EmptySyncLabel,

    #[error("sync point {0:?} is already registered")]
    SyncLabelInUse(String),

    #[error("sync point {0:?} is not announced")]
    SyncPointNotAnnounced(String),

    #[error("federate is not in the synchronization set of {0:?}")]
    NotInSyncSet(String),
}
