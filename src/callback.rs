// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    AttributeHandle, FederateHandle, InteractionClassHandle, LogicalTime, ObjectClassHandle,
    ObjectHandle, ParameterHandle, ResignAction,
};
use std::collections::BTreeMap;

/// Notifications for the application layer. They are produced by handlers
/// during dispatch and handed over once the dispatch commits.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Callback {
    JoinCompleted {
        federation: String,
        time: LogicalTime,
    },
    FederateJoined {
        federate: FederateHandle,
        name: String,
    },
    FederateResigned {
        federate: FederateHandle,
        action: ResignAction,
    },

    TimeAdvanceGranted {
        time: LogicalTime,
    },
    TimeRegulationEnabled {
        time: LogicalTime,
    },
    TimeConstrainedEnabled {
        time: LogicalTime,
    },

    ObjectDiscovered {
        object: ObjectHandle,
        class: ObjectClassHandle,
    },
    ObjectRemoved {
        object: ObjectHandle,
        tag: Vec<u8>,
        timestamp: Option<LogicalTime>,
    },
    AttributesReflected {
        object: ObjectHandle,
        values: BTreeMap<AttributeHandle, Vec<u8>>,
        tag: Vec<u8>,
        timestamp: Option<LogicalTime>,
        from: FederateHandle,
    },
    InteractionReceived {
        class: InteractionClassHandle,
        parameters: BTreeMap<ParameterHandle, Vec<u8>>,
        tag: Vec<u8>,
        timestamp: Option<LogicalTime>,
        from: FederateHandle,
    },
    ProvideUpdate {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },

    OwnershipAcquired {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },
    // Lost to a concurrent claim that ordered higher.
    OwnershipRevoked {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },
    OwnershipDivested {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },
    AttributeOwnershipInformed {
        object: ObjectHandle,
        attribute: AttributeHandle,
        owner: Option<FederateHandle>,
    },
    ReleaseRequested {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
        by: FederateHandle,
        tag: Vec<u8>,
    },
    DivestitureConfirmationRequested {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
    },
    AcquisitionRejected {
        object: ObjectHandle,
        attributes: Vec<AttributeHandle>,
        reason: String,
    },

    SyncRegistrationSucceeded {
        label: String,
    },
    SyncRegistrationFailed {
        label: String,
        reason: String,
    },
    SyncPointAnnounced {
        label: String,
        tag: Vec<u8>,
    },
    FederationSynchronized {
        label: String,
    },
}
