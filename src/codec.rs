// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Message, Result};

/// Turns messages into bytes for a transport and back.
pub trait Codec: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        AttributeHandle, FederateHandle, InteractionClassHandle, Interest, LogicalTime, Lookahead,
        MessageKind, ObjectClassHandle, ObjectHandle, ObjectModel, OwnershipClaim,
        ParameterHandle, Payload, RoleCall, SyncSnapshot, SyncState, TimeStatus,
    };
    use std::collections::{BTreeMap, BTreeSet};

    fn round_trip(m: Message) {
        let c = JsonCodec;
        let bytes = c.encode(&m).unwrap();
        assert_eq!(c.decode(&bytes).unwrap(), m);
    }

    #[test]
    fn create_federation_carries_model() {
        let model = ObjectModel::new()
            .with_object_class(1, "Tank", &["pos", "fuel"])
            .with_interaction_class(1, "Fire", &["target"]);
        round_trip(Message::new(
            FederateHandle(1),
            Payload::CreateFederation {
                federation: "range".into(),
                model,
            },
        ));
    }

    #[test]
    fn tagged_acquire_keeps_every_field() {
        let m = Message::new(
            FederateHandle(3),
            Payload::AttributeAcquire {
                object: ObjectHandle::compose(FederateHandle(2), 7),
                attributes: vec![AttributeHandle(1), AttributeHandle(2)],
                if_available: false,
                tag: b"mine".to_vec(),
            },
        )
        .to(FederateHandle(2))
        .at(Some(LogicalTime::new(2.5).unwrap()));
        round_trip(m);
    }

    // One payload of every kind, with the optional and nested parts filled
    // in where there are any.
    fn every_payload() -> Vec<Payload> {
        let t = LogicalTime::new(4.25).unwrap();
        let object = ObjectHandle::compose(FederateHandle(2), 3);
        let class = ObjectClassHandle(1);
        let attributes = vec![AttributeHandle(1), AttributeHandle(2)];
        let fire = InteractionClassHandle(1);
        let lookahead = Lookahead::new(0.5).unwrap();
        let claim = OwnershipClaim {
            epoch: 4,
            owner: Some(FederateHandle(2)),
        };
        let mut values = BTreeMap::new();
        values.insert(AttributeHandle(1), b"1,2".to_vec());
        let mut parameters = BTreeMap::new();
        parameters.insert(ParameterHandle(1), b"tank-7".to_vec());
        let mut status = TimeStatus::new(lookahead);
        status.current = t;
        vec![
            Payload::CreateFederation {
                federation: "range".into(),
                model: ObjectModel::new().with_object_class(1, "Tank", &["pos", "fuel"]),
            },
            Payload::JoinFederation {
                federation: "range".into(),
                federate_name: "tank-1".into(),
                status,
            },
            Payload::RoleCall(RoleCall {
                federate_name: "tank-2".into(),
                status,
                newcomer_floor: t,
                objects: vec![(object, class)],
                claims: vec![(object, AttributeHandle(1), claim)],
                sync_points: vec![SyncSnapshot {
                    label: "ready".into(),
                    registrant: FederateHandle(1),
                    tag: b"go".to_vec(),
                    state: SyncState::Announced,
                    federates: vec![FederateHandle(1), FederateHandle(2)],
                    achieved: vec![FederateHandle(1)],
                }],
            }),
            Payload::ResignFederation { action: 3 },
            Payload::TimeAdvanceRequest { time: t },
            Payload::TimeAdvanceGrant { time: t },
            Payload::ModifyLookahead { lookahead },
            Payload::FederationLbts { lbts: t },
            Payload::EnableTimeRegulation { lookahead },
            Payload::DisableTimeRegulation,
            Payload::RegulationFloor { floor: t },
            Payload::EnableTimeConstrained,
            Payload::DisableTimeConstrained,
            Payload::DeclareObjectClass {
                interest: Interest::Publish,
                class,
                attributes: attributes.clone(),
            },
            Payload::WithdrawObjectClass {
                interest: Interest::Subscribe,
                class,
            },
            Payload::DeclareInteractionClass {
                interest: Interest::Subscribe,
                class: fire,
            },
            Payload::WithdrawInteractionClass {
                interest: Interest::Publish,
                class: fire,
            },
            Payload::RegisterObject {
                object,
                class,
                attributes: attributes.clone(),
            },
            Payload::DeleteObject {
                object,
                tag: b"sunk".to_vec(),
            },
            Payload::UpdateAttributes {
                object,
                values,
                tag: vec![],
            },
            Payload::SendInteraction {
                class: fire,
                parameters,
                tag: b"salvo".to_vec(),
            },
            Payload::RequestObjectUpdate {
                object,
                attributes: attributes.clone(),
            },
            Payload::AttributeAcquire {
                object,
                attributes: attributes.clone(),
                if_available: true,
                tag: vec![],
            },
            Payload::AttributeRelease {
                object,
                attributes: attributes.clone(),
            },
            Payload::AttributeDivest {
                object,
                attributes: attributes.clone(),
                confirm: true,
            },
            Payload::OwnershipChanged {
                object,
                claims: vec![(AttributeHandle(2), claim)],
            },
            Payload::AcquisitionRejected {
                object,
                attributes,
                reason: "taken".into(),
            },
            Payload::QueryAttributeOwnership {
                object,
                attribute: AttributeHandle(2),
            },
            Payload::SyncRegistrationRequest {
                label: "ready".into(),
                tag: vec![],
                federates: Some(vec![FederateHandle(1)]),
            },
            Payload::SyncRegistrationResponse {
                label: "ready".into(),
                accepted: false,
            },
            Payload::SyncPointAnnounce {
                label: "ready".into(),
                tag: b"go".to_vec(),
                federates: vec![FederateHandle(1), FederateHandle(2)],
            },
            Payload::SyncPointAchieved {
                label: "ready".into(),
            },
        ]
    }

    #[test]
    fn every_kind_survives_the_wire() {
        let payloads = every_payload();
        let kinds: BTreeSet<MessageKind> = payloads.iter().map(|p| p.kind()).collect();
        assert_eq!(kinds.len(), payloads.len());
        assert_eq!(kinds, MessageKind::ALL.iter().copied().collect());
        for (i, p) in payloads.into_iter().enumerate() {
            let at = LogicalTime::new(i as f64).unwrap();
            let m = Message::new(FederateHandle(1), p).at(Some(at));
            round_trip(m.clone());
            round_trip(m.to(FederateHandle(2)));
        }
        let last = LogicalTime::new(f64::MAX).unwrap();
        let far = Message::new(FederateHandle(1), Payload::TimeAdvanceRequest { time: last });
        round_trip(far.at(Some(last)));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(JsonCodec.decode(b"{nope"), Err(Error::Decode(_))));
    }
}
