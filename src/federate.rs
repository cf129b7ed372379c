// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The application's handle on one joined federate.
//!
//! A `Federate` owns the state machine, the inbound queue and the bus
//! endpoint. Application calls are dispatched on the caller's thread;
//! traffic from peers is picked up by `pump`, which a host calls from its
//! own loop or leaves to `run`. Everything the federate has to say back to
//! the application arrives on the callback channel.

use crate::bus::{Endpoint, MessageBus};
use crate::federation::admit_roster;
use crate::queue::InboundQueue;
use crate::{
    AttributeHandle, Callback, Codec, Config, Destination, Error, FederateHandle, FederateState,
    HandlerRegistry, InteractionClassHandle, Interest, JsonCodec, LogicalTime, Lookahead, Message,
    ObjectClassHandle, ObjectHandle, Outcome, ParameterHandle, Payload, ResignAction, Response,
    Result, Switch, Violation,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

/// Where this federate's own time stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantState {
    Granted(LogicalTime),
    Pending(LogicalTime),
}

/// Resolves to the granted time once a requested advance is granted, or to
/// `Error::AdvanceAbandoned` if the federate resigns first.
#[derive(Debug)]
pub struct AdvanceTicket {
    rx: oneshot::Receiver<LogicalTime>,
}

impl AdvanceTicket {
    /// Block the calling thread until the grant. Something else must be
    /// pumping the federate meanwhile.
    pub fn wait(self) -> Result<LogicalTime> {
        futures::executor::block_on(self)
    }

    /// The grant, if it has already happened.
    pub fn try_granted(&mut self) -> Result<Option<LogicalTime>> {
        self.rx.try_recv().map_err(|_| Error::AdvanceAbandoned)
    }
}

impl Future for AdvanceTicket {
    type Output = Result<LogicalTime>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| Error::AdvanceAbandoned))
    }
}

struct Core {
    state: FederateState,
    queue: InboundQueue,
    registry: HandlerRegistry,
    tickets: Vec<oneshot::Sender<LogicalTime>>,
}

struct Shared {
    core: Mutex<Core>,
    // Signalled after anything was dispatched.
    progress: Condvar,
    config: Config,
    codec: Box<dyn Codec>,
    endpoint: Endpoint,
    callbacks: Sender<Callback>,
}

#[derive(Clone)]
pub struct Federate {
    shared: Arc<Shared>,
    callbacks: Receiver<Callback>,
}

impl std::fmt::Debug for Federate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Federate")
            .field("handle", &self.shared.endpoint.handle)
            .field("federation", &self.shared.endpoint.federation)
            .finish()
    }
}

impl Federate {
    /// Attach to `federation` on `bus` as `name` and start the join. The
    /// join is complete once a `JoinCompleted` callback arrives, which for
    /// the first member is immediately.
    pub fn join(
        bus: &MessageBus,
        federation: &str,
        name: &str,
        config: Config,
    ) -> Result<Federate> {
        config.validate()?;
        let lookahead = config.lookahead()?;
        let registry = HandlerRegistry::standard()?;
        let endpoint = bus.attach(federation, name)?;
        let mut state = FederateState::new(endpoint.handle, name, lookahead);
        let switch = |on| if on { Switch::On } else { Switch::Off };
        state.time.regulation = switch(config.time_regulating);
        state.time.constraint = switch(config.time_constrained);
        let (tx, rx) = unbounded();
        let core = Core {
            state,
            queue: InboundQueue::new(config.queue_warning_threshold),
            registry,
            tickets: Vec::new(),
        };
        let fed = Federate {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                progress: Condvar::new(),
                config,
                codec: Box::new(JsonCodec),
                endpoint,
                callbacks: tx,
            }),
            callbacks: rx,
        };
        let ep = &fed.shared.endpoint;
        fed.request(Payload::CreateFederation {
            federation: ep.federation.clone(),
            model: ep.model.clone(),
        })?;
        {
            let mut core = fed.shared.core.lock();
            admit_roster(&mut core.state, &ep.roster);
        }
        let status = *fed.shared.core.lock().state.time_status();
        fed.request(Payload::JoinFederation {
            federation: ep.federation.clone(),
            federate_name: name.to_string(),
            status,
        })?;
        Ok(fed)
    }

    pub fn handle(&self) -> FederateHandle {
        self.shared.endpoint.handle
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// A copy of the current state, for inspection.
    pub fn state(&self) -> FederateState {
        self.shared.core.lock().state.clone()
    }

    pub fn join_complete(&self) -> bool {
        self.shared.core.lock().state.join_complete()
    }

    pub fn current_time(&self) -> LogicalTime {
        self.shared.core.lock().state.current_time()
    }

    pub fn lbts(&self) -> LogicalTime {
        self.shared.core.lock().state.lbts()
    }

    pub fn queued(&self) -> usize {
        self.shared.core.lock().queue.len()
    }

    pub fn callbacks(&self) -> &Receiver<Callback> {
        &self.callbacks
    }

    /// Every callback delivered so far and not yet taken.
    pub fn take_callbacks(&self) -> Vec<Callback> {
        self.callbacks.try_iter().collect()
    }

    // Release what a successful dispatch produced. Runs under the core
    // lock, so everything one federate sends leaves in dispatch order. The
    // transition is already committed by now: callbacks and tickets go out
    // first, and a message that cannot be delivered is logged and skipped.
    fn apply(&self, core: &mut Core, outcome: Outcome) -> Option<Response> {
        let Outcome {
            response,
            outbound,
            callbacks,
        } = outcome;
        for cb in callbacks {
            if let Callback::TimeAdvanceGranted { time } = cb {
                for t in core.tickets.drain(..) {
                    let _ = t.send(time);
                }
            }
            if self.shared.callbacks.send(cb).is_err() {
                trace!("federate {} callback receiver is gone", core.state.handle);
            }
        }
        for o in outbound {
            match o.destination {
                Destination::Local => {
                    if o.message.immediate {
                        let desc = o.message.to_string();
                        if let Err(e) = self.dispatch(core, o.message) {
                            debug!("federate {} dropped {}: {}", core.state.handle, desc, e);
                        }
                    } else {
                        core.queue.push(&core.state, o.message);
                    }
                }
                dest => {
                    let sent = self
                        .shared
                        .codec
                        .encode(&o.message)
                        .and_then(|bytes| self.shared.endpoint.send(dest, bytes));
                    if let Err(e) = sent {
                        warn!(
                            "federate {} could not send {} to {:?}: {}",
                            core.state.handle, o.message, dest, e
                        );
                    }
                }
            }
        }
        response
    }

    fn dispatch(&self, core: &mut Core, message: Message) -> Result<Option<Response>> {
        let outcome = core.registry.dispatch(&mut core.state, message)?;
        Ok(self.apply(core, outcome))
    }

    fn request_at(
        &self,
        payload: Payload,
        timestamp: Option<LogicalTime>,
    ) -> Result<Option<Response>> {
        let mut core = self.shared.core.lock();
        let m = core.state.message(payload).at(timestamp);
        let r = self.dispatch(&mut core, m);
        self.shared.progress.notify_all();
        r
    }

    fn request(&self, payload: Payload) -> Result<Option<Response>> {
        self.request_at(payload, None)
    }

    // Dispatch everything the queue will currently release.
    fn drain_queue(&self, core: &mut Core) -> usize {
        let mut n = 0;
        while let Some(m) = core.queue.pop(&core.state) {
            n += 1;
            let desc = m.to_string();
            if let Err(e) = self.dispatch(core, m) {
                debug!("federate {} dropped {}: {}", core.state.handle, desc, e);
            }
        }
        n
    }

    /// Accept one message from the transport. Messages that require
    /// immediate processing are dispatched before this returns, and their
    /// errors come back here; everything else is queued.
    pub fn submit(&self, message: Message) -> Result<()> {
        if let Some(to) = message.target {
            if to != self.handle() {
                return Err(Violation::WrongAddressee {
                    addressed_to: Some(to),
                    delivered_to: self.handle(),
                }
                .into());
            }
        }
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        let r = if message.immediate {
            self.dispatch(core, message).map(|_| ())
        } else {
            core.queue.push(&core.state, message);
            Ok(())
        };
        self.shared.progress.notify_all();
        r
    }

    pub fn submit_bytes(&self, bytes: &[u8]) -> Result<()> {
        let m = self.shared.codec.decode(bytes)?;
        self.submit(m)
    }

    fn take_inbox(&self) -> usize {
        let mut n = 0;
        while let Ok(bytes) = self.shared.endpoint.inbox.try_recv() {
            n += 1;
            if let Err(e) = self.submit_bytes(&bytes) {
                debug!("federate {} rejected inbound message: {}", self.handle(), e);
            }
        }
        n
    }

    /// Take everything waiting on the bus and dispatch whatever the queue
    /// releases. Returns how many messages were handled.
    pub fn pump(&self) -> usize {
        let received = self.take_inbox();
        let mut core = self.shared.core.lock();
        let dispatched = self.drain_queue(&mut core);
        if dispatched > 0 {
            self.shared.progress.notify_all();
        }
        received + dispatched
    }

    /// Dispatch at most one released message.
    pub fn step(&self) -> bool {
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        match core.queue.pop(&core.state) {
            None => false,
            Some(m) => {
                if let Err(e) = self.dispatch(core, m) {
                    debug!("federate {} dropped message: {}", core.state.handle, e);
                }
                self.shared.progress.notify_all();
                true
            }
        }
    }

    /// Pump until `done` says stop, waiting on the bus between rounds.
    pub fn run<F: FnMut(&Federate) -> bool>(&self, mut done: F) {
        let poll = self.shared.config.poll_interval();
        while !done(self) {
            self.pump();
            match self.shared.endpoint.inbox.recv_timeout(poll) {
                Ok(bytes) => {
                    if let Err(e) = self.submit_bytes(&bytes) {
                        debug!("federate {} rejected inbound message: {}", self.handle(), e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("federate {} transport closed", self.handle());
                    break;
                }
            }
        }
    }

    /// Block until `pred` holds of the state, as seen after some dispatch.
    pub fn wait_for<F: Fn(&FederateState) -> bool>(&self, pred: F) {
        let mut core = self.shared.core.lock();
        while !pred(&core.state) {
            self.shared.progress.wait(&mut core);
        }
    }

    // Time management.

    pub fn request_advance(&self, time: LogicalTime) -> Result<AdvanceTicket> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        let m = core.state.message(Payload::TimeAdvanceRequest { time });
        let outcome = core.registry.dispatch(&mut core.state, m)?;
        core.tickets.push(tx);
        self.apply(core, outcome);
        self.drain_queue(core);
        self.shared.progress.notify_all();
        Ok(AdvanceTicket { rx })
    }

    pub fn granted_time(&self) -> GrantState {
        let core = self.shared.core.lock();
        let ts = core.state.time_status();
        if ts.is_requesting() {
            GrantState::Pending(ts.requested)
        } else {
            GrantState::Granted(ts.current)
        }
    }

    pub fn modify_lookahead(&self, lookahead: Lookahead) -> Result<()> {
        self.request(Payload::ModifyLookahead { lookahead })?;
        Ok(())
    }

    /// Start regulating with `lookahead`. Completes with a
    /// `TimeRegulationEnabled` callback once every peer has answered.
    pub fn enable_time_regulation(&self, lookahead: Lookahead) -> Result<()> {
        self.request(Payload::EnableTimeRegulation { lookahead })?;
        Ok(())
    }

    pub fn disable_time_regulation(&self) -> Result<()> {
        self.request(Payload::DisableTimeRegulation)?;
        Ok(())
    }

    /// Completes with a `TimeConstrainedEnabled` callback once LBTS has
    /// reached the current time.
    pub fn enable_time_constrained(&self) -> Result<()> {
        self.request(Payload::EnableTimeConstrained)?;
        Ok(())
    }

    pub fn disable_time_constrained(&self) -> Result<()> {
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        let m = core.state.message(Payload::DisableTimeConstrained);
        let r = self.dispatch(core, m);
        // Held-back messages are now deliverable.
        self.drain_queue(core);
        self.shared.progress.notify_all();
        r.map(|_| ())
    }

    // Declaration management.

    fn declare_object_class(
        &self,
        interest: Interest,
        class: ObjectClassHandle,
        attributes: &[AttributeHandle],
    ) -> Result<()> {
        self.request(Payload::DeclareObjectClass {
            interest,
            class,
            attributes: attributes.to_vec(),
        })?;
        Ok(())
    }

    /// Publish exactly `attributes` of `class`, replacing any earlier
    /// publication of it.
    pub fn publish_object_class(
        &self,
        class: ObjectClassHandle,
        attributes: &[AttributeHandle],
    ) -> Result<()> {
        self.declare_object_class(Interest::Publish, class, attributes)
    }

    /// Stop publishing `class`. Attributes this federate owns on its
    /// instances become unowned.
    pub fn unpublish_object_class(&self, class: ObjectClassHandle) -> Result<()> {
        self.request(Payload::WithdrawObjectClass {
            interest: Interest::Publish,
            class,
        })?;
        Ok(())
    }

    pub fn subscribe_object_class(
        &self,
        class: ObjectClassHandle,
        attributes: &[AttributeHandle],
    ) -> Result<()> {
        self.declare_object_class(Interest::Subscribe, class, attributes)
    }

    pub fn unsubscribe_object_class(&self, class: ObjectClassHandle) -> Result<()> {
        self.request(Payload::WithdrawObjectClass {
            interest: Interest::Subscribe,
            class,
        })?;
        Ok(())
    }

    pub fn publish_interaction_class(&self, class: InteractionClassHandle) -> Result<()> {
        self.request(Payload::DeclareInteractionClass {
            interest: Interest::Publish,
            class,
        })?;
        Ok(())
    }

    pub fn unpublish_interaction_class(&self, class: InteractionClassHandle) -> Result<()> {
        self.request(Payload::WithdrawInteractionClass {
            interest: Interest::Publish,
            class,
        })?;
        Ok(())
    }

    pub fn subscribe_interaction_class(&self, class: InteractionClassHandle) -> Result<()> {
        self.request(Payload::DeclareInteractionClass {
            interest: Interest::Subscribe,
            class,
        })?;
        Ok(())
    }

    pub fn unsubscribe_interaction_class(&self, class: InteractionClassHandle) -> Result<()> {
        self.request(Payload::WithdrawInteractionClass {
            interest: Interest::Subscribe,
            class,
        })?;
        Ok(())
    }

    // Federation management.

    pub fn resign(&self, action: ResignAction) -> Result<()> {
        self.resign_with_code(action.code())
    }

    /// Resign with a raw action code, as a peer speaking the wire protocol
    /// would send it.
    pub fn resign_with_code(&self, code: u8) -> Result<()> {
        self.request(Payload::ResignFederation { action: code })?;
        let mut core = self.shared.core.lock();
        let abandoned = core.tickets.len();
        core.tickets.clear();
        if abandoned > 0 {
            debug!(
                "federate {} abandoned {} pending advance",
                core.state.handle, abandoned
            );
        }
        self.shared.endpoint.detach();
        Ok(())
    }

    // Object management.

    /// Register an instance of `class`, owning `attributes` of it, or every
    /// published attribute when `attributes` is empty.
    pub fn register_object(
        &self,
        class: ObjectClassHandle,
        attributes: &[AttributeHandle],
    ) -> Result<ObjectHandle> {
        match self.request(Payload::RegisterObject {
            object: ObjectHandle(0),
            class,
            attributes: attributes.to_vec(),
        })? {
            Some(Response::Registered(object)) => Ok(object),
            _ => Err(Error::UnhandledMessage {
                kind: crate::MessageKind::RegisterObject,
                from: self.handle(),
                vetoed: false,
            }),
        }
    }

    pub fn delete_object(
        &self,
        object: ObjectHandle,
        tag: &[u8],
        timestamp: Option<LogicalTime>,
    ) -> Result<()> {
        self.request_at(
            Payload::DeleteObject {
                object,
                tag: tag.to_vec(),
            },
            timestamp,
        )?;
        Ok(())
    }

    pub fn update_attributes(
        &self,
        object: ObjectHandle,
        values: BTreeMap<AttributeHandle, Vec<u8>>,
        tag: &[u8],
        timestamp: Option<LogicalTime>,
    ) -> Result<()> {
        self.request_at(
            Payload::UpdateAttributes {
                object,
                values,
                tag: tag.to_vec(),
            },
            timestamp,
        )?;
        Ok(())
    }

    pub fn send_interaction(
        &self,
        class: InteractionClassHandle,
        parameters: BTreeMap<ParameterHandle, Vec<u8>>,
        tag: &[u8],
        timestamp: Option<LogicalTime>,
    ) -> Result<()> {
        self.request_at(
            Payload::SendInteraction {
                class,
                parameters,
                tag: tag.to_vec(),
            },
            timestamp,
        )?;
        Ok(())
    }

    pub fn request_object_update(
        &self,
        object: ObjectHandle,
        attributes: &[AttributeHandle],
    ) -> Result<()> {
        self.request(Payload::RequestObjectUpdate {
            object,
            attributes: attributes.to_vec(),
        })?;
        Ok(())
    }

    // Ownership management.

    /// Take the attributes at once if nobody owns them. Returns whether it
    /// did; on false nothing changed.
    pub fn acquire_if_available(
        &self,
        object: ObjectHandle,
        attributes: &[AttributeHandle],
    ) -> Result<bool> {
        let r = self.request(Payload::AttributeAcquire {
            object,
            attributes: attributes.to_vec(),
            if_available: true,
            tag: Vec::new(),
        })?;
        Ok(matches!(r, Some(Response::Acquired(true))))
    }

    /// Ask the current owners to release the attributes. The outcome
    /// arrives as `OwnershipAcquired` or `AcquisitionRejected`.
    pub fn acquire_negotiated(
        &self,
        object: ObjectHandle,
        attributes: &[AttributeHandle],
        tag: &[u8],
    ) -> Result<()> {
        self.request(Payload::AttributeAcquire {
            object,
            attributes: attributes.to_vec(),
            if_available: false,
            tag: tag.to_vec(),
        })?;
        Ok(())
    }

    pub fn release(&self, object: ObjectHandle, attributes: &[AttributeHandle]) -> Result<()> {
        self.request(Payload::AttributeRelease {
            object,
            attributes: attributes.to_vec(),
        })?;
        Ok(())
    }

    pub fn divest(&self, object: ObjectHandle, attributes: &[AttributeHandle]) -> Result<()> {
        self.request(Payload::AttributeDivest {
            object,
            attributes: attributes.to_vec(),
            confirm: false,
        })?;
        Ok(())
    }

    pub fn confirm_divestiture(
        &self,
        object: ObjectHandle,
        attributes: &[AttributeHandle],
    ) -> Result<()> {
        self.request(Payload::AttributeDivest {
            object,
            attributes: attributes.to_vec(),
            confirm: true,
        })?;
        Ok(())
    }

    /// The owner as this federate sees it arrives as an
    /// `AttributeOwnershipInformed` callback.
    pub fn query_attribute_ownership(
        &self,
        object: ObjectHandle,
        attribute: AttributeHandle,
    ) -> Result<()> {
        self.request(Payload::QueryAttributeOwnership { object, attribute })?;
        Ok(())
    }

    pub fn is_attribute_owned_by_federate(
        &self,
        object: ObjectHandle,
        attribute: AttributeHandle,
    ) -> Result<bool> {
        let core = self.shared.core.lock();
        let state = &core.state;
        state.require_joined()?;
        let keys = state.keys(object, &[attribute])?;
        Ok(keys
            .iter()
            .all(|k| state.record(k).owner() == Some(state.handle)))
    }

    // Synchronization points.

    /// Register `label`; `None` for `federates` means every member at the
    /// time the point is announced.
    pub fn register_sync_point(
        &self,
        label: &str,
        tag: &[u8],
        federates: Option<&[FederateHandle]>,
    ) -> Result<()> {
        self.request(Payload::SyncRegistrationRequest {
            label: label.to_string(),
            tag: tag.to_vec(),
            federates: federates.map(|f| f.to_vec()),
        })?;
        Ok(())
    }

    pub fn achieve_sync_point(&self, label: &str) -> Result<()> {
        self.request(Payload::SyncPointAchieved {
            label: label.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ObjectModel;

    fn t(v: f64) -> LogicalTime {
        LogicalTime::new(v).unwrap()
    }

    fn lone_federate() -> (MessageBus, Federate) {
        let bus = MessageBus::new();
        bus.create_federation("range", ObjectModel::new()).unwrap();
        let fed = Federate::join(&bus, "range", "a", Config::default()).unwrap();
        fed.pump();
        (bus, fed)
    }

    #[test]
    fn lost_transport_still_grants_and_reports() {
        let (_bus, fed) = lone_federate();
        fed.take_callbacks();
        fed.shared.endpoint.detach();

        let mut ticket = fed.request_advance(t(3.0)).unwrap();
        assert_eq!(ticket.try_granted(), Ok(Some(t(3.0))));
        assert_eq!(fed.granted_time(), GrantState::Granted(t(3.0)));
        assert!(fed
            .take_callbacks()
            .iter()
            .any(|c| *c == Callback::TimeAdvanceGranted { time: t(3.0) }));

        // Later requests are not blocked by the earlier failed sends.
        let mut next = fed.request_advance(t(4.0)).unwrap();
        assert_eq!(next.try_granted(), Ok(Some(t(4.0))));
    }

    #[test]
    fn misaddressed_messages_are_refused_on_submit() {
        let (_bus, fed) = lone_federate();
        let achieved = Payload::SyncPointAchieved { label: "x".into() };
        let stray = Message::new(FederateHandle(42), achieved).to(FederateHandle(43));
        assert_eq!(
            fed.submit(stray),
            Err(Error::Protocol(Violation::WrongAddressee {
                addressed_to: Some(FederateHandle(43)),
                delivered_to: fed.handle(),
            }))
        );
        assert_eq!(fed.queued(), 0);
    }
}
