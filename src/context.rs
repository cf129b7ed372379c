// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Callback, FederateHandle, Message, ObjectHandle};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Destination {
    Local,                     // Back into our own inbound queue.
    Federate(FederateHandle), // Point-to-point.
    Broadcast,                 // Every other member of the federation.
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Outbound {
    pub destination: Destination,
    pub message: Message,
}

/// The synchronous answer to a request, where the request has one.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Response {
    Acquired(bool),
    Registered(ObjectHandle),
}

/// One per dispatched message. It carries the request to the handler and
/// collects what the handler produces: at most one response, any number of
/// outbound messages and callbacks. Nothing in here is released until the
/// handler is done and has not vetoed or failed.
#[derive(Debug)]
pub struct MessageContext {
    pub request: Message,
    local: bool,
    response: Option<Response>,
    outbound: Vec<Outbound>,
    callbacks: Vec<Callback>,
}

/// What survives a successful dispatch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub response: Option<Response>,
    pub outbound: Vec<Outbound>,
    pub callbacks: Vec<Callback>,
}

impl MessageContext {
    pub fn new(request: Message, local_handle: FederateHandle) -> Self {
        MessageContext {
            local: request.source == local_handle,
            request,
            response: None,
            outbound: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// True when the request originated at this federate.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn source(&self) -> FederateHandle {
        self.request.source
    }

    pub fn respond(&mut self, response: Response) {
        self.response = Some(response);
    }

    /// Queue `message` for the transport; no destination means the whole
    /// federation.
    pub fn emit(&mut self, message: Message, destination: Option<FederateHandle>) {
        match destination {
            Some(to) => self.unicast(to, message),
            None => self.broadcast(message),
        }
    }

    pub fn broadcast(&mut self, mut message: Message) {
        message.target = None;
        self.outbound.push(Outbound {
            destination: Destination::Broadcast,
            message,
        });
    }

    pub fn unicast(&mut self, to: FederateHandle, message: Message) {
        self.outbound.push(Outbound {
            destination: Destination::Federate(to),
            message: message.to(to),
        });
    }

    pub fn loopback(&mut self, message: Message) {
        self.outbound.push(Outbound {
            destination: Destination::Local,
            message,
        });
    }

    pub fn callback(&mut self, cb: Callback) {
        self.callbacks.push(cb);
    }

    pub fn outbound(&self) -> &[Outbound] {
        &self.outbound
    }

    pub fn callbacks(&self) -> &[Callback] {
        &self.callbacks
    }

    // Throw away anything a vetoing or failing handler left behind.
    pub(crate) fn discard_effects(&mut self) {
        self.response = None;
        self.outbound.clear();
        self.callbacks.clear();
    }

    pub(crate) fn into_outcome(self) -> Outcome {
        Outcome {
            response: self.response,
            outbound: self.outbound,
            callbacks: self.callbacks,
        }
    }
}
