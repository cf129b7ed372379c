// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, FederateState, Message, MessageContext, MessageKind, Outcome, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace, warn};

/// What a handler made of a message. A veto is not an error: it means "not
/// for me", and the pipeline moves on to the next handler for the kind.
#[derive(Debug)]
pub enum Verdict {
    Handled,
    Vetoed(&'static str),
    Failed(Error),
}

/// Which origin of message a handler is willing to look at. Outgoing
/// handlers see requests raised by the local application; incoming ones see
/// what peers sent us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Outgoing,
    Incoming,
    Either,
}

pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> MessageKind;
    fn process(&self, ctx: &mut MessageContext, state: &mut FederateState) -> Verdict;
}

pub type HandlerFn = fn(&mut MessageContext, &mut FederateState) -> Result<Verdict>;

/// The handler shape every service uses: a plain function guarded by the
/// origin of the message.
pub struct ServiceHandler {
    pub name: &'static str,
    pub kind: MessageKind,
    pub side: Side,
    pub func: HandlerFn,
}

impl ServiceHandler {
    pub fn new(name: &'static str, kind: MessageKind, side: Side, func: HandlerFn) -> Box<Self> {
        Box::new(ServiceHandler {
            name,
            kind,
            side,
            func,
        })
    }
}

impl Handler for ServiceHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> MessageKind {
        self.kind
    }

    fn process(&self, ctx: &mut MessageContext, state: &mut FederateState) -> Verdict {
        match (self.side, ctx.is_local()) {
            (Side::Outgoing, false) => return Verdict::Vetoed("raised by a peer"),
            (Side::Incoming, true) => return Verdict::Vetoed("raised locally"),
            _ => (),
        }
        match (self.func)(ctx, state) {
            Ok(v) => v,
            Err(e) => Verdict::Failed(e),
        }
    }
}

/// Maps each message kind to the handlers that may take it, in the order
/// they are tried. Built once, up front; a bad registration is a
/// configuration error there and then.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<MessageKind, Vec<Box<dyn Handler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (k, hs) in self.handlers.iter() {
            m.entry(k, &hs.iter().map(|h| h.name()).collect::<Vec<_>>());
        }
        m.finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// The registry every federate runs with.
    pub fn standard() -> Result<Self> {
        let mut reg = HandlerRegistry::new();
        for h in crate::federation::handlers()
            .into_iter()
            .chain(crate::time_manager::handlers())
            .chain(crate::declaration::handlers())
            .chain(crate::objects::handlers())
            .chain(crate::ownership::handlers())
            .chain(crate::sync::handlers())
        {
            reg.register(h)?;
        }
        reg.check_complete()?;
        Ok(reg)
    }

    pub fn register(&mut self, handler: Box<dyn Handler>) -> Result<()> {
        let slot = self.handlers.entry(handler.kind()).or_default();
        if slot.iter().any(|h| h.name() == handler.name()) {
            return Err(Error::Configuration(format!(
                "handler {} registered twice for {:?}",
                handler.name(),
                handler.kind()
            )));
        }
        slot.push(handler);
        Ok(())
    }

    /// Every message kind must have somewhere to go.
    pub fn check_complete(&self) -> Result<()> {
        for k in MessageKind::ALL.iter() {
            if self.handlers_for(*k).is_empty() {
                return Err(Error::Configuration(format!("no handler for {:?}", k)));
            }
        }
        Ok(())
    }

    pub fn kinds(&self) -> impl Iterator<Item = MessageKind> + '_ {
        self.handlers.keys().cloned()
    }

    pub fn handlers_for(&self, kind: MessageKind) -> &[Box<dyn Handler>] {
        self.handlers.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Run `message` through the handlers for its kind. The first handler
    /// that does not veto decides the outcome; if it fails, or every
    /// handler vetoes, the state is exactly as it was before the call.
    pub fn dispatch(&self, state: &mut FederateState, message: Message) -> Result<Outcome> {
        let kind = message.kind();
        let from = message.source;
        let handlers = self.handlers_for(kind);
        if handlers.is_empty() {
            warn!("federate {} has no handler for {}", state.handle, message);
            return Err(Error::UnhandledMessage {
                kind,
                from,
                vetoed: false,
            });
        }
        let mut ctx = MessageContext::new(message, state.handle);
        for h in handlers {
            let snapshot = state.clone();
            match h.process(&mut ctx, state) {
                Verdict::Handled => {
                    trace!(
                        "federate {} handler {} took {}",
                        state.handle,
                        h.name(),
                        ctx.request
                    );
                    return Ok(ctx.into_outcome());
                }
                Verdict::Vetoed(why) => {
                    trace!(
                        "federate {} handler {} vetoed {}: {}",
                        state.handle,
                        h.name(),
                        ctx.request,
                        why
                    );
                    *state = snapshot;
                    ctx.discard_effects();
                }
                Verdict::Failed(e) => {
                    debug!(
                        "federate {} handler {} rejected {}: {}",
                        state.handle,
                        h.name(),
                        ctx.request,
                        e
                    );
                    *state = snapshot;
                    return Err(e);
                }
            }
        }
        trace!("federate {} found no taker for {}", state.handle, ctx.request);
        Err(Error::UnhandledMessage {
            kind,
            from,
            vetoed: true,
        })
    }
}
