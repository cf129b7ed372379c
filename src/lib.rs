// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate is the per-federate core of a distributed simulation run in
 * the style of the High Level Architecture: a number of _federates_, each a
 * separate simulation, join a _federation_ and share object instances,
 * interactions, logical time and synchronization points.
 *
 * There is no central runtime. Each federate runs the same small state
 * machine over its own copy of the relevant state and exchanges messages
 * with its peers; agreement comes from every federate applying the same
 * deterministic rules to the same messages:
 *
 *   - _Time_ advances under a conservative lower-bound-timestamp rule. A
 *     federate grants its own advance once no peer can still send it
 *     anything earlier, and timestamped messages are held until then.
 *
 *   - _Attribute ownership_ is a per-attribute claim that only moves
 *     forward. Transfers are arbitrated by the current owner; concurrent
 *     claims are settled by a fixed claim order, so everyone converges on
 *     one owner.
 *
 *   - _Synchronization points_ are registered without a coordinator. A
 *     contested label goes to the lowest federate handle, and once the set
 *     of federates that must achieve it is fixed it only grows towards
 *     completion.
 *
 * Federates only hear about the object classes and interactions they
 * subscribe to, and only send what they have published.
 *
 * Every message goes through a pipeline of handlers keyed by message kind.
 * A handler may veto a message, in which case the next one for that kind is
 * tried; all state changes of a dispatch are all-or-nothing.
 *
 * The shipped transport is an in-process `MessageBus`; anything that can
 * carry the bytes a `Codec` produces will do.
 *
 * ## Name
 *
 * Wikipedia:
 *
 * > In astronomy, a syzygy is a roughly straight-line configuration of
 * > three or more celestial bodies in a gravitational system.
 * >
 * > ...
 * >
 * > The word is derived from the Ancient Greek suzugía, meaning "union" or
 * > "yoke".
 */

mod bus;
mod callback;
mod codec;
mod config;
mod context;
mod declaration;
mod error;
mod federate;
mod federation;
mod handles;
mod message;
mod model;
mod objects;
mod ownership;
mod pipeline;
mod queue;
mod state;
mod status;
mod sync;
mod time;
mod time_manager;

pub use bus::{Endpoint, MessageBus};
pub use callback::Callback;
pub use codec::{Codec, JsonCodec};
pub use config::Config;
pub use context::{Destination, MessageContext, Outbound, Outcome, Response};
pub use declaration::{Interest, Interests};
pub use error::{Error, Result, Violation};
pub use federate::{AdvanceTicket, Federate, GrantState};
pub use handles::{
    AttributeHandle, AttributeKey, FederateHandle, InteractionClassHandle, ObjectClassHandle,
    ObjectHandle, ParameterHandle,
};
pub use message::{Message, MessageKind, Payload, ResignAction, RoleCall};
pub use model::{InteractionClass, ObjectClass, ObjectModel};
pub use ownership::{ClaimLD, ClaimLE, OwnershipClaim, OwnershipRecord, OwnershipState, Pending};
pub use pipeline::{Handler, HandlerFn, HandlerRegistry, ServiceHandler, Side, Verdict};
pub use queue::InboundQueue;
pub use state::{FederateState, ObjectRecord, PeerRecord};
pub use status::{Advancing, Switch, TimeStatus};
pub use sync::{AchievedLD, AchievedLE, SyncPoint, SyncSnapshot, SyncState};
pub use time::{LbtsLD, LbtsLE, LogicalTime, Lookahead};
pub use time_manager::computed_lbts;
