// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! An in-process transport: a directory of federations, each with a set of
//! attached federates and a channel of encoded messages per federate.

use crate::{Destination, Error, FederateHandle, ObjectModel, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

struct Member {
    name: String,
    inbox: Sender<Vec<u8>>,
}

struct FederationEntry {
    model: ObjectModel,
    members: BTreeMap<FederateHandle, Member>,
}

#[derive(Default)]
struct Directory {
    federations: BTreeMap<String, FederationEntry>,
    next_handle: u32,
}

#[derive(Clone, Default)]
pub struct MessageBus {
    directory: Arc<Mutex<Directory>>,
}

/// A federate's attachment to the bus.
pub struct Endpoint {
    pub handle: FederateHandle,
    pub federation: String,
    /// Who was already attached when this endpoint was made.
    pub roster: Vec<FederateHandle>,
    pub model: ObjectModel,
    pub inbox: Receiver<Vec<u8>>,
    bus: MessageBus,
}

impl MessageBus {
    pub fn new() -> Self {
        MessageBus::default()
    }

    pub fn create_federation(&self, name: &str, model: ObjectModel) -> Result<()> {
        model.validate()?;
        let mut dir = self.directory.lock();
        if dir.federations.contains_key(name) {
            return Err(Error::FederationExists(name.to_string()));
        }
        debug!("bus created federation {:?}", name);
        dir.federations.insert(
            name.to_string(),
            FederationEntry {
                model,
                members: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn destroy_federation(&self, name: &str) -> Result<()> {
        let mut dir = self.directory.lock();
        let occupied = match dir.federations.get(name) {
            None => return Err(Error::FederationNotFound(name.to_string())),
            Some(f) => !f.members.is_empty(),
        };
        if occupied {
            return Err(Error::FederatesStillJoined(name.to_string()));
        }
        dir.federations.remove(name);
        debug!("bus destroyed federation {:?}", name);
        Ok(())
    }

    pub fn federations(&self) -> Vec<String> {
        self.directory.lock().federations.keys().cloned().collect()
    }

    pub fn members(&self, federation: &str) -> Vec<(FederateHandle, String)> {
        self.directory
            .lock()
            .federations
            .get(federation)
            .map(|f| {
                f.members
                    .iter()
                    .map(|(h, m)| (*h, m.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn attach(&self, federation: &str, name: &str) -> Result<Endpoint> {
        let mut guard = self.directory.lock();
        let dir = &mut *guard;
        let entry = dir
            .federations
            .get_mut(federation)
            .ok_or_else(|| Error::FederationNotFound(federation.to_string()))?;
        if entry.members.values().any(|m| m.name == name) {
            return Err(Error::FederateNameInUse(name.to_string()));
        }
        dir.next_handle += 1;
        let handle = FederateHandle(dir.next_handle);
        let roster: Vec<FederateHandle> = entry.members.keys().cloned().collect();
        let (tx, rx) = unbounded();
        entry.members.insert(
            handle,
            Member {
                name: name.to_string(),
                inbox: tx,
            },
        );
        debug!(
            "bus attached {} as {:?} to {:?} with {} others",
            handle,
            name,
            federation,
            roster.len()
        );
        Ok(Endpoint {
            handle,
            federation: federation.to_string(),
            roster,
            model: entry.model.clone(),
            inbox: rx,
            bus: self.clone(),
        })
    }

    fn deliver(
        &self,
        federation: &str,
        from: FederateHandle,
        to: Destination,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let dir = self.directory.lock();
        let entry = dir
            .federations
            .get(federation)
            .ok_or_else(|| Error::FederationNotFound(federation.to_string()))?;
        if !entry.members.contains_key(&from) {
            return Err(Error::Disconnected(from));
        }
        let targets: Vec<FederateHandle> = match to {
            Destination::Broadcast => {
                entry.members.keys().filter(|h| **h != from).cloned().collect()
            }
            Destination::Federate(h) => vec![h],
            Destination::Local => vec![from],
        };
        for h in targets {
            match entry.members.get(&h) {
                Some(m) => {
                    if m.inbox.send(bytes.clone()).is_err() {
                        trace!("bus dropped message from {} to departed {}", from, h);
                    }
                }
                None => trace!("bus dropped message from {} to unknown {}", from, h),
            }
        }
        Ok(())
    }

    fn detach(&self, federation: &str, handle: FederateHandle) {
        let mut dir = self.directory.lock();
        if let Some(f) = dir.federations.get_mut(federation) {
            if f.members.remove(&handle).is_some() {
                debug!("bus detached {} from {:?}", handle, federation);
            }
        }
    }
}

impl Endpoint {
    pub fn send(&self, to: Destination, bytes: Vec<u8>) -> Result<()> {
        self.bus.deliver(&self.federation, self.handle, to, bytes)
    }

    pub fn detach(&self) {
        self.bus.detach(&self.federation, self.handle)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn model() -> ObjectModel {
        ObjectModel::new().with_object_class(1, "Tank", &["pos"])
    }

    #[test]
    fn directory_lifecycle() {
        let bus = MessageBus::new();
        bus.create_federation("f", model()).unwrap();
        assert_eq!(
            bus.create_federation("f", model()),
            Err(Error::FederationExists("f".into()))
        );
        assert!(matches!(
            bus.attach("g", "a"),
            Err(Error::FederationNotFound(_))
        ));
        let a = bus.attach("f", "a").unwrap();
        assert!(a.roster.is_empty());
        assert!(matches!(bus.attach("f", "a"), Err(Error::FederateNameInUse(_))));
        let b = bus.attach("f", "b").unwrap();
        assert_eq!(b.roster, vec![a.handle]);
        assert_eq!(
            bus.destroy_federation("f"),
            Err(Error::FederatesStillJoined("f".into()))
        );
        drop(a);
        drop(b);
        bus.destroy_federation("f").unwrap();
        assert!(bus.federations().is_empty());
    }

    #[test]
    fn broadcast_skips_sender() {
        let bus = MessageBus::new();
        bus.create_federation("f", model()).unwrap();
        let a = bus.attach("f", "a").unwrap();
        let b = bus.attach("f", "b").unwrap();
        let c = bus.attach("f", "c").unwrap();
        a.send(Destination::Broadcast, b"x".to_vec()).unwrap();
        a.send(Destination::Federate(c.handle), b"y".to_vec()).unwrap();
        assert!(a.inbox.try_recv().is_err());
        assert_eq!(b.inbox.try_recv().unwrap(), b"x".to_vec());
        assert_eq!(c.inbox.try_recv().unwrap(), b"x".to_vec());
        assert_eq!(c.inbox.try_recv().unwrap(), b"y".to_vec());
        a.detach();
        assert_eq!(
            a.send(Destination::Broadcast, vec![]),
            Err(Error::Disconnected(a.handle))
        );
    }
}
