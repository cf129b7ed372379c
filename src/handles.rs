// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! small_handle {
    ($name:ident, $repr:ty, $prefix:expr) => {
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $repr);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

small_handle!(FederateHandle, u32, "fed#");
small_handle!(ObjectClassHandle, u32, "oc#");
small_handle!(AttributeHandle, u32, "at#");
small_handle!(InteractionClassHandle, u32, "ic#");
small_handle!(ParameterHandle, u32, "pa#");

/// Object instances are named by their registrant: the high half of the
/// handle is the registering federate, the low half a per-federate serial.
/// That keeps handles unique across the federation without anyone having
/// to hand them out centrally.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub fn compose(registrant: FederateHandle, serial: u32) -> ObjectHandle {
        ObjectHandle((u64::from(registrant.0) << 32) | u64::from(serial))
    }

    pub fn registrant(self) -> FederateHandle {
        FederateHandle((self.0 >> 32) as u32)
    }

    pub fn serial(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}.{}", self.registrant().0, self.serial())
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The unit of ownership: one attribute of one object instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    pub object: ObjectHandle,
    pub attribute: AttributeHandle,
}

impl AttributeKey {
    pub fn new(object: ObjectHandle, attribute: AttributeHandle) -> AttributeKey {
        AttributeKey { object, attribute }
    }
}

impl fmt::Debug for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.object, self.attribute)
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_handle_carries_registrant() {
        let h = ObjectHandle::compose(FederateHandle(7), 42);
        assert_eq!(h.registrant(), FederateHandle(7));
        assert_eq!(h.serial(), 42);
        assert!(ObjectHandle::compose(FederateHandle(1), 9) < h);
    }
}
