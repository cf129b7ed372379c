// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    AttributeHandle, Error, InteractionClassHandle, ObjectClassHandle, ParameterHandle, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The shared schema of a federation, as far as the coordination engine
/// cares: which attributes an object class has and which parameters an
/// interaction class carries. Parsing a schema file into this shape is the
/// host's business.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectModel {
    pub object_classes: BTreeMap<ObjectClassHandle, ObjectClass>,
    pub interaction_classes: BTreeMap<InteractionClassHandle, InteractionClass>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectClass {
    pub name: String,
    pub attributes: BTreeMap<AttributeHandle, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionClass {
    pub name: String,
    pub parameters: BTreeMap<ParameterHandle, String>,
}

impl ObjectModel {
    pub fn new() -> Self {
        ObjectModel::default()
    }

    /// Builder-style helper for adding an object class with named attributes
    /// numbered from 1.
    pub fn with_object_class(mut self, handle: u32, name: &str, attributes: &[&str]) -> Self {
        let attributes = attributes
            .iter()
            .enumerate()
            .map(|(i, a)| (AttributeHandle(i as u32 + 1), a.to_string()))
            .collect();
        self.object_classes.insert(
            ObjectClassHandle(handle),
            ObjectClass {
                name: name.to_string(),
                attributes,
            },
        );
        self
    }

    pub fn with_interaction_class(mut self, handle: u32, name: &str, parameters: &[&str]) -> Self {
        let parameters = parameters
            .iter()
            .enumerate()
            .map(|(i, p)| (ParameterHandle(i as u32 + 1), p.to_string()))
            .collect();
        self.interaction_classes.insert(
            InteractionClassHandle(handle),
            InteractionClass {
                name: name.to_string(),
                parameters,
            },
        );
        self
    }

    pub fn object_class(&self, class: ObjectClassHandle) -> Option<&ObjectClass> {
        self.object_classes.get(&class)
    }

    pub fn interaction_class(&self, class: InteractionClassHandle) -> Option<&InteractionClass> {
        self.interaction_classes.get(&class)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for (h, c) in self.object_classes.iter() {
            if c.name.is_empty() {
                return Err(Error::Configuration(format!("object class {} has no name", h)));
            }
            if !names.insert(c.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "object class name {:?} is declared twice",
                    c.name
                )));
            }
            check_member_names(&c.name, c.attributes.values())?;
        }
        let mut names = BTreeSet::new();
        for (h, c) in self.interaction_classes.iter() {
            if c.name.is_empty() {
                return Err(Error::Configuration(format!(
                    "interaction class {} has no name",
                    h
                )));
            }
            if !names.insert(c.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "interaction class name {:?} is declared twice",
                    c.name
                )));
            }
            check_member_names(&c.name, c.parameters.values())?;
        }
        Ok(())
    }
}

fn check_member_names<'a, I: Iterator<Item = &'a String>>(class: &str, members: I) -> Result<()> {
    let mut seen = BTreeSet::new();
    for m in members {
        if m.is_empty() || !seen.insert(m.as_str()) {
            return Err(Error::Configuration(format!(
                "class {:?} has an empty or repeated member name {:?}",
                class, m
            )));
        }
    }
    Ok(())
}
