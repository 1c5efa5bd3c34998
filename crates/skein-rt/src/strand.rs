// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strands: named execution contexts threaded through a call chain.
//!
//! One strand per logical call. A strand is created with its future and
//! handed by reference to the unit of work; nothing mutates it afterwards.

use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;

use crate::value::Value;

/// Strand properties: contextual configuration carried for the call.
pub type Properties = IndexMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrandId(pub(crate) u64);

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call-site identity of a strand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrandMetadata {
    pub module_org: Option<String>,
    pub module_name: Option<String>,
    pub module_version: Option<String>,
    pub type_name: Option<String>,
    pub parent_function: Option<String>,
    /// Opaque tags, ordered for stable output.
    pub tags: BTreeMap<String, String>,
}

impl StrandMetadata {
    pub fn new(type_name: impl Into<String>, parent_function: impl Into<String>) -> Self {
        Self {
            type_name: Some(type_name.into()),
            parent_function: Some(parent_function.into()),
            ..Self::default()
        }
    }

    pub fn module(
        mut self,
        org: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.module_org = Some(org.into());
        self.module_name = Some(name.into());
        self.module_version = Some(version.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A lightweight execution context.
#[derive(Debug, Clone)]
pub struct Strand {
    id: StrandId,
    name: Option<String>,
    metadata: StrandMetadata,
    properties: Properties,
    parent: Option<StrandId>,
}

impl Strand {
    pub(crate) fn new(
        id: StrandId,
        name: Option<String>,
        metadata: StrandMetadata,
        properties: Properties,
        parent: Option<StrandId>,
    ) -> Self {
        Self {
            id,
            name,
            metadata,
            properties,
            parent,
        }
    }

    /// A strand not owned by any scheduler (id 0). Used for work run
    /// directly on the caller's thread, e.g. stop handlers.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::new(
            StrandId(0),
            Some(name.into()),
            StrandMetadata::default(),
            Properties::new(),
            None,
        )
    }

    pub fn id(&self) -> StrandId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for logs: explicit name, then `Type.function`, then the id.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match (&self.metadata.type_name, &self.metadata.parent_function) {
            (Some(ty), Some(func)) => format!("{}.{}", ty, func),
            (None, Some(func)) => func.clone(),
            _ => format!("strand-{}", self.id),
        }
    }

    pub fn metadata(&self) -> &StrandMetadata {
        &self.metadata
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn parent(&self) -> Option<StrandId> {
        self.parent
    }
}
