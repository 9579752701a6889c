//! Resource visibility inside and across contexts.

use std::collections::BTreeSet;

use serde::Serialize;

use super::context::ContextHandle;

/// Visibility of a resource inside its owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Exported,
    Internal,
}

/// Where a lookup found a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOrigin {
    /// Declared by the looking-up context itself
    Local(Visibility),
    /// Exported by the parent (domain) context
    Parent { artifact: String },
}

/// Private namespace of one context.
///
/// Internal resources are visible only to the owner; exported resources are
/// also visible to child contexts. Lookups fall back to the parent's exports.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    exported: BTreeSet<String>,
    internal: BTreeSet<String>,
    parent: Option<ContextHandle>,
}

impl Namespace {
    pub fn new<E, I>(exported: E, internal: I) -> Self
    where
        E: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        let exported: BTreeSet<String> = exported.into_iter().collect();
        // A resource listed as both is exported.
        let internal = internal
            .into_iter()
            .filter(|r| !exported.contains(r))
            .collect();
        Self {
            exported,
            internal,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<ContextHandle>) -> Self {
        self.parent = parent;
        self
    }

    pub fn exports(&self, resource: &str) -> bool {
        self.exported.contains(resource)
    }

    pub fn parent(&self) -> Option<&ContextHandle> {
        self.parent.as_ref()
    }

    /// Resolve `resource` locally, then through the parent's exports.
    pub fn lookup(&self, resource: &str) -> Option<ResourceOrigin> {
        if self.exported.contains(resource) {
            return Some(ResourceOrigin::Local(Visibility::Exported));
        }
        if self.internal.contains(resource) {
            return Some(ResourceOrigin::Local(Visibility::Internal));
        }
        let parent = self.parent.as_ref()?;
        if parent.exports(resource) {
            return parent
                .artifact()
                .map(|artifact| ResourceOrigin::Parent { artifact });
        }
        None
    }

    pub fn exported(&self) -> impl Iterator<Item = &str> {
        self.exported.iter().map(String::as_str)
    }
}
