//! Process-wide index of live execution contexts.
//!
//! The registry only ever holds `Weak` references. Detaching a context
//! makes it unreachable for resolution; dropping its owner frees it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use berth_repo::ArtifactKind;
use serde::Serialize;

use super::cache::{ContextCache, ContextKeyedCache};
use super::context::{ContextHandle, ContextId, ContextInner};
use super::namespace::ResourceOrigin;

/// Diagnostic view of a live context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub id: ContextId,
    pub artifact: String,
    pub kind: ArtifactKind,
}

/// Shared handle to the registry.
#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    contexts: RwLock<HashMap<ContextId, Weak<ContextInner>>>,
    caches: RwLock<Vec<Arc<dyn ContextKeyedCache>>>,
    lookups: Arc<ContextCache<Option<ResourceOrigin>>>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("live", &self.len())
            .finish()
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        let lookups = ContextCache::new("namespace-lookups");
        let caches: Vec<Arc<dyn ContextKeyedCache>> = vec![lookups.clone()];
        Self {
            inner: Arc::new(RegistryInner {
                contexts: RwLock::new(HashMap::new()),
                caches: RwLock::new(caches),
                lookups,
            }),
        }
    }

    /// Register a cache to be purged on every context teardown.
    pub fn register_cache(&self, cache: Arc<dyn ContextKeyedCache>) {
        self.inner
            .caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cache);
    }

    pub(crate) fn lookup_cache(&self) -> Arc<ContextCache<Option<ResourceOrigin>>> {
        self.inner.lookups.clone()
    }

    pub(crate) fn attach(&self, id: ContextId, context: Weak<ContextInner>) {
        self.inner
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, context);
    }

    pub(crate) fn detach(&self, id: ContextId) -> bool {
        self.inner
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Evict `id` from every registered cache.
    pub(crate) fn evict(&self, id: ContextId) -> usize {
        let caches = self
            .inner
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        caches
            .iter()
            .map(|cache| {
                let evicted = cache.evict(id);
                if evicted > 0 {
                    tracing::trace!(cache = cache.name(), context = %id, evicted, "evicted cache entries");
                }
                evicted
            })
            .sum()
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.inner
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of attached contexts.
    pub fn len(&self) -> usize {
        self.inner
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle to an attached context, if it is still alive.
    pub fn handle(&self, id: ContextId) -> Option<ContextHandle> {
        let contexts = self
            .inner
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let weak = contexts.get(&id)?;
        weak.upgrade().map(|inner| ContextHandle::from_inner(&inner))
    }

    /// Attached contexts that are still alive, sorted by artifact name.
    pub fn live(&self) -> Vec<ContextInfo> {
        let contexts = self
            .inner
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut live: Vec<ContextInfo> = contexts
            .values()
            .filter_map(Weak::upgrade)
            .map(|inner| inner.info())
            .collect();
        live.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        live
    }

    /// First attached context (by artifact name) exporting `resource`.
    pub fn resolve_exported(&self, resource: &str) -> Option<ContextInfo> {
        let contexts = self
            .inner
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<ContextInfo> = contexts
            .values()
            .filter_map(Weak::upgrade)
            .filter(|inner| inner.exports(resource))
            .map(|inner| inner.info())
            .collect();
        found.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        found.into_iter().next()
    }
}
