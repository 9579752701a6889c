//! Caches keyed by execution context.
//!
//! Any cache whose keys are contexts registers with the `ContextRegistry`
//! so that teardown evicts the context's entries.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::context::ContextId;

/// A cache the registry can purge when a context is torn down.
pub trait ContextKeyedCache: Send + Sync {
    fn name(&self) -> &str;

    /// Drop every entry belonging to `context`. Returns the number removed.
    fn evict(&self, context: ContextId) -> usize;
}

/// Simple per-context key/value cache.
#[derive(Debug)]
pub struct ContextCache<V> {
    name: String,
    entries: RwLock<HashMap<ContextId, HashMap<String, V>>>,
}

impl<V: Clone + Send + Sync + 'static> ContextCache<V> {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, context: ContextId, key: &str) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&context).and_then(|m| m.get(key)).cloned()
    }

    pub fn insert(&self, context: ContextId, key: impl Into<String>, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(context).or_default().insert(key.into(), value);
    }

    pub fn get_or_insert_with(&self, context: ContextId, key: &str, f: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(context, key) {
            return hit;
        }
        let value = f();
        self.insert(context, key, value.clone());
        value
    }

    pub fn len_for(&self, context: ContextId) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&context).map_or(0, HashMap::len)
    }

    /// Number of contexts with at least one entry.
    pub fn contexts(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<V: Clone + Send + Sync + 'static> ContextKeyedCache for ContextCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn evict(&self, context: ContextId) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&context).map_or(0, |m| m.len())
    }
}
