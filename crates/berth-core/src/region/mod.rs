//! Isolated execution contexts ("regions").
//!
//! One `ExecutionContext` per deployed artifact. It owns the artifact's
//! namespace, the tasks and timers it spawns, the resources it registers and
//! its native-library extraction folder. Everything else reaches it through
//! a weak `ContextHandle`, so once `teardown` runs nothing keeps it alive.
//!
//! Teardown protocol:
//! 1. release owned resources (reverse registration order)
//! 2. cancel and await every task spawned through the context
//! 3. drop the namespace and evict context-keyed cache entries
//! 4. detach from the `ContextRegistry`
//! 5. hand the native-library folder back for asynchronous cleanup

mod cache;
mod context;
mod namespace;
mod registry;

pub use cache::{ContextCache, ContextKeyedCache};
pub use context::{
    ContextError, ContextHandle, ContextId, ContextProbe, ContextSpec, ExecutionContext,
    OwnedResource, TeardownReport,
};
pub use namespace::{Namespace, ResourceOrigin, Visibility};
pub use registry::{ContextInfo, ContextRegistry};
