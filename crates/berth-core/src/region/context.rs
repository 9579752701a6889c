//! Execution context ownership, handles, probes and teardown.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use berth_repo::ArtifactKind;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::cache::ContextCache;
use super::namespace::{Namespace, ResourceOrigin};
use super::registry::{ContextInfo, ContextRegistry};

/// Identifier of one execution context. A redeploy always gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by execution contexts.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("execution context {context} is closed")]
    Closed { context: ContextId },

    #[error("failed to extract native library {}: {source}", path.display())]
    NativeLibrary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Something a runtime allocated that must be released on teardown
/// (connections, file handles, pools).
pub trait OwnedResource: Send {
    fn name(&self) -> &str;

    fn release(self: Box<Self>) -> anyhow::Result<()>;
}

struct TrackedTask {
    name: String,
    handle: JoinHandle<()>,
}

pub(crate) struct ContextInner {
    id: ContextId,
    artifact: String,
    kind: ArtifactKind,
    namespace: RwLock<Option<Namespace>>,
    native_dir: Option<PathBuf>,
    tasks: Mutex<Vec<TrackedTask>>,
    resources: Mutex<Vec<Box<dyn OwnedResource>>>,
    closed: AtomicBool,
    lookups: Arc<ContextCache<Option<ResourceOrigin>>>,
}

impl ContextInner {
    pub(crate) fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id,
            artifact: self.artifact.clone(),
            kind: self.kind,
        }
    }

    pub(crate) fn exports(&self, resource: &str) -> bool {
        self.namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|ns| ns.exports(resource))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// What to build a context from.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub artifact: String,
    pub kind: ArtifactKind,
    pub exported: Vec<String>,
    pub internal: Vec<String>,
    /// Domain context of an application
    pub parent: Option<ContextHandle>,
    /// Absolute paths of native libraries to extract
    pub native_libraries: Vec<PathBuf>,
    /// Per-artifact folder under which a fresh extraction folder is created
    pub native_root: PathBuf,
}

/// Outcome of [`ExecutionContext::teardown`].
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub context: ContextId,
    pub artifact: String,
    pub resources_released: usize,
    pub resource_failures: Vec<String>,
    pub tasks_cancelled: usize,
    pub cache_entries_evicted: usize,
    pub detached: bool,
    /// Extraction folder to hand to the cleanup scheduler
    pub native_dir: Option<PathBuf>,
    /// Strong references other than the owner's at the end of teardown
    pub outstanding_refs: usize,
}

/// Exclusive owner of one artifact's isolated context.
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
    registry: ContextRegistry,
    torn_down: bool,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("artifact", &self.inner.artifact)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl ExecutionContext {
    /// Build a context, extract its native libraries and attach it to `registry`.
    pub fn create(registry: &ContextRegistry, spec: ContextSpec) -> Result<Self, ContextError> {
        let id = ContextId::new();
        let native_dir = if spec.native_libraries.is_empty() {
            None
        } else {
            let dir = spec.native_root.join(id.to_string());
            extract_native_libraries(&dir, &spec.native_libraries)?;
            Some(dir)
        };

        let namespace = Namespace::new(spec.exported, spec.internal).with_parent(spec.parent);
        let inner = Arc::new(ContextInner {
            id,
            artifact: spec.artifact,
            kind: spec.kind,
            namespace: RwLock::new(Some(namespace)),
            native_dir,
            tasks: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            lookups: registry.lookup_cache(),
        });
        registry.attach(id, Arc::downgrade(&inner));
        debug!(context = %id, artifact = %inner.artifact, "execution context created");

        Ok(Self {
            inner,
            registry: registry.clone(),
            torn_down: false,
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn artifact(&self) -> &str {
        &self.inner.artifact
    }

    pub fn kind(&self) -> ArtifactKind {
        self.inner.kind
    }

    pub fn native_dir(&self) -> Option<&Path> {
        self.inner.native_dir.as_deref()
    }

    /// Weak handle for runtimes and child contexts.
    pub fn handle(&self) -> ContextHandle {
        ContextHandle::from_inner(&self.inner)
    }

    /// Weak observation used to verify the context is freed after teardown.
    pub fn probe(&self) -> ContextProbe {
        ContextProbe {
            id: self.inner.id,
            artifact: self.inner.artifact.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run the teardown protocol and give up ownership.
    pub async fn teardown(mut self) -> TeardownReport {
        let inner = self.inner.clone();
        let id = inner.id;

        // New spawns check `closed` under the same lock.
        let tasks = {
            let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut *tasks)
        };

        // 1. owned resources, last registered first
        let resources = std::mem::take(
            &mut *inner
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut resources_released = 0;
        let mut resource_failures = Vec::new();
        for resource in resources.into_iter().rev() {
            let name = resource.name().to_string();
            match resource.release() {
                Ok(()) => resources_released += 1,
                Err(e) => {
                    warn!(context = %id, resource = %name, error = %e, "failed to release resource");
                    resource_failures.push(format!("{name}: {e}"));
                }
            }
        }

        // 2. background tasks and timers
        let mut tasks_cancelled = 0;
        for task in tasks {
            if !task.handle.is_finished() {
                tasks_cancelled += 1;
            }
            task.handle.abort();
            if let Err(e) = task.handle.await {
                if e.is_panic() {
                    warn!(context = %id, task = %task.name, "context task panicked");
                }
            }
        }

        // 3. namespace and context-keyed caches
        inner
            .namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let cache_entries_evicted = self.registry.evict(id);

        // 4. unreachable from the registry
        let detached = self.registry.detach(id);
        self.torn_down = true;

        let report = TeardownReport {
            context: id,
            artifact: inner.artifact.clone(),
            resources_released,
            resource_failures,
            tasks_cancelled,
            cache_entries_evicted,
            detached,
            // 5. handed back to the caller
            native_dir: inner.native_dir.clone(),
            // ours and self's
            outstanding_refs: Arc::strong_count(&inner).saturating_sub(2),
        };
        if report.outstanding_refs > 0 {
            warn!(
                context = %id,
                artifact = %report.artifact,
                outstanding = report.outstanding_refs,
                "execution context still referenced after teardown"
            );
        }
        debug!(context = %id, artifact = %report.artifact, "execution context torn down");
        report
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // Dropped without teardown: stop what we can synchronously.
        let tasks = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.inner.closed.store(true, Ordering::Release);
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.handle.abort();
        }
        self.registry.evict(self.inner.id);
        self.registry.detach(self.inner.id);
    }
}

fn extract_native_libraries(dir: &Path, libraries: &[PathBuf]) -> Result<(), ContextError> {
    let result = (|| {
        std::fs::create_dir_all(dir).map_err(|source| ContextError::NativeLibrary {
            path: dir.to_path_buf(),
            source,
        })?;
        for library in libraries {
            let file_name = library.file_name().ok_or_else(|| ContextError::NativeLibrary {
                path: library.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
            })?;
            std::fs::copy(library, dir.join(file_name)).map_err(|source| {
                ContextError::NativeLibrary {
                    path: library.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    })();
    if result.is_err() {
        let _ = std::fs::remove_dir_all(dir);
    }
    result
}

/// Non-owning access to a context.
///
/// Every operation upgrades for the duration of the call only, so a handle
/// never extends the context's lifetime.
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    inner: Weak<ContextInner>,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

impl ContextHandle {
    pub(crate) fn from_inner(inner: &Arc<ContextInner>) -> Self {
        Self {
            id: inner.id,
            inner: Arc::downgrade(inner),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Alive and not yet torn down.
    pub fn is_live(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| !inner.is_closed())
    }

    pub fn artifact(&self) -> Option<String> {
        self.inner.upgrade().map(|inner| inner.artifact.clone())
    }

    pub fn native_dir(&self) -> Option<PathBuf> {
        self.inner.upgrade().and_then(|inner| inner.native_dir.clone())
    }

    fn open(&self) -> Result<Arc<ContextInner>, ContextError> {
        self.inner
            .upgrade()
            .filter(|inner| !inner.is_closed())
            .ok_or(ContextError::Closed { context: self.id })
    }

    /// Spawn a background task owned by the context. It is cancelled on teardown.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> Result<(), ContextError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = self.open()?;
        let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.is_closed() {
            return Err(ContextError::Closed { context: self.id });
        }
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask {
            name: name.into(),
            handle: tokio::spawn(future),
        });
        Ok(())
    }

    /// Run `tick` every `period` until the context is torn down.
    pub fn spawn_interval<F, Fut>(
        &self,
        name: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> Result<(), ContextError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                tick().await;
            }
        })
    }

    /// Hand ownership of a resource to the context.
    pub fn register_resource<R>(&self, resource: R) -> Result<(), ContextError>
    where
        R: OwnedResource + 'static,
    {
        let inner = self.open()?;
        let mut resources = inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inner.is_closed() {
            return Err(ContextError::Closed { context: self.id });
        }
        resources.push(Box::new(resource));
        Ok(())
    }

    /// Number of tracked tasks that are still running.
    pub fn running_tasks(&self) -> usize {
        self.inner.upgrade().map_or(0, |inner| {
            inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|t| !t.handle.is_finished())
                .count()
        })
    }

    pub fn exports(&self, resource: &str) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.exports(resource))
    }

    /// Resolve a resource through this context's namespace (cached per context).
    pub fn lookup(&self, resource: &str) -> Option<ResourceOrigin> {
        let inner = self.open().ok()?;
        inner.lookups.get_or_insert_with(inner.id, resource, || {
            inner
                .namespace
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .and_then(|ns| ns.lookup(resource))
        })
    }
}

/// Weak observation of a context for leak verification. Never resurrects it.
#[derive(Debug, Clone)]
pub struct ContextProbe {
    id: ContextId,
    artifact: String,
    inner: Weak<ContextInner>,
}

impl ContextProbe {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn is_collected(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// Poll every `poll` until collected or `timeout` elapses.
    pub async fn wait_collected(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_collected() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}
