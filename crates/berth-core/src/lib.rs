//! Berth Core Library
//!
//! Deploys, redeploys and undeploys domains, policies and applications from
//! a filesystem repository into isolated execution contexts.

pub mod cleanup;
pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod obs;
pub mod observer;
pub mod policy;
pub mod region;
pub mod resolver;
pub mod service;
pub mod telemetry;
pub mod watcher;

pub use cleanup::{
    run_with_retry, CleanupError, CleanupOutcome, CleanupScheduler, CleanupTask,
    DirectoryCleanup, RetryPolicy,
};
pub use config::{
    BerthConfig, CleanupConfig, ConfigError, LifecycleConfig, LoggingConfig, RepositoryConfig,
    WatcherConfig, WatcherMode,
};
pub use lifecycle::{
    ArtifactRuntime, ArtifactSnapshot, ArtifactState, BoundDomain, BuildRequest, DeployError,
    DeployResult, DeploymentRecord, RuntimeBuilder, RuntimeError, RuntimePhase, SlotKey,
    ZombieRegistry, ZombieSnapshot,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use obs::{
    artifact_span, emit_deploy_finished, emit_deploy_started, emit_scan_completed,
    emit_undeployed, emit_zombie_registered, DeploySpan,
};
pub use observer::{
    CompositeListener, DeploymentListener, EventLog, LifecycleEvent, Operation, Phase,
};
pub use policy::{
    AttachmentInfo, ChainLink, DetachedPolicy, EffectiveChain, InvocationError,
    InvocationParams, InvocationResult, Next, NotificationAction, Pointcut, Policy,
    PolicyFactory, PolicyManager, PolicyNotification, PolicyNotificationListener,
    PolicyParametrization, PolicyRegistrationError, PolicyResult, PolicyTemplate,
    WrappedOperation,
};
pub use region::{
    ContextCache, ContextError, ContextHandle, ContextId, ContextInfo, ContextKeyedCache,
    ContextProbe, ContextRegistry, ContextSpec, ExecutionContext, Namespace, OwnedResource,
    ResourceOrigin, TeardownReport, Visibility,
};
pub use resolver::{resolve_domain, DomainCandidate, ResolutionError};
pub use service::DeploymentService;
pub use telemetry::init_tracing;
pub use watcher::{DirectoryWatcher, ScanReport, WatcherHandle};
