//! Deployment lifecycle observers.
//!
//! Observers are called inline, in the order of the artifact's own
//! transitions. `CompositeListener` fans out to every registered observer;
//! a panicking observer is logged and does not affect the others.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use berth_repo::ArtifactKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use crate::lifecycle::DeployError;
use crate::region::ContextHandle;

/// Receives lifecycle notifications. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait DeploymentListener: Send + Sync {
    fn on_deployment_start(&self, kind: ArtifactKind, artifact: &str) {}

    fn on_deployment_success(&self, kind: ArtifactKind, artifact: &str) {}

    fn on_deployment_failure(&self, kind: ArtifactKind, artifact: &str, cause: &Arc<DeployError>) {
    }

    fn on_undeployment_start(&self, kind: ArtifactKind, artifact: &str) {}

    fn on_undeployment_success(&self, kind: ArtifactKind, artifact: &str) {}

    fn on_undeployment_failure(
        &self,
        kind: ArtifactKind,
        artifact: &str,
        cause: &Arc<DeployError>,
    ) {
    }

    /// Execution context built, runtime not yet constructed.
    fn on_artifact_created(&self, kind: ArtifactKind, artifact: &str, context: &ContextHandle) {}

    /// Runtime constructed from the descriptor.
    fn on_artifact_configured(&self, kind: ArtifactKind, artifact: &str, context: &ContextHandle) {
    }

    /// Runtime `init` completed.
    fn on_artifact_initialised(&self, kind: ArtifactKind, artifact: &str, context: &ContextHandle) {
    }
}

/// Fan-out to any number of listeners.
#[derive(Default)]
pub struct CompositeListener {
    listeners: RwLock<Vec<Arc<dyn DeploymentListener>>>,
}

impl std::fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.len())
            .finish()
    }
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DeploymentListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn each(&self, notification: &str, f: impl Fn(&dyn DeploymentListener)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!(notification, "deployment listener panicked");
            }
        }
    }
}

impl DeploymentListener for CompositeListener {
    fn on_deployment_start(&self, kind: ArtifactKind, artifact: &str) {
        self.each("deployment_start", |l| l.on_deployment_start(kind, artifact));
    }

    fn on_deployment_success(&self, kind: ArtifactKind, artifact: &str) {
        self.each("deployment_success", |l| {
            l.on_deployment_success(kind, artifact)
        });
    }

    fn on_deployment_failure(&self, kind: ArtifactKind, artifact: &str, cause: &Arc<DeployError>) {
        self.each("deployment_failure", |l| {
            l.on_deployment_failure(kind, artifact, cause)
        });
    }

    fn on_undeployment_start(&self, kind: ArtifactKind, artifact: &str) {
        self.each("undeployment_start", |l| {
            l.on_undeployment_start(kind, artifact)
        });
    }

    fn on_undeployment_success(&self, kind: ArtifactKind, artifact: &str) {
        self.each("undeployment_success", |l| {
            l.on_undeployment_success(kind, artifact)
        });
    }

    fn on_undeployment_failure(
        &self,
        kind: ArtifactKind,
        artifact: &str,
        cause: &Arc<DeployError>,
    ) {
        self.each("undeployment_failure", |l| {
            l.on_undeployment_failure(kind, artifact, cause)
        });
    }

    fn on_artifact_created(&self, kind: ArtifactKind, artifact: &str, context: &ContextHandle) {
        self.each("artifact_created", |l| {
            l.on_artifact_created(kind, artifact, context)
        });
    }

    fn on_artifact_configured(&self, kind: ArtifactKind, artifact: &str, context: &ContextHandle) {
        self.each("artifact_configured", |l| {
            l.on_artifact_configured(kind, artifact, context)
        });
    }

    fn on_artifact_initialised(&self, kind: ArtifactKind, artifact: &str, context: &ContextHandle) {
        self.each("artifact_initialised", |l| {
            l.on_artifact_initialised(kind, artifact, context)
        });
    }
}

/// Deployment or undeployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deployment,
    Undeployment,
}

/// Phase of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    Success,
    Failure,
}

/// Immutable record of one lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub artifact: String,
    pub kind: ArtifactKind,
    pub operation: Operation,
    pub phase: Phase,
    /// Display form of the failure cause
    pub cause: Option<String>,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    fn new(kind: ArtifactKind, artifact: &str, operation: Operation, phase: Phase) -> Self {
        Self {
            artifact: artifact.to_string(),
            kind,
            operation,
            phase,
            cause: None,
            at: Utc::now(),
        }
    }

    /// Compact `artifact:operation:phase` label, handy in assertions.
    pub fn label(&self) -> String {
        let op = match self.operation {
            Operation::Deployment => "deploy",
            Operation::Undeployment => "undeploy",
        };
        let phase = match self.phase {
            Phase::Start => "start",
            Phase::Success => "success",
            Phase::Failure => "failure",
        };
        format!("{}:{op}:{phase}", self.artifact)
    }
}

/// Listener that records every start/success/failure event in delivery order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<LifecycleEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events().iter().map(LifecycleEvent::label).collect()
    }

    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, event: LifecycleEvent) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl DeploymentListener for EventLog {
    fn on_deployment_start(&self, kind: ArtifactKind, artifact: &str) {
        self.push(LifecycleEvent::new(kind, artifact, Operation::Deployment, Phase::Start));
    }

    fn on_deployment_success(&self, kind: ArtifactKind, artifact: &str) {
        self.push(LifecycleEvent::new(kind, artifact, Operation::Deployment, Phase::Success));
    }

    fn on_deployment_failure(&self, kind: ArtifactKind, artifact: &str, cause: &Arc<DeployError>) {
        let mut event = LifecycleEvent::new(kind, artifact, Operation::Deployment, Phase::Failure);
        event.cause = Some(cause.to_string());
        self.push(event);
    }

    fn on_undeployment_start(&self, kind: ArtifactKind, artifact: &str) {
        self.push(LifecycleEvent::new(kind, artifact, Operation::Undeployment, Phase::Start));
    }

    fn on_undeployment_success(&self, kind: ArtifactKind, artifact: &str) {
        self.push(LifecycleEvent::new(kind, artifact, Operation::Undeployment, Phase::Success));
    }

    fn on_undeployment_failure(
        &self,
        kind: ArtifactKind,
        artifact: &str,
        cause: &Arc<DeployError>,
    ) {
        let mut event =
            LifecycleEvent::new(kind, artifact, Operation::Undeployment, Phase::Failure);
        event.cause = Some(cause.to_string());
        self.push(event);
    }
}
