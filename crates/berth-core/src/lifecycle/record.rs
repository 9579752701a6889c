//! Deployment records and deployment slots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_repo::{ArtifactDescriptor, ArtifactKind, Coordinate, ResourceTimestamps};
use chrono::{DateTime, Utc};

use super::error::DeployError;
use super::runtime::ArtifactRuntime;
use super::state::ArtifactState;
use crate::region::{ContextHandle, ContextId, ContextProbe, ExecutionContext};

/// The unit operations serialize on: one deployment name of one kind.
///
/// A new version under the same name, patch or not, is a redeploy of that
/// slot. Differently named artifacts never replace each other, whatever
/// their coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub kind: ArtifactKind,
    pub artifact: String,
}

impl SlotKey {
    pub fn new(kind: ArtifactKind, artifact: &str) -> Self {
        Self {
            kind,
            artifact: artifact.to_string(),
        }
    }
}

/// One deployed (or failed) artifact instance.
///
/// Exclusively owns the artifact's runtime and execution context until an
/// undeploy takes them out.
pub struct DeploymentRecord {
    artifact: String,
    descriptor: Arc<ArtifactDescriptor>,
    location: PathBuf,
    state: ArtifactState,
    timestamps: ResourceTimestamps,
    domain: Option<String>,
    context: Option<ExecutionContext>,
    runtime: Option<Box<dyn ArtifactRuntime>>,
    probe: Option<ContextProbe>,
    cause: Option<Arc<DeployError>>,
    deployed_at: Option<DateTime<Utc>>,
    sequence: u64,
}

impl std::fmt::Debug for DeploymentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentRecord")
            .field("artifact", &self.artifact)
            .field("coordinate", &self.descriptor.coordinate)
            .field("state", &self.state)
            .field("domain", &self.domain)
            .finish()
    }
}

impl DeploymentRecord {
    pub fn new(
        artifact: impl Into<String>,
        descriptor: Arc<ArtifactDescriptor>,
        location: impl Into<PathBuf>,
        sequence: u64,
    ) -> Self {
        let location = location.into();
        let timestamps = ResourceTimestamps::capture(descriptor.watched_files(&location));
        Self {
            artifact: artifact.into(),
            descriptor,
            location,
            state: ArtifactState::Discovered,
            timestamps,
            domain: None,
            context: None,
            runtime: None,
            probe: None,
            cause: None,
            deployed_at: None,
            sequence,
        }
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn kind(&self) -> ArtifactKind {
        self.descriptor.kind
    }

    pub fn descriptor(&self) -> &Arc<ArtifactDescriptor> {
        &self.descriptor
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn state(&self) -> ArtifactState {
        self.state
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamps(&self) -> &ResourceTimestamps {
        &self.timestamps
    }

    pub fn probe(&self) -> Option<&ContextProbe> {
        self.probe.as_ref()
    }

    /// Retained failure of a zombie record.
    pub fn cause(&self) -> Option<&Arc<DeployError>> {
        self.cause.as_ref()
    }

    pub(crate) fn context_handle(&self) -> Option<ContextHandle> {
        self.context.as_ref().map(ExecutionContext::handle)
    }

    pub fn transition(&mut self, next: ArtifactState) -> Result<(), DeployError> {
        if !self.state.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                artifact: self.artifact.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn bind_domain(&mut self, domain: Option<String>) {
        self.domain = domain;
    }

    /// Hand the live runtime and context to the record (state DEPLOYED).
    pub(crate) fn mark_deployed(
        &mut self,
        runtime: Box<dyn ArtifactRuntime>,
        context: ExecutionContext,
    ) -> Result<(), DeployError> {
        self.transition(ArtifactState::Deployed)?;
        self.probe = Some(context.probe());
        self.runtime = Some(runtime);
        self.context = Some(context);
        self.cause = None;
        self.deployed_at = Some(Utc::now());
        Ok(())
    }

    /// Point a zombie at freshly parsed files. The record stays FAILED, with
    /// its cause, until it re-enters RESOLVING.
    pub(crate) fn retry(
        &mut self,
        descriptor: Arc<ArtifactDescriptor>,
        location: impl Into<PathBuf>,
        sequence: u64,
    ) {
        let location = location.into();
        self.timestamps = ResourceTimestamps::capture(descriptor.watched_files(&location));
        self.descriptor = descriptor;
        self.location = location;
        self.domain = None;
        self.sequence = sequence;
    }

    pub(crate) fn mark_failed(&mut self, cause: Arc<DeployError>) {
        // Failing is always allowed from a transient state; forced otherwise.
        self.state = ArtifactState::Failed;
        self.cause = Some(cause);
        self.deployed_at = None;
    }

    /// Move runtime and context out for teardown.
    pub(crate) fn take_live(
        &mut self,
    ) -> (Option<Box<dyn ArtifactRuntime>>, Option<ExecutionContext>) {
        (self.runtime.take(), self.context.take())
    }

    pub fn snapshot(&self) -> ArtifactSnapshot {
        ArtifactSnapshot {
            artifact: self.artifact.clone(),
            kind: self.descriptor.kind,
            coordinate: self.descriptor.coordinate.clone(),
            state: self.state,
            domain: self.domain.clone(),
            context: self.context.as_ref().map(ExecutionContext::id),
            redeployment_enabled: self.descriptor.redeployment_enabled,
            timestamps: self.timestamps.clone(),
            deployed_at: self.deployed_at,
            cause: self.cause.clone(),
        }
    }
}

/// Query view of a record.
#[derive(Debug, Clone)]
pub struct ArtifactSnapshot {
    pub artifact: String,
    pub kind: ArtifactKind,
    pub coordinate: Coordinate,
    pub state: ArtifactState,
    pub domain: Option<String>,
    pub context: Option<ContextId>,
    pub redeployment_enabled: bool,
    pub timestamps: ResourceTimestamps,
    pub deployed_at: Option<DateTime<Utc>>,
    pub cause: Option<Arc<DeployError>>,
}
