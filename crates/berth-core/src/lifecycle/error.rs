//! Error taxonomy for artifact lifecycle operations.

use std::sync::Arc;

use berth_repo::{ArtifactKind, ParseError, RepoError};
use semver::Version;
use thiserror::Error;

use super::runtime::{RuntimeError, RuntimePhase};
use super::state::ArtifactState;
use crate::policy::PolicyRegistrationError;
use crate::region::ContextError;
use crate::resolver::ResolutionError;

/// Why a deploy, redeploy or undeploy failed.
///
/// Failures are retained on zombie records and fanned out to observers as
/// `Arc<DeployError>` so the original cause survives unchanged.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("{artifact} is a {found}, expected a {expected}")]
    KindMismatch {
        artifact: String,
        expected: ArtifactKind,
        found: ArtifactKind,
    },

    #[error("{artifact} requires runtime {required} or later, this is {actual}")]
    RuntimeVersion {
        artifact: String,
        required: Version,
        actual: Version,
    },

    #[error("failed to resolve the domain of {artifact}: {source}")]
    Resolution {
        artifact: String,
        #[source]
        source: ResolutionError,
    },

    #[error("domain {domain} of {artifact} failed: {cause}")]
    DomainFailed {
        artifact: String,
        domain: String,
        #[source]
        cause: Arc<DeployError>,
    },

    #[error("execution context of {artifact}: {source}")]
    Context {
        artifact: String,
        #[source]
        source: ContextError,
    },

    #[error("{phase} of {artifact} failed: {source}")]
    Runtime {
        artifact: String,
        phase: RuntimePhase,
        #[source]
        source: RuntimeError,
    },

    #[error("{phase} of {artifact} timed out after {limit_ms}ms")]
    Timeout {
        artifact: String,
        phase: RuntimePhase,
        limit_ms: u64,
    },

    #[error("policy artifact {artifact} does not provide a policy factory")]
    MissingPolicyFactory { artifact: String },

    #[error(transparent)]
    PolicyRegistration(#[from] PolicyRegistrationError),

    #[error("{kind} {artifact} is not deployed")]
    NotDeployed { kind: ArtifactKind, artifact: String },

    #[error("{artifact} cannot move from {from} to {to}")]
    InvalidTransition {
        artifact: String,
        from: ArtifactState,
        to: ArtifactState,
    },
}

impl DeployError {
    /// True for dependency resolution failures, including a failed domain.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            DeployError::Resolution { .. } | DeployError::DomainFailed { .. }
        )
    }
}

/// Result of a service operation; the error is shared with zombie records
/// and observers.
pub type DeployResult<T> = std::result::Result<T, Arc<DeployError>>;
