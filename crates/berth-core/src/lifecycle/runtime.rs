//! Seam to the execution engine that actually runs an artifact.
//!
//! The orchestrator never looks inside a runtime. It builds one per
//! deployment through a `RuntimeBuilder` and drives it through
//! `init -> start -> stop -> dispose`, each step bounded by a timeout.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use berth_repo::{ArtifactDescriptor, Coordinate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::PolicyFactory;
use crate::region::ContextHandle;

/// Lifecycle step of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePhase {
    Build,
    Init,
    Start,
    Stop,
    Dispose,
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimePhase::Build => "build",
            RuntimePhase::Init => "init",
            RuntimePhase::Start => "start",
            RuntimePhase::Stop => "stop",
            RuntimePhase::Dispose => "dispose",
        };
        f.write_str(s)
    }
}

/// Failure reported by a runtime hook.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn failed(reason: impl Into<String>) -> Self {
        RuntimeError::Failed(reason.into())
    }
}

/// A running artifact. Each hook may fail.
#[async_trait]
pub trait ArtifactRuntime: Send + Sync {
    async fn init(&mut self) -> Result<(), RuntimeError>;

    async fn start(&mut self) -> Result<(), RuntimeError>;

    async fn stop(&mut self) -> Result<(), RuntimeError>;

    async fn dispose(&mut self) -> Result<(), RuntimeError>;

    /// Policy artifacts expose the factory their template instantiates from.
    fn policy_factory(&self) -> Option<Arc<dyn PolicyFactory>> {
        None
    }
}

/// Domain an application was bound to.
#[derive(Debug, Clone)]
pub struct BoundDomain {
    pub artifact: String,
    pub coordinate: Coordinate,
    pub context: ContextHandle,
}

/// Everything a builder gets to construct one runtime.
#[derive(Debug)]
pub struct BuildRequest<'a> {
    pub artifact: &'a str,
    pub descriptor: &'a ArtifactDescriptor,
    /// Root of the exploded artifact
    pub location: &'a Path,
    pub domain: Option<&'a BoundDomain>,
    /// Weak handle; the runtime must not outlive the context through it.
    pub context: ContextHandle,
}

/// Constructs runtimes. Supplied by the embedding application.
pub trait RuntimeBuilder: Send + Sync {
    fn build(&self, request: BuildRequest<'_>) -> Result<Box<dyn ArtifactRuntime>, RuntimeError>;
}
