//! Structured observability hooks for artifact lifecycle events.
//!
//! This module provides:
//! - Operation-scoped tracing spans via the `DeploySpan` RAII guard
//! - Emission functions for deploy, undeploy, zombie and scan events
//!
//! Every event carries a stable `event` field so logs can be filtered
//! without matching on message text.

use tracing::{info, warn};

use berth_repo::ArtifactKind;

/// RAII guard that enters an operation-scoped span for one artifact.
///
/// ```ignore
/// let _span = DeploySpan::enter("deploy", ArtifactKind::Application, "shop");
/// // events logged here carry op=deploy kind=application artifact=shop
/// ```
pub struct DeploySpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploySpan {
    pub fn enter(op: &str, kind: ArtifactKind, artifact: &str) -> Self {
        Self {
            _span: artifact_span(op, kind, artifact).entered(),
        }
    }
}

/// The span `DeploySpan` enters, for use with `Instrument` across awaits.
pub fn artifact_span(op: &str, kind: ArtifactKind, artifact: &str) -> tracing::Span {
    tracing::info_span!("berth.artifact", op = %op, kind = %kind, artifact = %artifact)
}

/// Emit event: deployment of an artifact started.
pub fn emit_deploy_started(kind: ArtifactKind, artifact: &str) {
    info!(event = "deploy.started", kind = %kind, artifact = %artifact);
}

/// Emit event: deployment finished, successfully or not.
pub fn emit_deploy_finished(kind: ArtifactKind, artifact: &str, duration_ms: u64, success: bool) {
    info!(
        event = "deploy.finished",
        kind = %kind,
        artifact = %artifact,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: an artifact was undeployed.
pub fn emit_undeployed(kind: ArtifactKind, artifact: &str, uninstalled: bool) {
    info!(
        event = "undeploy.finished",
        kind = %kind,
        artifact = %artifact,
        uninstalled = uninstalled,
    );
}

/// Emit event: an artifact was registered as a zombie (warn level).
pub fn emit_zombie_registered(kind: ArtifactKind, artifact: &str, cause: &dyn std::fmt::Display) {
    warn!(
        event = "zombie.registered",
        kind = %kind,
        artifact = %artifact,
        cause = %cause,
    );
}

/// Emit event: a watcher scan pass completed.
pub fn emit_scan_completed(deployed: usize, redeployed: usize, undeployed: usize, failed: usize) {
    info!(
        event = "scan.completed",
        deployed = deployed,
        redeployed = redeployed,
        undeployed = undeployed,
        failed = failed,
    );
}
