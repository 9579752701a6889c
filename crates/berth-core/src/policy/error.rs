//! Error types for the policy module.

use semver::Version;
use thiserror::Error;

/// An attach or detach was rejected. No mutation was applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyRegistrationError {
    #[error("policy template {template} is not registered")]
    UnknownTemplate { template: String },

    #[error("application {application} is not deployed")]
    UnknownApplication { application: String },

    #[error("application {application} already has a policy attached as {attachment}")]
    DuplicateAttachment {
        application: String,
        attachment: String,
    },

    #[error("application {application} has no policy attached as {attachment}")]
    UnknownAttachment {
        application: String,
        attachment: String,
    },

    #[error("template {template} requires plugin {plugin} {required}, application {application} bundles {found}")]
    IncompatiblePlugin {
        template: String,
        application: String,
        plugin: String,
        required: Version,
        found: Version,
    },

    #[error("template {template} failed to instantiate {attachment}: {reason}")]
    Instantiation {
        template: String,
        attachment: String,
        reason: String,
    },
}

/// Result type for policy registration operations.
pub type PolicyResult<T> = std::result::Result<T, PolicyRegistrationError>;

/// An invocation through a policy chain failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("application {0} is not deployed")]
    UnknownApplication(String),

    #[error("rejected by policy {attachment}: {reason}")]
    Rejected { attachment: String, reason: String },

    #[error("operation failed: {0}")]
    Failed(String),
}
