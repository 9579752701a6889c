//! Artifact lifecycle states and legal transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one deployment record.
///
/// ```text
/// DISCOVERED -> RESOLVING -> DEPLOYING -> DEPLOYED -> UNDEPLOYING -> REMOVED
///                   |            |                        |
///                   +----------> FAILED <-----------------+
///                                  |
///                                  +--> RESOLVING   (files touched again)
///                                  +--> UNDEPLOYING (undeploy or shutdown)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    Discovered,
    Resolving,
    Deploying,
    Deployed,
    Failed,
    Undeploying,
    Removed,
}

impl ArtifactState {
    pub fn can_transition_to(self, next: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, next),
            (Discovered, Resolving)
                | (Resolving, Deploying)
                | (Resolving, Failed)
                | (Deploying, Deployed)
                | (Deploying, Failed)
                | (Deployed, Undeploying)
                | (Undeploying, Removed)
                | (Undeploying, Failed)
                | (Failed, Resolving)
                | (Failed, Undeploying)
        )
    }

    /// A zombie: failed and kept around with its cause.
    pub fn is_zombie(self) -> bool {
        self == ArtifactState::Failed
    }

    /// Deploy or undeploy work is running.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ArtifactState::Resolving | ArtifactState::Deploying | ArtifactState::Undeploying
        )
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactState::Discovered => "DISCOVERED",
            ArtifactState::Resolving => "RESOLVING",
            ArtifactState::Deploying => "DEPLOYING",
            ArtifactState::Deployed => "DEPLOYED",
            ArtifactState::Failed => "FAILED",
            ArtifactState::Undeploying => "UNDEPLOYING",
            ArtifactState::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}
