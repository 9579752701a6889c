//! Artifact identity: kind, coordinate and plugin dependencies.

use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

/// The three kinds of deployable artifacts.
///
/// Declaration order is deployment order: domains first, then policies,
/// then applications. Shutdown walks it in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Domain,
    Policy,
    Application,
}

impl ArtifactKind {
    /// All kinds in deployment order.
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Domain,
        ArtifactKind::Policy,
        ArtifactKind::Application,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Domain => "domain",
            ArtifactKind::Policy => "policy",
            ArtifactKind::Application => "application",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group/name/version identity of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub group: String,
    pub name: String,
    pub version: Version,
}

impl Coordinate {
    pub fn new(group: impl Into<String>, name: impl Into<String>, version: Version) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)
    }
}

/// Same major and minor version.
pub(crate) fn compatible_versions(a: &Version, b: &Version) -> bool {
    a.major == b.major && a.minor == b.minor
}

/// A plugin bundled with (or required by) an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginDependency {
    pub name: String,
    pub version: Version,
}

impl PluginDependency {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Whether `other` can stand in for this plugin (same name, same major.minor).
    pub fn is_compatible_with(&self, other: &PluginDependency) -> bool {
        self.name == other.name && compatible_versions(&self.version, &other.version)
    }
}

impl fmt::Display for PluginDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
