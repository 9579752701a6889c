//! Artifact descriptors and the parser seam.
//!
//! Every exploded artifact carries an `artifact.json` at its root:
//!
//! ```json
//! {
//!   "group": "org.acme",
//!   "name": "shop",
//!   "version": "1.0.0",
//!   "kind": "application",
//!   "domain": { "named": { "name": "shared", "version": "1.0.0" } },
//!   "plugins": [{ "name": "http", "version": "1.4.0" }],
//!   "exported_resources": ["shop/api"],
//!   "native_libraries": ["lib/libcodec.so"],
//!   "config_files": ["conf/shop.toml"]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::coordinate::{ArtifactKind, Coordinate, PluginDependency};
use crate::error::ParseError;

/// File name of the descriptor inside an exploded artifact.
pub const DESCRIPTOR_FILE: &str = "artifact.json";

/// How an application names the domain it runs inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainRef {
    /// Exact group/name/version; no substitution is ever made.
    Exact(Coordinate),
    /// Symbolic name, optionally narrowed to a major.minor compatibility window.
    Named {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<Version>,
    },
}

impl DomainRef {
    pub fn named(name: impl Into<String>, version: Option<Version>) -> Self {
        DomainRef::Named {
            name: name.into(),
            version,
        }
    }

    /// Name the reference is looking for.
    pub fn name(&self) -> &str {
        match self {
            DomainRef::Exact(coordinate) => &coordinate.name,
            DomainRef::Named { name, .. } => name,
        }
    }
}

impl fmt::Display for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainRef::Exact(coordinate) => write!(f, "{coordinate}"),
            DomainRef::Named {
                name,
                version: Some(v),
            } => write!(f, "{name}@{}.{}.x", v.major, v.minor),
            DomainRef::Named {
                name,
                version: None,
            } => write!(f, "{name}@*"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Parsed, immutable description of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    #[serde(flatten)]
    pub coordinate: Coordinate,

    pub kind: ArtifactKind,

    /// Domain an application runs inside. `None` runs the application unbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainRef>,

    /// Lowest orchestrator version able to run this artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_runtime_version: Option<Version>,

    /// Whether a change to the descriptor or config files triggers a redeploy.
    #[serde(default = "default_true")]
    pub redeployment_enabled: bool,

    /// Plugins bundled with this artifact.
    #[serde(default)]
    pub plugins: Vec<PluginDependency>,

    /// Plugins a policy template needs to find (compatibly) in its target application.
    #[serde(default)]
    pub required_plugins: Vec<PluginDependency>,

    /// Resources visible to dependents.
    #[serde(default)]
    pub exported_resources: Vec<String>,

    /// Resources visible only inside the artifact.
    #[serde(default)]
    pub internal_resources: Vec<String>,

    /// Native libraries (relative to the artifact root) extracted per deployment.
    #[serde(default)]
    pub native_libraries: Vec<PathBuf>,

    /// Config files (relative to the artifact root) watched for redeploy.
    #[serde(default)]
    pub config_files: Vec<PathBuf>,

    /// Free-form properties handed to the runtime builder.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl ArtifactDescriptor {
    /// Minimal descriptor with no dependencies or resources.
    pub fn new(coordinate: Coordinate, kind: ArtifactKind) -> Self {
        Self {
            coordinate,
            kind,
            domain: None,
            min_runtime_version: None,
            redeployment_enabled: true,
            plugins: Vec::new(),
            required_plugins: Vec::new(),
            exported_resources: Vec::new(),
            internal_resources: Vec::new(),
            native_libraries: Vec::new(),
            config_files: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Files whose modification triggers a redeploy, absolute under `root`.
    pub fn watched_files(&self, root: &Path) -> Vec<PathBuf> {
        std::iter::once(root.join(DESCRIPTOR_FILE))
            .chain(self.config_files.iter().map(|p| root.join(p)))
            .collect()
    }

    fn validate(&self, path: &Path) -> Result<(), ParseError> {
        let invalid = |reason: String| ParseError::Invalid {
            path: path.to_path_buf(),
            reason,
        };

        if self.coordinate.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.coordinate.group.trim().is_empty() {
            return Err(invalid("group must not be empty".into()));
        }
        if self.domain.is_some() && self.kind != ArtifactKind::Application {
            return Err(invalid(format!(
                "only applications may declare a domain, found {}",
                self.kind
            )));
        }
        for file in self.native_libraries.iter().chain(&self.config_files) {
            if !is_contained(file) {
                return Err(invalid(format!(
                    "{} escapes the artifact directory",
                    file.display()
                )));
            }
        }
        Ok(())
    }
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Parses the descriptor of an exploded artifact.
pub trait DescriptorParser: Send + Sync {
    fn parse(&self, artifact_dir: &Path) -> Result<ArtifactDescriptor, ParseError>;
}

/// Reads `artifact.json` with `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDescriptorParser;

impl DescriptorParser for JsonDescriptorParser {
    fn parse(&self, artifact_dir: &Path) -> Result<ArtifactDescriptor, ParseError> {
        let path = artifact_dir.join(DESCRIPTOR_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParseError::Missing { path })
            }
            Err(source) => return Err(ParseError::Io { path, source }),
        };
        let descriptor: ArtifactDescriptor =
            serde_json::from_slice(&raw).map_err(|source| ParseError::Malformed {
                path: path.clone(),
                source,
            })?;
        descriptor.validate(&path)?;
        Ok(descriptor)
    }
}
