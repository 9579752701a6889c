//! On-disk repository layout.
//!
//! ```text
//! <domains>/shared/artifact.json        exploded domain
//! <domains>/shared-anchor.txt           present while "shared" is deployed
//! <apps>/shop.tar.gz                    packed application, installed on next scan
//! <policies>/rate-limit/artifact.json   exploded policy
//! ```

use std::fs::File;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::coordinate::ArtifactKind;
use crate::descriptor::DESCRIPTOR_FILE;
use crate::error::RepoError;
use crate::Result;

/// Suffix of the marker file written next to a deployed artifact.
pub const ANCHOR_SUFFIX: &str = "-anchor.txt";

/// Suffix of packed (archived) artifacts.
pub const PACKED_SUFFIX: &str = ".tar.gz";

const ANCHOR_CONTENT: &str =
    "Delete this file while berth is running to undeploy the artifact in a clean way.\n";

/// Artifacts found in one kind's directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepoListing {
    /// Sub-directories (candidate exploded artifacts), sorted by name.
    pub exploded: Vec<String>,
    /// Archive names without the packed suffix, sorted by name.
    pub packed: Vec<String>,
}

/// The three artifact directories and the operations on their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRepository {
    domains: PathBuf,
    policies: PathBuf,
    applications: PathBuf,
}

impl ArtifactRepository {
    pub fn new(
        domains: impl Into<PathBuf>,
        policies: impl Into<PathBuf>,
        applications: impl Into<PathBuf>,
    ) -> Self {
        Self {
            domains: domains.into(),
            policies: policies.into(),
            applications: applications.into(),
        }
    }

    /// Conventional layout: `<root>/domains`, `<root>/policies`, `<root>/apps`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(
            root.join("domains"),
            root.join("policies"),
            root.join("apps"),
        )
    }

    /// Create any missing artifact directory.
    pub fn ensure_layout(&self) -> Result<()> {
        for kind in ArtifactKind::ALL {
            let dir = self.dir(kind);
            std::fs::create_dir_all(dir).map_err(|e| RepoError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn dir(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Domain => &self.domains,
            ArtifactKind::Policy => &self.policies,
            ArtifactKind::Application => &self.applications,
        }
    }

    pub fn artifact_dir(&self, kind: ArtifactKind, name: &str) -> PathBuf {
        self.dir(kind).join(name)
    }

    pub fn descriptor_path(&self, kind: ArtifactKind, name: &str) -> PathBuf {
        self.artifact_dir(kind, name).join(DESCRIPTOR_FILE)
    }

    pub fn archive_path(&self, kind: ArtifactKind, name: &str) -> PathBuf {
        self.dir(kind).join(format!("{name}{PACKED_SUFFIX}"))
    }

    pub fn anchor_path(&self, kind: ArtifactKind, name: &str) -> PathBuf {
        self.dir(kind).join(format!("{name}{ANCHOR_SUFFIX}"))
    }

    /// Whether an exploded directory or a packed archive exists for `name`.
    pub fn exists(&self, kind: ArtifactKind, name: &str) -> bool {
        self.artifact_dir(kind, name).is_dir() || self.archive_path(kind, name).is_file()
    }

    /// List exploded and packed artifacts of `kind`. Hidden entries are skipped.
    pub fn list(&self, kind: ArtifactKind) -> Result<RepoListing> {
        let dir = self.dir(kind);
        let mut listing = RepoListing::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(RepoError::io(dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| RepoError::io(dir, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                debug!(path = %entry.path().display(), "skipping non UTF-8 entry");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().map_err(|e| RepoError::io(entry.path(), e))?;
            if file_type.is_dir() {
                listing.exploded.push(name.to_string());
            } else if let Some(stem) = name.strip_suffix(PACKED_SUFFIX) {
                if !stem.is_empty() {
                    listing.packed.push(stem.to_string());
                }
            }
        }

        listing.exploded.sort();
        listing.packed.sort();
        Ok(listing)
    }

    /// Names of artifacts of `kind` that currently have an anchor.
    pub fn anchors(&self, kind: ArtifactKind) -> Result<Vec<String>> {
        let dir = self.dir(kind);
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RepoError::io(dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RepoError::io(dir, e))?;
            if let Some(name) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(ANCHOR_SUFFIX))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn has_anchor(&self, kind: ArtifactKind, name: &str) -> bool {
        self.anchor_path(kind, name).is_file()
    }

    pub fn write_anchor(&self, kind: ArtifactKind, name: &str) -> Result<()> {
        validate_name(name)?;
        let path = self.anchor_path(kind, name);
        std::fs::write(&path, ANCHOR_CONTENT).map_err(|e| RepoError::io(path, e))
    }

    /// Remove an anchor. Returns `false` if there was none.
    pub fn remove_anchor(&self, kind: ArtifactKind, name: &str) -> Result<bool> {
        let path = self.anchor_path(kind, name);
        remove_file_if_exists(&path)
    }

    /// Delete every anchor left over from a previous run.
    pub fn clear_anchors(&self) -> Result<usize> {
        let mut removed = 0;
        for kind in ArtifactKind::ALL {
            for name in self.anchors(kind)? {
                if self.remove_anchor(kind, &name)? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "removed stale anchor files");
        }
        Ok(removed)
    }

    /// Unpack `<name>.tar.gz` into `<dir>/<name>/`, replacing any exploded copy,
    /// then consume the archive.
    pub fn install(&self, kind: ArtifactKind, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let archive_path = self.archive_path(kind, name);
        let target = self.artifact_dir(kind, name);
        let staging = self.dir(kind).join(format!(".{name}.installing"));

        remove_dir_if_exists(&staging)?;
        std::fs::create_dir_all(&staging).map_err(|e| RepoError::io(&staging, e))?;

        let unpacked = File::open(&archive_path)
            .map_err(|e| e.to_string())
            .and_then(|file| {
                tar::Archive::new(GzDecoder::new(file))
                    .unpack(&staging)
                    .map_err(|e| e.to_string())
            });
        if let Err(reason) = unpacked {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(RepoError::Install {
                archive: archive_path,
                reason,
            });
        }

        remove_dir_if_exists(&target)?;
        std::fs::rename(&staging, &target).map_err(|e| RepoError::io(&target, e))?;
        remove_file_if_exists(&archive_path)?;
        debug!(artifact = %name, kind = %kind, "installed packed artifact");
        Ok(target)
    }

    /// Delete the exploded directory, packed archive and anchor of `name`.
    pub fn uninstall(&self, kind: ArtifactKind, name: &str) -> Result<()> {
        validate_name(name)?;
        remove_dir_if_exists(&self.artifact_dir(kind, name))?;
        remove_file_if_exists(&self.archive_path(kind, name))?;
        remove_file_if_exists(&self.anchor_path(kind, name))?;
        debug!(artifact = %name, kind = %kind, "uninstalled artifact");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(RepoError::InvalidName(name.to_string())),
    }
}

fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(RepoError::io(path, e)),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RepoError::io(path, e)),
    }
}
