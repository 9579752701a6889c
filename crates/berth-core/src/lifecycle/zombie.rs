//! Bookkeeping for artifacts that failed to deploy.
//!
//! A zombie stays registered, with its cause, until the files it failed on
//! change again (then it is retried) or disappear (then it is forgotten).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use berth_repo::{ArtifactKind, ResourceTimestamps};
use chrono::{DateTime, Utc};

use super::error::DeployError;

#[derive(Debug, Clone)]
struct ZombieEntry {
    timestamps: ResourceTimestamps,
    cause: Arc<DeployError>,
    since: DateTime<Utc>,
}

/// Query view of one zombie.
#[derive(Debug, Clone)]
pub struct ZombieSnapshot {
    pub kind: ArtifactKind,
    pub artifact: String,
    /// Tracked files with the modification time recorded at failure
    pub files: Vec<(PathBuf, Option<SystemTime>)>,
    pub cause: Arc<DeployError>,
    pub since: DateTime<Utc>,
}

/// Failed artifacts keyed by kind and name.
#[derive(Debug, Default)]
pub struct ZombieRegistry {
    entries: RwLock<BTreeMap<(ArtifactKind, String), ZombieEntry>>,
}

impl ZombieRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: ArtifactKind,
        artifact: &str,
        timestamps: ResourceTimestamps,
        cause: Arc<DeployError>,
    ) {
        let entry = ZombieEntry {
            timestamps,
            cause,
            since: Utc::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, artifact.to_string()), entry);
    }

    pub fn remove(&self, kind: ArtifactKind, artifact: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, artifact.to_string()))
            .is_some()
    }

    pub fn contains(&self, kind: ArtifactKind, artifact: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(kind, artifact.to_string()))
    }

    pub fn cause(&self, kind: ArtifactKind, artifact: &str) -> Option<Arc<DeployError>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, artifact.to_string()))
            .map(|e| e.cause.clone())
    }

    /// Whether a deployment attempt is warranted: unknown artifacts are,
    /// zombies only once one of their files changed.
    pub fn is_updated(&self, kind: ArtifactKind, artifact: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, artifact.to_string()))
            .map_or(true, |e| e.timestamps.is_modified())
    }

    /// Forget zombies whose files are all gone. Returns what was dropped.
    pub fn prune_missing(&self) -> Vec<(ArtifactKind, String)> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let gone: Vec<(ArtifactKind, String)> = entries
            .iter()
            .filter(|(_, e)| e.timestamps.all_missing())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &gone {
            entries.remove(key);
        }
        gone
    }

    pub fn snapshot(&self) -> Vec<ZombieSnapshot> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|((kind, artifact), e)| ZombieSnapshot {
                kind: *kind,
                artifact: artifact.clone(),
                files: e
                    .timestamps
                    .paths()
                    .map(|p| (p.to_path_buf(), e.timestamps.get(p)))
                    .collect(),
                cause: e.cause.clone(),
                since: e.since,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
