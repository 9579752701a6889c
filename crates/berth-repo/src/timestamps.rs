//! Modification-time snapshots of artifact files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

/// Last-modified times of a fixed set of files, captured at one instant.
///
/// A missing file is recorded as `None`, so a file appearing later counts
/// as a modification just like a file changing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTimestamps {
    entries: BTreeMap<PathBuf, Option<SystemTime>>,
}

impl ResourceTimestamps {
    /// Capture the current modification times of `paths`.
    pub fn capture<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let entries = paths
            .into_iter()
            .map(|p| {
                let path = p.into();
                let modified = modified_at(&path);
                (path, modified)
            })
            .collect();
        Self { entries }
    }

    /// True if any tracked file changed, appeared or disappeared since capture.
    pub fn is_modified(&self) -> bool {
        self.entries
            .iter()
            .any(|(path, recorded)| modified_at(path) != *recorded)
    }

    /// True if none of the tracked files exist any more.
    pub fn all_missing(&self) -> bool {
        self.entries.keys().all(|path| !path.exists())
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    pub fn get(&self, path: &Path) -> Option<SystemTime> {
        self.entries.get(path).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch_future(path: &Path) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn unchanged_files_are_not_modified() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "{}").unwrap();

        let ts = ResourceTimestamps::capture([&file]);
        assert!(!ts.is_modified());
        assert!(ts.get(&file).is_some());
    }

    #[test]
    fn touched_file_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "{}").unwrap();

        let ts = ResourceTimestamps::capture([&file]);
        touch_future(&file);
        assert!(ts.is_modified());
    }

    #[test]
    fn appearing_file_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("late.toml");

        let ts = ResourceTimestamps::capture([&file]);
        assert!(ts.all_missing());
        std::fs::write(&file, "x = 1").unwrap();
        assert!(ts.is_modified());
        assert!(!ts.all_missing());
    }

    #[test]
    fn deleted_file_is_modified_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, "{}").unwrap();

        let ts = ResourceTimestamps::capture([&file]);
        std::fs::remove_file(&file).unwrap();
        assert!(ts.is_modified());
        assert!(ts.all_missing());
    }
}
