//! Error types for berth-repo

use std::path::PathBuf;

use thiserror::Error;

/// A descriptor could not be read or is malformed.
///
/// Fatal to the artifact it belongs to and nothing else.
#[derive(Error, Debug)]
pub enum ParseError {
    /// No descriptor file at the expected location
    #[error("descriptor not found: {}", path.display())]
    Missing { path: PathBuf },

    /// Descriptor exists but could not be read
    #[error("failed to read descriptor {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Descriptor is not valid JSON for the descriptor schema
    #[error("malformed descriptor {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Descriptor parsed but violates a structural rule
    #[error("invalid descriptor {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Errors raised while manipulating the repository on disk
#[derive(Error, Debug)]
pub enum RepoError {
    /// Filesystem error on a specific path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A packed archive could not be unpacked
    #[error("failed to install archive {}: {reason}", archive.display())]
    Install { archive: PathBuf, reason: String },

    /// Artifact names must be a single path component
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),
}

impl RepoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RepoError::Io {
            path: path.into(),
            source,
        }
    }
}
