//! Berth-Repo: filesystem artifact repository for Berth
//!
//! This crate owns everything Berth knows about artifacts at rest: their
//! identity, their descriptor file, and where they live on disk.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: descriptor parsing, repository layout, change detection inputs.
//!
//! ## Key Components
//!
//! - `ArtifactDescriptor`: parsed `artifact.json` for a domain, policy or application
//! - `DescriptorParser`: seam for descriptor parsing (`JsonDescriptorParser` by default)
//! - `ArtifactRepository`: directory layout, anchors, packed archive installation
//! - `ResourceTimestamps`: modification-time snapshots used for redeploy and zombie checks

mod coordinate;
mod descriptor;
mod error;
mod layout;
mod timestamps;

pub use coordinate::{ArtifactKind, Coordinate, PluginDependency};
pub use descriptor::{
    ArtifactDescriptor, DescriptorParser, DomainRef, JsonDescriptorParser, DESCRIPTOR_FILE,
};
pub use error::{ParseError, RepoError};
pub use layout::{ArtifactRepository, RepoListing, ANCHOR_SUFFIX, PACKED_SUFFIX};
pub use timestamps::ResourceTimestamps;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;
