//! Artifact lifecycle: states, records, zombies, errors and the runtime seam.

mod error;
mod record;
mod runtime;
mod state;
mod zombie;

pub use error::{DeployError, DeployResult};
pub use record::{ArtifactSnapshot, DeploymentRecord, SlotKey};
pub use runtime::{
    ArtifactRuntime, BoundDomain, BuildRequest, RuntimeBuilder, RuntimeError, RuntimePhase,
};
pub use state::ArtifactState;
pub use zombie::{ZombieRegistry, ZombieSnapshot};
