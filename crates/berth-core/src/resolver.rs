//! Domain dependency resolution.
//!
//! Binds an application to exactly one deployed domain. Resolution is a pure
//! function over the currently deployed domains; it never picks silently
//! between several candidates and never substitutes a different version for
//! an exact reference.

use berth_repo::{Coordinate, DomainRef};
use thiserror::Error;

/// Why an application could not be bound to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no deployed domain matches {reference}")]
    NotFound { reference: String },

    #[error("domain reference {reference} is ambiguous, candidates: {}", candidates.join(", "))]
    Ambiguous {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("domain {name} is deployed but no version is compatible with {reference} (available: {})", available.join(", "))]
    IncompatibleVersion {
        name: String,
        reference: String,
        available: Vec<String>,
    },
}

/// A deployed domain that may satisfy a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainCandidate {
    /// Deployment name (directory name) of the domain
    pub artifact: String,
    pub coordinate: Coordinate,
}

impl DomainCandidate {
    pub fn new(artifact: impl Into<String>, coordinate: Coordinate) -> Self {
        Self {
            artifact: artifact.into(),
            coordinate,
        }
    }

    fn answers_to(&self, name: &str) -> bool {
        self.coordinate.name == name || self.artifact == name
    }
}

/// Pick the single domain satisfying `reference` among `deployed`.
///
/// * `Exact` requires group, name and full version to match.
/// * `Named` matches on name (coordinate name or deployment name); with a
///   version, only candidates sharing its major.minor are compatible.
///   More than one compatible candidate is `Ambiguous`.
pub fn resolve_domain(
    reference: &DomainRef,
    deployed: &[DomainCandidate],
) -> Result<DomainCandidate, ResolutionError> {
    match reference {
        DomainRef::Exact(coordinate) => deployed
            .iter()
            .find(|c| c.coordinate == *coordinate)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound {
                reference: reference.to_string(),
            }),
        DomainRef::Named { name, version } => {
            let by_name: Vec<&DomainCandidate> =
                deployed.iter().filter(|c| c.answers_to(name)).collect();
            if by_name.is_empty() {
                return Err(ResolutionError::NotFound {
                    reference: reference.to_string(),
                });
            }

            let compatible: Vec<&DomainCandidate> = by_name
                .iter()
                .copied()
                .filter(|c| {
                    version.as_ref().map_or(true, |v| {
                        c.coordinate.version.major == v.major
                            && c.coordinate.version.minor == v.minor
                    })
                })
                .collect();

            match compatible.as_slice() {
                [single] => Ok((*single).clone()),
                [] => Err(ResolutionError::IncompatibleVersion {
                    name: name.clone(),
                    reference: reference.to_string(),
                    available: sorted(by_name.iter().map(|c| c.coordinate.to_string())),
                }),
                many => Err(ResolutionError::Ambiguous {
                    reference: reference.to_string(),
                    candidates: sorted(many.iter().map(|c| c.artifact.clone())),
                }),
            }
        }
    }
}

fn sorted(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut v: Vec<String> = items.collect();
    v.sort();
    v
}
