//! Best-effort, bounded-retry cleanup of artifact-private files.
//!
//! Cleanup never fails or blocks a (re)deployment: tasks are spawned onto
//! the runtime and retried with a fixed delay. Each failed attempt is
//! logged; after the last one the task is dropped with a final warning.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CleanupConfig;
use crate::metrics::Metrics;

/// A filesystem cleanup step failed.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One idempotent cleanup action.
pub trait CleanupTask: Send + Sync + 'static {
    fn describe(&self) -> String;

    /// `true` once the target is gone (deleted now or already absent).
    fn attempt(&self) -> bool;
}

/// Recursively delete a directory.
#[derive(Debug, Clone)]
pub struct DirectoryCleanup {
    path: PathBuf,
}

impl DirectoryCleanup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(&self) -> Result<(), CleanupError> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CleanupError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl CleanupTask for DirectoryCleanup {
    fn describe(&self) -> String {
        format!("directory {}", self.path.display())
    }

    fn attempt(&self) -> bool {
        match self.remove() {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "cleanup attempt error");
                false
            }
        }
    }
}

/// Attempt limit and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl From<&CleanupConfig> for RetryPolicy {
    fn from(config: &CleanupConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CleanupConfig::default())
    }
}

/// How a cleanup task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed { attempts: u32 },
    GaveUp { attempts: u32 },
}

/// Spawns cleanup tasks with a shared retry policy.
#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl CleanupScheduler {
    pub fn new(policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self { policy, metrics }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `task` in the background. The caller may ignore the handle.
    pub fn schedule<T: CleanupTask>(&self, task: T) -> JoinHandle<CleanupOutcome> {
        let policy = self.policy;
        let metrics = self.metrics.clone();
        tokio::spawn(async move { run_with_retry(&task, policy, &metrics).await })
    }
}

/// Attempt `task` up to `policy.max_attempts` times, sleeping `policy.delay`
/// between attempts.
pub async fn run_with_retry(
    task: &dyn CleanupTask,
    policy: RetryPolicy,
    metrics: &Metrics,
) -> CleanupOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let target = task.describe();

    for attempt in 1..=max_attempts {
        if task.attempt() {
            debug!(target = %target, attempt, "cleanup completed");
            return CleanupOutcome::Completed { attempts: attempt };
        }
        if attempt == max_attempts {
            break;
        }
        metrics.inc_cleanup_retries();
        warn!(
            target = %target,
            attempt,
            max_attempts,
            "cleanup attempt failed, retrying"
        );
        tokio::time::sleep(policy.delay).await;
    }

    metrics.inc_cleanup_give_ups();
    warn!(
        target = %target,
        attempts = max_attempts,
        "cleanup failed after all attempts, giving up"
    );
    CleanupOutcome::GaveUp {
        attempts: max_attempts,
    }
}
