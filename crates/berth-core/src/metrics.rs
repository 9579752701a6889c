//! Atomic counters for orchestrator observability.
//!
//! Each `DeploymentService` owns one `Metrics` instance (shared with its
//! watcher and cleanup scheduler through an `Arc`). Counters are bumped
//! silently; [`Metrics::flush`] emits the current values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lightweight atomic counters, no allocations, no locking.
#[derive(Debug, Default)]
pub struct Metrics {
    deployments: AtomicU64,
    deployment_failures: AtomicU64,
    undeployments: AtomicU64,
    redeployments: AtomicU64,
    cleanup_retries: AtomicU64,
    cleanup_give_ups: AtomicU64,
    scans: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub deployments: u64,
    pub deployment_failures: u64,
    pub undeployments: u64,
    pub redeployments: u64,
    pub cleanup_retries: u64,
    pub cleanup_give_ups: u64,
    pub scans: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            deployments: AtomicU64::new(0),
            deployment_failures: AtomicU64::new(0),
            undeployments: AtomicU64::new(0),
            redeployments: AtomicU64::new(0),
            cleanup_retries: AtomicU64::new(0),
            cleanup_give_ups: AtomicU64::new(0),
            scans: AtomicU64::new(0),
        }
    }

    pub fn inc_deployments(&self) {
        bump(&self.deployments, "deployments");
    }

    pub fn inc_deployment_failures(&self) {
        bump(&self.deployment_failures, "deployment_failures");
    }

    pub fn inc_undeployments(&self) {
        bump(&self.undeployments, "undeployments");
    }

    pub fn inc_redeployments(&self) {
        bump(&self.redeployments, "redeployments");
    }

    pub fn inc_cleanup_retries(&self) {
        bump(&self.cleanup_retries, "cleanup_retries");
    }

    pub fn inc_cleanup_give_ups(&self) {
        bump(&self.cleanup_give_ups, "cleanup_give_ups");
    }

    pub fn inc_scans(&self) {
        bump(&self.scans, "scans");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deployments: self.deployments.load(Ordering::Relaxed),
            deployment_failures: self.deployment_failures.load(Ordering::Relaxed),
            undeployments: self.undeployments.load(Ordering::Relaxed),
            redeployments: self.redeployments.load(Ordering::Relaxed),
            cleanup_retries: self.cleanup_retries.load(Ordering::Relaxed),
            cleanup_give_ups: self.cleanup_give_ups.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (end of a scan, shutdown) rather than on
    /// every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            deployments = s.deployments,
            deployment_failures = s.deployment_failures,
            undeployments = s.undeployments,
            redeployments = s.redeployments,
            cleanup_retries = s.cleanup_retries,
            cleanup_give_ups = s.cleanup_give_ups,
            scans = s.scans,
        );
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.deployments,
            &self.deployment_failures,
            &self.undeployments,
            &self.redeployments,
            &self.cleanup_retries,
            &self.cleanup_give_ups,
            &self.scans,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric = name, "counter incremented");
}
