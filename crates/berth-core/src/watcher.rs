//! Polling watcher over the artifact repository.
//!
//! Each pass handles domains, then policies, then applications. A kind's
//! work (undeploys, then deploys and redeploys) finishes before the next
//! kind starts, in both sequential and parallel mode.

use std::sync::Arc;

use berth_repo::ArtifactKind;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{WatcherConfig, WatcherMode};
use crate::lifecycle::{ArtifactState, DeployResult};
use crate::obs;
use crate::service::DeploymentService;

const PASS_ORDER: [ArtifactKind; 3] = [
    ArtifactKind::Domain,
    ArtifactKind::Policy,
    ArtifactKind::Application,
];

/// What one scan pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// The administrative lock was held; nothing was looked at.
    pub skipped: bool,
    pub deployed: Vec<String>,
    pub redeployed: Vec<String>,
    pub undeployed: Vec<String>,
    pub failed: Vec<String>,
}

impl ScanReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, name: String, redeploy: bool, result: &DeployResult<()>) {
        match (result, redeploy) {
            (Ok(()), false) => self.deployed.push(name),
            (Ok(()), true) => self.redeployed.push(name),
            (Err(_), _) => self.failed.push(name),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deployed.is_empty()
            && self.redeployed.is_empty()
            && self.undeployed.is_empty()
            && self.failed.is_empty()
    }
}

/// Turns repository changes into service calls.
#[derive(Debug, Clone)]
pub struct DirectoryWatcher {
    service: Arc<DeploymentService>,
    config: WatcherConfig,
}

/// Running monitor task.
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    initial: ScanReport,
}

impl WatcherHandle {
    /// Result of the deployment pass run at start.
    pub fn initial_scan(&self) -> &ScanReport {
        &self.initial
    }

    /// False when a fixed artifact set was deployed and no monitor runs.
    pub fn is_monitoring(&self) -> bool {
        self.task.is_some()
    }

    /// Cancel the monitor and wait for an in-progress pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!(error = %e, "directory watcher task failed");
            }
        }
    }
}

impl DirectoryWatcher {
    pub fn new(service: Arc<DeploymentService>) -> Self {
        let config = service.config().watcher.clone();
        Self { service, config }
    }

    pub fn service(&self) -> &Arc<DeploymentService> {
        &self.service
    }

    /// Prepare the repository, run the first pass and, unless a fixed
    /// artifact set is configured, start the periodic monitor.
    pub async fn start(self) -> berth_repo::Result<WatcherHandle> {
        let repository = self.service.repository();
        repository.ensure_layout()?;
        repository.clear_anchors()?;

        let (shutdown, mut stopped) = watch::channel(false);
        if let Some(fixed) = self.config.fixed_artifacts.clone() {
            let initial = self.deploy_fixed(&fixed).await;
            info!(applications = fixed.len(), "fixed artifact set deployed, not monitoring");
            return Ok(WatcherHandle {
                shutdown,
                task: None,
                initial,
            });
        }

        let initial = self.scan().await;
        let period = self.config.poll_interval();
        let poll_interval_ms = self.config.poll_interval_ms;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.scan().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("directory watcher stopped");
        });
        info!(poll_interval_ms, "directory watcher started");
        Ok(WatcherHandle {
            shutdown,
            task: Some(task),
            initial,
        })
    }

    /// One pass over the repository. Skipped while the administrative lock
    /// is held elsewhere.
    pub async fn scan(&self) -> ScanReport {
        let Some(_admin) = self.service.try_lock_admin() else {
            debug!("administrative lock held, skipping scan");
            return ScanReport::skipped();
        };

        for (kind, name) in self.service.forget_missing_zombies() {
            debug!(kind = %kind, artifact = %name, "zombie files removed, forgetting it");
        }

        let mut report = ScanReport::default();
        for kind in PASS_ORDER {
            self.undeploy_removed(kind, &mut report).await;
            let work = self.pending(kind);
            self.run(kind, work, &mut report).await;
        }

        self.service.metrics().inc_scans();
        obs::emit_scan_completed(
            report.deployed.len(),
            report.redeployed.len(),
            report.undeployed.len(),
            report.failed.len(),
        );
        report
    }

    /// Deploy every domain and policy plus the listed applications, once.
    async fn deploy_fixed(&self, applications: &[String]) -> ScanReport {
        let mut report = ScanReport::default();
        for kind in [ArtifactKind::Domain, ArtifactKind::Policy] {
            let work = self.pending(kind);
            self.run(kind, work, &mut report).await;
        }
        let work = self
            .pending(ArtifactKind::Application)
            .into_iter()
            .filter(|(name, _)| applications.contains(name))
            .collect();
        self.run(ArtifactKind::Application, work, &mut report).await;
        for missing in applications {
            if !self.service.repository().exists(ArtifactKind::Application, missing) {
                warn!(artifact = %missing, "fixed application not found in repository");
            }
        }
        report
    }

    /// Deployed artifacts whose directory or anchor is gone. The service
    /// checks again under the artifact's lock; a redeploy in between wins.
    async fn undeploy_removed(&self, kind: ArtifactKind, report: &mut ScanReport) {
        let repository = self.service.repository();
        let candidates: Vec<String> = self
            .service
            .artifacts(kind)
            .into_iter()
            .filter(|s| s.state == ArtifactState::Deployed)
            .filter(|s| {
                !repository.exists(kind, &s.artifact) || !repository.has_anchor(kind, &s.artifact)
            })
            .map(|s| s.artifact)
            .collect();

        for name in candidates {
            match self.service.undeploy_if_removed(kind, &name).await {
                None => debug!(kind = %kind, artifact = %name, "artifact back in place, kept"),
                Some(Ok(())) => report.undeployed.push(name),
                Some(Err(e)) => {
                    warn!(
                        kind = %kind,
                        artifact = %name,
                        error = %e,
                        "undeploy of removed artifact failed"
                    );
                    report.failed.push(name);
                }
            }
        }
    }

    /// Artifacts of `kind` to deploy (`false`) or redeploy (`true`).
    fn pending(&self, kind: ArtifactKind) -> Vec<(String, bool)> {
        let listing = match self.service.repository().list(kind) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(kind = %kind, error = %e, "failed to list artifacts");
                return Vec::new();
            }
        };

        let mut work = Vec::new();
        for name in &listing.packed {
            if self.service.is_updated_zombie(kind, name) {
                work.push((name.clone(), self.service.has_record(kind, name)));
            }
        }
        for name in &listing.exploded {
            if listing.packed.contains(name) {
                continue;
            }
            match self.service.find(kind, name) {
                None => {
                    if self.service.is_updated_zombie(kind, name) {
                        work.push((name.clone(), false));
                    }
                }
                Some(s) if s.state == ArtifactState::Deployed => {
                    if s.redeployment_enabled && s.timestamps.is_modified() {
                        work.push((name.clone(), true));
                    }
                }
                Some(s) if s.state.is_zombie() => {
                    if self.service.is_updated_zombie(kind, name) {
                        work.push((name.clone(), true));
                    }
                }
                Some(_) => {}
            }
        }
        work
    }

    async fn run(&self, kind: ArtifactKind, work: Vec<(String, bool)>, report: &mut ScanReport) {
        match self.config.mode {
            WatcherMode::Sequential => {
                for (name, redeploy) in work {
                    let result = apply(&self.service, kind, &name, redeploy).await;
                    report.record(name, redeploy, &result);
                }
            }
            WatcherMode::Parallel => {
                let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
                let mut tasks = JoinSet::new();
                for (name, redeploy) in work {
                    let service = Arc::clone(&self.service);
                    let permits = Arc::clone(&permits);
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        let result = apply(&service, kind, &name, redeploy).await;
                        (name, redeploy, result)
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((name, redeploy, result)) => report.record(name, redeploy, &result),
                        Err(e) => warn!(kind = %kind, error = %e, "deployment task failed"),
                    }
                }
            }
        }
    }
}

async fn apply(
    service: &DeploymentService,
    kind: ArtifactKind,
    name: &str,
    redeploy: bool,
) -> DeployResult<()> {
    if redeploy {
        service.redeploy(kind, name).await
    } else {
        service.deploy(kind, name).await
    }
}
