//! Deployment orchestrator.
//!
//! `DeploymentService` owns the catalog of deployment records and runs every
//! deploy, redeploy and undeploy. Operations on one deployment name are
//! serialized by a per-slot lock. A domain's slot is always taken before the
//! slots of the applications bound to it, never the other way round.
//!
//! A domain being undeployed leaves DEPLOYED before its applications are
//! listed, so no application can bind to it while the cascade runs.
//!
//! The catalog lock is never held across an `.await`: live runtimes and
//! contexts are moved out of their record before they are stopped.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use berth_repo::{
    ArtifactDescriptor, ArtifactKind, ArtifactRepository, DescriptorParser, DomainRef,
    JsonDescriptorParser, ResourceTimestamps,
};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn, Instrument};

use crate::cleanup::{CleanupScheduler, DirectoryCleanup, RetryPolicy};
use crate::config::BerthConfig;
use crate::lifecycle::{
    ArtifactRuntime, ArtifactSnapshot, ArtifactState, BoundDomain, BuildRequest, DeployError,
    DeployResult, DeploymentRecord, RuntimeBuilder, RuntimeError, RuntimePhase, SlotKey,
    ZombieRegistry, ZombieSnapshot,
};
use crate::metrics::Metrics;
use crate::obs;
use crate::observer::{CompositeListener, DeploymentListener};
use crate::policy::{
    AttachmentInfo, InvocationParams, InvocationResult, PolicyManager, PolicyParametrization,
    PolicyResult, PolicyTemplate, WrappedOperation,
};
use crate::region::{ContextProbe, ContextRegistry, ContextSpec, ExecutionContext};
use crate::resolver::{resolve_domain, DomainCandidate, ResolutionError};

type CatalogKey = (ArtifactKind, String);

/// What an undeploy does to the artifact's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UndeployMode {
    /// Explicit undeploy or anchor removal: delete files and data folder.
    Uninstall,
    /// First half of a redeploy, a cascade, or shutdown: touch nothing.
    Retain,
}

/// Composes repository, resolver, contexts, lifecycle and policies.
pub struct DeploymentService {
    config: BerthConfig,
    repository: ArtifactRepository,
    parser: Arc<dyn DescriptorParser>,
    builder: Arc<dyn RuntimeBuilder>,
    listeners: CompositeListener,
    registry: ContextRegistry,
    cleanup: CleanupScheduler,
    metrics: Arc<Metrics>,
    policies: PolicyManager,
    zombies: ZombieRegistry,
    catalog: RwLock<BTreeMap<CatalogKey, DeploymentRecord>>,
    slots: DashMap<SlotKey, Arc<Mutex<()>>>,
    admin: Arc<Mutex<()>>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for DeploymentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentService")
            .field("repository", &self.repository)
            .field("records", &self.read_catalog().len())
            .field("zombies", &self.zombies.len())
            .finish()
    }
}

impl DeploymentService {
    pub fn new(config: BerthConfig, builder: Arc<dyn RuntimeBuilder>) -> Self {
        let repository = ArtifactRepository::new(
            &config.repository.domains_dir,
            &config.repository.policies_dir,
            &config.repository.apps_dir,
        );
        let metrics = Arc::new(Metrics::new());
        let cleanup = CleanupScheduler::new(RetryPolicy::from(&config.cleanup), metrics.clone());
        Self {
            config,
            repository,
            parser: Arc::new(JsonDescriptorParser),
            builder,
            listeners: CompositeListener::new(),
            registry: ContextRegistry::new(),
            cleanup,
            metrics,
            policies: PolicyManager::new(),
            zombies: ZombieRegistry::new(),
            catalog: RwLock::new(BTreeMap::new()),
            slots: DashMap::new(),
            admin: Arc::new(Mutex::new(())),
            sequence: AtomicU64::new(1),
        }
    }

    /// Replace the default `artifact.json` parser.
    pub fn with_parser(mut self, parser: Arc<dyn DescriptorParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn add_listener(&self, listener: Arc<dyn DeploymentListener>) {
        self.listeners.add(listener);
    }

    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    pub fn repository(&self) -> &ArtifactRepository {
        &self.repository
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn policy_manager(&self) -> &PolicyManager {
        &self.policies
    }

    // ---- administrative lock ----

    /// Wait for the administrative lock. While it is held the watcher skips
    /// its scans; explicit service calls are not affected.
    pub async fn lock_admin(&self) -> OwnedMutexGuard<()> {
        self.admin.clone().lock_owned().await
    }

    pub fn try_lock_admin(&self) -> Option<OwnedMutexGuard<()>> {
        self.admin.clone().try_lock_owned().ok()
    }

    // ---- lifecycle ----

    /// Deploy `name`, or redeploy it if a record already exists.
    ///
    /// A packed archive is installed first. When a domain is redeployed its
    /// applications are undeployed before it and deployed again after it.
    pub async fn deploy(&self, kind: ArtifactKind, name: &str) -> DeployResult<()> {
        let (result, dependents) = self.deploy_one(kind, name).await;
        for application in dependents {
            let _ = self.deploy_one(ArtifactKind::Application, &application).await;
        }
        result
    }

    /// Explicit redeploy of a known artifact, bypassing the watcher.
    pub async fn redeploy(&self, kind: ArtifactKind, name: &str) -> DeployResult<()> {
        // A concurrent redeploy swaps the record under the slot lock.
        let known = {
            let _guard = self.lock_artifact(kind, name).await;
            self.has_record(kind, name)
        };
        if !known {
            return Err(Arc::new(DeployError::NotDeployed {
                kind,
                artifact: name.to_string(),
            }));
        }
        self.metrics.inc_redeployments();
        self.deploy(kind, name).await
    }

    /// Undeploy and uninstall `name`. A domain takes its applications down
    /// first.
    pub async fn undeploy(&self, kind: ArtifactKind, name: &str) -> DeployResult<()> {
        let span = obs::artifact_span("undeploy", kind, name);
        async {
            let _guard = self.lock_artifact(kind, name).await;
            let (result, _) = self.undeploy_locked(kind, name, UndeployMode::Uninstall).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Undeploy and uninstall `name` if its directory or anchor is gone,
    /// checked again once the artifact's lock is held. `None` when the
    /// artifact is not deployed or its files are in place.
    pub async fn undeploy_if_removed(
        &self,
        kind: ArtifactKind,
        name: &str,
    ) -> Option<DeployResult<()>> {
        let span = obs::artifact_span("undeploy", kind, name);
        async {
            let _guard = self.lock_artifact(kind, name).await;
            if self.state(kind, name) != Some(ArtifactState::Deployed)
                || (self.repository.exists(kind, name) && self.repository.has_anchor(kind, name))
            {
                return None;
            }
            let (result, _) = self.undeploy_locked(kind, name, UndeployMode::Uninstall).await;
            Some(result)
        }
        .instrument(span)
        .await
    }

    /// Stop every artifact without uninstalling: applications, then policies,
    /// then domains, each newest first.
    pub async fn shutdown(&self) {
        for kind in [
            ArtifactKind::Application,
            ArtifactKind::Policy,
            ArtifactKind::Domain,
        ] {
            let mut names: Vec<(u64, String)> = self
                .read_catalog()
                .iter()
                .filter(|((k, _), r)| *k == kind && r.state() == ArtifactState::Deployed)
                .map(|((_, n), r)| (r.sequence(), n.clone()))
                .collect();
            names.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, name) in names {
                let _guard = self.lock_artifact(kind, &name).await;
                if let Err(e) = self.undeploy_record(kind, &name, UndeployMode::Retain).await {
                    warn!(
                        artifact = %name,
                        kind = %kind,
                        error = %e,
                        "failed to stop artifact during shutdown"
                    );
                }
            }
        }
        self.metrics.flush();
        info!("deployment service stopped");
    }

    // ---- policies ----

    pub fn add_policy(
        &self,
        application: &str,
        template: &str,
        parametrization: PolicyParametrization,
    ) -> PolicyResult<()> {
        self.policies.add_policy(application, template, parametrization)
    }

    pub fn remove_policy(&self, application: &str, attachment: &str) -> PolicyResult<()> {
        self.policies.remove_policy(application, attachment)
    }

    pub fn attachments(&self, application: &str) -> Vec<AttachmentInfo> {
        self.policies.attachments(application)
    }

    /// Invoke an operation of `application` through its policy chain.
    pub async fn invoke(
        &self,
        application: &str,
        params: InvocationParams,
        operation: &dyn WrappedOperation,
    ) -> InvocationResult {
        self.policies.invoke(application, params, operation).await
    }

    // ---- queries ----

    pub fn find(&self, kind: ArtifactKind, name: &str) -> Option<ArtifactSnapshot> {
        self.read_catalog()
            .get(&(kind, name.to_string()))
            .map(DeploymentRecord::snapshot)
    }

    pub fn state(&self, kind: ArtifactKind, name: &str) -> Option<ArtifactState> {
        self.read_catalog()
            .get(&(kind, name.to_string()))
            .map(DeploymentRecord::state)
    }

    /// Every record of `kind`, whatever its state.
    pub fn artifacts(&self, kind: ArtifactKind) -> Vec<ArtifactSnapshot> {
        self.read_catalog()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, r)| r.snapshot())
            .collect()
    }

    pub fn deployed(&self, kind: ArtifactKind) -> Vec<ArtifactSnapshot> {
        self.read_catalog()
            .iter()
            .filter(|((k, _), r)| *k == kind && r.state() == ArtifactState::Deployed)
            .map(|(_, r)| r.snapshot())
            .collect()
    }

    pub fn domains(&self) -> Vec<ArtifactSnapshot> {
        self.deployed(ArtifactKind::Domain)
    }

    pub fn applications(&self) -> Vec<ArtifactSnapshot> {
        self.deployed(ArtifactKind::Application)
    }

    pub fn policies(&self) -> Vec<ArtifactSnapshot> {
        self.deployed(ArtifactKind::Policy)
    }

    pub fn zombies(&self) -> Vec<ZombieSnapshot> {
        self.zombies.snapshot()
    }

    /// True unless `name` is a zombie whose files have not changed.
    pub fn is_updated_zombie(&self, kind: ArtifactKind, name: &str) -> bool {
        self.zombies.is_updated(kind, name)
    }

    /// Weak observation of the context of a deployed artifact.
    pub fn probe(&self, kind: ArtifactKind, name: &str) -> Option<ContextProbe> {
        self.read_catalog()
            .get(&(kind, name.to_string()))
            .and_then(|r| r.probe().cloned())
    }

    pub(crate) fn forget_missing_zombies(&self) -> Vec<(ArtifactKind, String)> {
        let gone = self.zombies.prune_missing();
        if !gone.is_empty() {
            let mut catalog = self.write_catalog();
            for key in &gone {
                if catalog.get(key).is_some_and(|r| r.state() == ArtifactState::Failed) {
                    catalog.remove(key);
                }
            }
        }
        gone
    }

    // ---- internals ----

    fn read_catalog(&self) -> RwLockReadGuard<'_, BTreeMap<CatalogKey, DeploymentRecord>> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_catalog(&self) -> RwLockWriteGuard<'_, BTreeMap<CatalogKey, DeploymentRecord>> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn has_record(&self, kind: ArtifactKind, name: &str) -> bool {
        self.read_catalog().contains_key(&(kind, name.to_string()))
    }

    fn with_record<R>(
        &self,
        kind: ArtifactKind,
        name: &str,
        f: impl FnOnce(&mut DeploymentRecord) -> R,
    ) -> Option<R> {
        self.write_catalog().get_mut(&(kind, name.to_string())).map(f)
    }

    fn transition(
        &self,
        kind: ArtifactKind,
        name: &str,
        next: ArtifactState,
    ) -> Result<(), DeployError> {
        self.with_record(kind, name, |r| r.transition(next))
            .unwrap_or_else(|| {
                Err(DeployError::NotDeployed {
                    kind,
                    artifact: name.to_string(),
                })
            })
    }

    async fn lock_artifact(&self, kind: ArtifactKind, name: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.slots.entry(SlotKey::new(kind, name)).or_default());
        lock.lock_owned().await
    }

    /// Install a packed archive if there is one, then parse the descriptor.
    fn prepare(
        &self,
        kind: ArtifactKind,
        name: &str,
    ) -> Result<Arc<ArtifactDescriptor>, (DeployError, ResourceTimestamps)> {
        let archive = self.repository.archive_path(kind, name);
        if archive.is_file() {
            if let Err(e) = self.repository.install(kind, name) {
                return Err((e.into(), ResourceTimestamps::capture([archive])));
            }
        }

        let location = self.repository.artifact_dir(kind, name);
        let descriptor_path = self.repository.descriptor_path(kind, name);
        let descriptor = self
            .parser
            .parse(&location)
            .map_err(|e| (e.into(), ResourceTimestamps::capture([descriptor_path.clone()])))?;
        if descriptor.kind != kind {
            return Err((
                DeployError::KindMismatch {
                    artifact: name.to_string(),
                    expected: kind,
                    found: descriptor.kind,
                },
                ResourceTimestamps::capture([descriptor_path]),
            ));
        }
        Ok(Arc::new(descriptor))
    }

    /// Deploy or redeploy one artifact. Returns the applications to deploy
    /// again afterwards (those of a redeployed domain).
    async fn deploy_one(&self, kind: ArtifactKind, name: &str) -> (DeployResult<()>, Vec<String>) {
        let span = obs::artifact_span("deploy", kind, name);
        self.deploy_one_inner(kind, name).instrument(span).await
    }

    async fn deploy_one_inner(
        &self,
        kind: ArtifactKind,
        name: &str,
    ) -> (DeployResult<()>, Vec<String>) {
        let descriptor = match self.prepare(kind, name) {
            Ok(descriptor) => descriptor,
            Err((error, timestamps)) => {
                let _guard = self.lock_artifact(kind, name).await;
                let mut dependents = Vec::new();
                if self.has_record(kind, name) {
                    let (_, cascaded) = self.undeploy_locked(kind, name, UndeployMode::Retain).await;
                    dependents = cascaded;
                }
                self.listeners.on_deployment_start(kind, name);
                obs::emit_deploy_started(kind, name);
                let cause = self.register_failure(kind, name, error, timestamps);
                obs::emit_deploy_finished(kind, name, 0, false);
                return (Err(cause), dependents);
            }
        };

        let guard = self.lock_artifact(kind, name).await;

        let mut dependents = Vec::new();
        match self.state(kind, name) {
            // a zombie keeps its record and re-enters resolution
            None | Some(ArtifactState::Failed) => {}
            Some(_) => {
                let (_, cascaded) = self.undeploy_locked(kind, name, UndeployMode::Retain).await;
                dependents.extend(cascaded);
            }
        }

        let result = self.deploy_locked(kind, name, descriptor).await;
        if kind == ArtifactKind::Domain && result.is_ok() {
            dependents.extend(self.waiting_on_domain(name));
        }
        drop(guard);

        dependents.sort();
        dependents.dedup();
        (result, dependents)
    }

    /// Failed applications whose domain failed as `domain`.
    fn waiting_on_domain(&self, domain: &str) -> Vec<String> {
        self.read_catalog()
            .iter()
            .filter(|((k, _), r)| *k == ArtifactKind::Application && r.state().is_zombie())
            .filter(|(_, r)| {
                matches!(
                    r.cause().map(|c| &**c),
                    Some(DeployError::DomainFailed { domain: d, .. }) if d == domain
                )
            })
            .map(|((_, n), _)| n.clone())
            .collect()
    }

    async fn deploy_locked(
        &self,
        kind: ArtifactKind,
        name: &str,
        descriptor: Arc<ArtifactDescriptor>,
    ) -> DeployResult<()> {
        let started = Instant::now();
        let location = self.repository.artifact_dir(kind, name);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamps = {
            let mut catalog = self.write_catalog();
            let key = (kind, name.to_string());
            match catalog.get_mut(&key) {
                Some(zombie) if zombie.state().is_zombie() => {
                    zombie.retry(descriptor.clone(), &location, sequence);
                    zombie.timestamps().clone()
                }
                _ => {
                    let record = DeploymentRecord::new(name, descriptor.clone(), &location, sequence);
                    let timestamps = record.timestamps().clone();
                    catalog.insert(key, record);
                    timestamps
                }
            }
        };

        self.listeners.on_deployment_start(kind, name);
        obs::emit_deploy_started(kind, name);

        let outcome = self.bring_up(kind, name, &descriptor, &location).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        obs::emit_deploy_finished(kind, name, elapsed, outcome.is_ok());

        match outcome {
            Ok(()) => {
                self.zombies.remove(kind, name);
                if let Err(e) = self.repository.write_anchor(kind, name) {
                    warn!(artifact = %name, error = %e, "failed to write anchor");
                }
                self.metrics.inc_deployments();
                self.listeners.on_deployment_success(kind, name);
                Ok(())
            }
            Err(error) => Err(self.register_failure(kind, name, error, timestamps)),
        }
    }

    /// RESOLVING -> DEPLOYING -> DEPLOYED. On error everything created here
    /// has been torn down again.
    async fn bring_up(
        &self,
        kind: ArtifactKind,
        name: &str,
        descriptor: &Arc<ArtifactDescriptor>,
        location: &Path,
    ) -> Result<(), DeployError> {
        self.transition(kind, name, ArtifactState::Resolving)?;
        if let Some(required) = &descriptor.min_runtime_version {
            let actual = &self.config.lifecycle.runtime_version;
            if required > actual {
                return Err(DeployError::RuntimeVersion {
                    artifact: name.to_string(),
                    required: required.clone(),
                    actual: actual.clone(),
                });
            }
        }
        let domain = match (kind, &descriptor.domain) {
            (ArtifactKind::Application, Some(reference)) => Some(self.bind_domain(name, reference)?),
            _ => None,
        };
        self.transition(kind, name, ArtifactState::Deploying)?;

        let spec = ContextSpec {
            artifact: name.to_string(),
            kind,
            exported: descriptor.exported_resources.clone(),
            internal: descriptor.internal_resources.clone(),
            parent: domain.as_ref().map(|d| d.context.clone()),
            native_libraries: descriptor
                .native_libraries
                .iter()
                .map(|p| location.join(p))
                .collect(),
            native_root: self.config.repository.native_dir(name),
        };
        let context = ExecutionContext::create(&self.registry, spec).map_err(|source| {
            DeployError::Context {
                artifact: name.to_string(),
                source,
            }
        })?;
        self.listeners.on_artifact_created(kind, name, &context.handle());

        let runtime = match self
            .start_runtime(kind, name, descriptor, location, domain.as_ref(), &context)
            .await
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.release_context(context).await;
                return Err(e);
            }
        };

        if let Err(e) = self.publish(kind, name, descriptor, runtime.as_ref()) {
            self.abandon(name, runtime, true).await;
            self.release_context(context).await;
            return Err(e);
        }

        match self.with_record(kind, name, move |r| r.mark_deployed(runtime, context)) {
            Some(result) => result,
            None => Err(DeployError::NotDeployed {
                kind,
                artifact: name.to_string(),
            }),
        }
    }

    async fn start_runtime(
        &self,
        kind: ArtifactKind,
        name: &str,
        descriptor: &ArtifactDescriptor,
        location: &Path,
        domain: Option<&BoundDomain>,
        context: &ExecutionContext,
    ) -> Result<Box<dyn ArtifactRuntime>, DeployError> {
        let handle = context.handle();
        let request = BuildRequest {
            artifact: name,
            descriptor,
            location,
            domain,
            context: handle.clone(),
        };
        let mut runtime = self
            .builder
            .build(request)
            .map_err(|source| DeployError::Runtime {
                artifact: name.to_string(),
                phase: RuntimePhase::Build,
                source,
            })?;
        self.listeners.on_artifact_configured(kind, name, &handle);

        if let Err(e) = self.step(name, RuntimePhase::Init, runtime.init()).await {
            self.abandon(name, runtime, false).await;
            return Err(e);
        }
        self.listeners.on_artifact_initialised(kind, name, &handle);

        if let Err(e) = self.step(name, RuntimePhase::Start, runtime.start()).await {
            self.abandon(name, runtime, true).await;
            return Err(e);
        }
        Ok(runtime)
    }

    /// Make a started artifact visible to the policy manager.
    fn publish(
        &self,
        kind: ArtifactKind,
        name: &str,
        descriptor: &ArtifactDescriptor,
        runtime: &dyn ArtifactRuntime,
    ) -> Result<(), DeployError> {
        let detached = match kind {
            ArtifactKind::Domain => Vec::new(),
            ArtifactKind::Policy => {
                let factory =
                    runtime
                        .policy_factory()
                        .ok_or_else(|| DeployError::MissingPolicyFactory {
                            artifact: name.to_string(),
                        })?;
                self.policies
                    .register_template(PolicyTemplate::from_descriptor(name, descriptor, factory))
            }
            ArtifactKind::Application => self
                .policies
                .activate_application(name, descriptor.plugins.clone()),
        };
        if !detached.is_empty() {
            info!(artifact = %name, detached = detached.len(), "policies detached after deployment");
        }
        Ok(())
    }

    fn bind_domain(&self, name: &str, reference: &DomainRef) -> Result<BoundDomain, DeployError> {
        let mut catalog = self.write_catalog();
        let deployed: Vec<DomainCandidate> = catalog
            .iter()
            .filter(|((k, _), r)| *k == ArtifactKind::Domain && r.state() == ArtifactState::Deployed)
            .map(|((_, n), r)| DomainCandidate::new(n.clone(), r.descriptor().coordinate.clone()))
            .collect();

        let chosen = match resolve_domain(reference, &deployed) {
            Ok(chosen) => chosen,
            Err(source) => return Err(self.explain_resolution(&catalog, name, reference, source)),
        };
        let context = catalog
            .get(&(ArtifactKind::Domain, chosen.artifact.clone()))
            .and_then(DeploymentRecord::context_handle)
            .ok_or_else(|| DeployError::NotDeployed {
                kind: ArtifactKind::Domain,
                artifact: chosen.artifact.clone(),
            })?;
        if let Some(record) = catalog.get_mut(&(ArtifactKind::Application, name.to_string())) {
            record.bind_domain(Some(chosen.artifact.clone()));
        }
        debug!(artifact = %name, domain = %chosen.artifact, "application bound to domain");
        Ok(BoundDomain {
            artifact: chosen.artifact,
            coordinate: chosen.coordinate,
            context,
        })
    }

    /// A reference that only a failed domain would satisfy is reported as
    /// that domain's failure.
    fn explain_resolution(
        &self,
        catalog: &BTreeMap<CatalogKey, DeploymentRecord>,
        name: &str,
        reference: &DomainRef,
        source: ResolutionError,
    ) -> DeployError {
        if !matches!(source, ResolutionError::Ambiguous { .. }) {
            let failed: Vec<DomainCandidate> = catalog
                .iter()
                .filter(|((k, _), r)| *k == ArtifactKind::Domain && r.state().is_zombie())
                .map(|((_, n), r)| DomainCandidate::new(n.clone(), r.descriptor().coordinate.clone()))
                .collect();
            let zombie = resolve_domain(reference, &failed).ok().and_then(|c| {
                let key = (ArtifactKind::Domain, c.artifact.clone());
                catalog
                    .get(&key)
                    .and_then(|r| r.cause().cloned())
                    .map(|cause| (c.artifact, cause))
            });
            let unparsed = || {
                self.zombies
                    .cause(ArtifactKind::Domain, reference.name())
                    .map(|cause| (reference.name().to_string(), cause))
            };
            if let Some((domain, cause)) = zombie.or_else(unparsed) {
                return DeployError::DomainFailed {
                    artifact: name.to_string(),
                    domain,
                    cause,
                };
            }
        }
        DeployError::Resolution {
            artifact: name.to_string(),
            source,
        }
    }

    /// Run one runtime hook bounded by the step timeout.
    async fn step<F>(&self, name: &str, phase: RuntimePhase, hook: F) -> Result<(), DeployError>
    where
        F: Future<Output = Result<(), RuntimeError>>,
    {
        let limit_ms = self.config.lifecycle.step_timeout_ms;
        match tokio::time::timeout(self.config.lifecycle.step_timeout(), hook).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(DeployError::Runtime {
                artifact: name.to_string(),
                phase,
                source,
            }),
            Err(_) => Err(DeployError::Timeout {
                artifact: name.to_string(),
                phase,
                limit_ms,
            }),
        }
    }

    /// Best-effort stop and dispose of a runtime that will not be kept.
    async fn abandon(&self, name: &str, mut runtime: Box<dyn ArtifactRuntime>, stop: bool) {
        if stop {
            if let Err(e) = self.step(name, RuntimePhase::Stop, runtime.stop()).await {
                debug!(artifact = %name, error = %e, "stop failed while abandoning runtime");
            }
        }
        if let Err(e) = self.step(name, RuntimePhase::Dispose, runtime.dispose()).await {
            debug!(artifact = %name, error = %e, "dispose failed while abandoning runtime");
        }
    }

    async fn release_context(&self, context: ExecutionContext) {
        let report = context.teardown().await;
        if let Some(dir) = report.native_dir {
            self.cleanup.schedule(DirectoryCleanup::new(dir));
        }
        debug!(
            context = %report.context,
            artifact = %report.artifact,
            tasks_cancelled = report.tasks_cancelled,
            resources_released = report.resources_released,
            "execution context released"
        );
    }

    /// Mark `name` failed, keep it as a zombie and tell observers.
    fn register_failure(
        &self,
        kind: ArtifactKind,
        name: &str,
        error: DeployError,
        timestamps: ResourceTimestamps,
    ) -> Arc<DeployError> {
        let cause = Arc::new(error);
        self.with_record(kind, name, |r| r.mark_failed(cause.clone()));
        if kind == ArtifactKind::Application {
            self.policies.deactivate_application(name);
        } else if kind == ArtifactKind::Policy {
            self.policies.unregister_template(name);
        }
        self.zombies.register(kind, name, timestamps, cause.clone());
        self.metrics.inc_deployment_failures();
        obs::emit_zombie_registered(kind, name, &cause);
        self.listeners.on_deployment_failure(kind, name, &cause);
        cause
    }

    /// Undeploy `name`, first taking down applications bound to it if it is
    /// a domain. The caller holds `name`'s slot. Returns the applications
    /// taken down.
    async fn undeploy_locked(
        &self,
        kind: ArtifactKind,
        name: &str,
        mode: UndeployMode,
    ) -> (DeployResult<()>, Vec<String>) {
        let was_live = match self.begin_undeploy(kind, name) {
            Ok(was_live) => was_live,
            Err(e) => return (Err(e), Vec::new()),
        };

        let mut dependents: Vec<String> = Vec::new();
        if kind == ArtifactKind::Domain {
            // The domain is UNDEPLOYING and binds nothing new; an application
            // bound just before is still deploying and is waited for.
            loop {
                let bound: Vec<String> = self
                    .bound_applications(name)
                    .into_iter()
                    .filter(|a| !dependents.contains(a))
                    .collect();
                if bound.is_empty() {
                    break;
                }
                for application in bound {
                    let _guard = self
                        .lock_artifact(ArtifactKind::Application, &application)
                        .await;
                    let still_bound = self
                        .read_catalog()
                        .get(&(ArtifactKind::Application, application.clone()))
                        .is_some_and(|r| r.domain() == Some(name) && !r.state().is_zombie());
                    if still_bound {
                        let _ = self
                            .undeploy_record(
                                ArtifactKind::Application,
                                &application,
                                UndeployMode::Retain,
                            )
                            .await;
                    }
                    dependents.push(application);
                }
            }
        }
        let result = self.finish_undeploy(kind, name, mode, was_live).await;
        (result, dependents)
    }

    /// Applications bound to `domain` that are deployed or on their way.
    fn bound_applications(&self, domain: &str) -> Vec<String> {
        self.read_catalog()
            .iter()
            .filter(|((k, _), r)| {
                *k == ArtifactKind::Application
                    && r.domain() == Some(domain)
                    && !r.state().is_zombie()
            })
            .map(|((_, n), _)| n.clone())
            .collect()
    }

    /// Move the record to UNDEPLOYING. Returns whether it was live.
    fn begin_undeploy(&self, kind: ArtifactKind, name: &str) -> DeployResult<bool> {
        let begun = self.with_record(kind, name, |r| {
            let was_live = r.state() == ArtifactState::Deployed;
            r.transition(ArtifactState::Undeploying).map(|()| was_live)
        });
        match begun {
            Some(Ok(was_live)) => Ok(was_live),
            Some(Err(e)) => Err(Arc::new(e)),
            None => Err(Arc::new(DeployError::NotDeployed {
                kind,
                artifact: name.to_string(),
            })),
        }
    }

    /// Stop, dispose and release one record. No cascading.
    async fn undeploy_record(
        &self,
        kind: ArtifactKind,
        name: &str,
        mode: UndeployMode,
    ) -> DeployResult<()> {
        let was_live = self.begin_undeploy(kind, name)?;
        self.finish_undeploy(kind, name, mode, was_live).await
    }

    /// Second half of an undeploy; the record is already UNDEPLOYING.
    async fn finish_undeploy(
        &self,
        kind: ArtifactKind,
        name: &str,
        mode: UndeployMode,
        was_live: bool,
    ) -> DeployResult<()> {
        let (runtime, context) = self
            .with_record(kind, name, DeploymentRecord::take_live)
            .unwrap_or((None, None));

        if was_live {
            self.listeners.on_undeployment_start(kind, name);
        }
        match (kind, mode) {
            (ArtifactKind::Application, UndeployMode::Retain) => {
                self.policies.deactivate_application(name)
            }
            (ArtifactKind::Application, UndeployMode::Uninstall) => {
                self.policies.forget_application(name);
            }
            (ArtifactKind::Policy, UndeployMode::Retain) => {}
            (ArtifactKind::Policy, UndeployMode::Uninstall) => {
                for detached in self.policies.unregister_template(name) {
                    info!(
                        application = %detached.application,
                        attachment = %detached.attachment,
                        template = %name,
                        "policy detached, template undeployed"
                    );
                }
            }
            (ArtifactKind::Domain, _) => {}
        }

        let mut failure = None;
        if let Some(mut runtime) = runtime {
            if let Err(e) = self.step(name, RuntimePhase::Stop, runtime.stop()).await {
                failure = Some(e);
            }
            if let Err(e) = self.step(name, RuntimePhase::Dispose, runtime.dispose()).await {
                failure = failure.or(Some(e));
            }
        }
        if let Some(context) = context {
            self.release_context(context).await;
        }

        if let Err(e) = self.repository.remove_anchor(kind, name) {
            warn!(artifact = %name, error = %e, "failed to remove anchor");
        }
        if mode == UndeployMode::Uninstall {
            if let Err(e) = self.repository.uninstall(kind, name) {
                warn!(artifact = %name, error = %e, "failed to uninstall artifact");
            }
            self.cleanup
                .schedule(DirectoryCleanup::new(self.config.repository.data_dir(name)));
        }

        match failure {
            None => {
                self.retire_record(kind, name);
                if mode == UndeployMode::Uninstall {
                    self.zombies.remove(kind, name);
                }
                if was_live {
                    self.metrics.inc_undeployments();
                    obs::emit_undeployed(kind, name, mode == UndeployMode::Uninstall);
                    self.listeners.on_undeployment_success(kind, name);
                }
                Ok(())
            }
            Some(error) => {
                let cause = Arc::new(error);
                warn!(artifact = %name, kind = %kind, error = %cause, "undeployment failed");
                if mode == UndeployMode::Uninstall {
                    self.retire_record(kind, name);
                } else {
                    let timestamps = self
                        .with_record(kind, name, |r| {
                            r.mark_failed(cause.clone());
                            r.timestamps().clone()
                        })
                        .unwrap_or_default();
                    self.zombies.register(kind, name, timestamps, cause.clone());
                    obs::emit_zombie_registered(kind, name, &cause);
                }
                self.listeners.on_undeployment_failure(kind, name, &cause);
                Err(cause)
            }
        }
    }

    /// UNDEPLOYING -> REMOVED, dropping the record from the catalog.
    fn retire_record(&self, kind: ArtifactKind, name: &str) {
        let removed = self.write_catalog().remove(&(kind, name.to_string()));
        if let Some(mut record) = removed {
            match record.transition(ArtifactState::Removed) {
                Ok(()) => debug!(kind = %kind, artifact = %name, "record removed"),
                Err(e) => warn!(artifact = %name, error = %e, "record removed out of order"),
            }
        }
    }

    /// Location of the persistent data folder of `name`.
    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.config.repository.data_dir(name)
    }
}
