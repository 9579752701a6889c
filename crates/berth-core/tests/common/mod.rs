//! Shared fixtures: a scripted runtime builder, recording policies and
//! helpers that lay artifacts out on disk.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{
    ArtifactRuntime, BerthConfig, BuildRequest, ContextHandle, DeploymentService, EventLog,
    InvocationParams, InvocationResult, Next, Policy, PolicyFactory, PolicyParametrization,
    RuntimeBuilder, RuntimeError, RuntimePhase, WrappedOperation,
};
use berth_repo::{ArtifactKind, ArtifactRepository, DESCRIPTOR_FILE};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;

pub type Trace = Arc<Mutex<Vec<String>>>;

// -------------------------------------------------------------------------
// Scripted runtimes
// -------------------------------------------------------------------------

/// How the runtimes built for one artifact behave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Behaviour {
    #[default]
    Normal,
    FailInit,
    FailStart,
    HangStart,
    /// Start completes after the delay.
    SlowStart(Duration),
    FailStop,
    /// Stop completes after the delay.
    SlowStop(Duration),
}

/// Counters shared by every runtime built for one artifact.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    builds: AtomicUsize,
    inits: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    disposes: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    tasks_dropped: AtomicUsize,
}

impl RuntimeStats {
    pub fn count(&self, phase: RuntimePhase) -> usize {
        let counter = match phase {
            RuntimePhase::Build => &self.builds,
            RuntimePhase::Init => &self.inits,
            RuntimePhase::Start => &self.starts,
            RuntimePhase::Stop => &self.stops,
            RuntimePhase::Dispose => &self.disposes,
        };
        counter.load(Ordering::SeqCst)
    }

    /// Runtimes started and not yet stopped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Background tasks whose future was dropped (cancelled or finished).
    pub fn tasks_dropped(&self) -> usize {
        self.tasks_dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<RuntimeStats>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.tasks_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedRuntime {
    behaviour: Behaviour,
    stats: Arc<RuntimeStats>,
    context: ContextHandle,
    factory: Option<Arc<dyn PolicyFactory>>,
    started: bool,
}

#[async_trait]
impl ArtifactRuntime for ScriptedRuntime {
    async fn init(&mut self) -> Result<(), RuntimeError> {
        self.stats.inits.fetch_add(1, Ordering::SeqCst);
        if self.behaviour == Behaviour::FailInit {
            return Err(RuntimeError::failed("init refused"));
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), RuntimeError> {
        self.stats.starts.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::FailStart => return Err(RuntimeError::failed("start refused")),
            Behaviour::HangStart => std::future::pending::<()>().await,
            Behaviour::SlowStart(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let flag = DropFlag(self.stats.clone());
        self.context
            .spawn("heartbeat", async move {
                let _flag = flag;
                std::future::pending::<()>().await;
            })
            .map_err(|e| RuntimeError::Other(e.into()))?;

        let live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(live, Ordering::SeqCst);
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RuntimeError> {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        if let Behaviour::SlowStop(delay) = self.behaviour {
            tokio::time::sleep(delay).await;
        }
        if self.started {
            self.started = false;
            self.stats.live.fetch_sub(1, Ordering::SeqCst);
        }
        if self.behaviour == Behaviour::FailStop {
            return Err(RuntimeError::failed("stop refused"));
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), RuntimeError> {
        self.stats.disposes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn policy_factory(&self) -> Option<Arc<dyn PolicyFactory>> {
        self.factory.clone()
    }
}

/// Builds `ScriptedRuntime`s. Policy artifacts get a `TraceFactory`.
#[derive(Debug, Default)]
pub struct ScriptedBuilder {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    stats: Mutex<HashMap<String, Arc<RuntimeStats>>>,
    trace: Trace,
    creations: Trace,
    gates: Gates,
}

impl ScriptedBuilder {
    pub fn set(&self, artifact: &str, behaviour: Behaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(artifact.to_string(), behaviour);
    }

    pub fn stats(&self, artifact: &str) -> Arc<RuntimeStats> {
        self.stats
            .lock()
            .unwrap()
            .entry(artifact.to_string())
            .or_default()
            .clone()
    }

    /// Shared invocation trace written by policies and `RecordingOperation`.
    pub fn trace_handle(&self) -> Trace {
        self.trace.clone()
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().unwrap().clear();
    }

    /// `template:attachment` for every policy instance created.
    pub fn creations(&self) -> Vec<String> {
        self.creations.lock().unwrap().clone()
    }

    /// Arm a gate that holds the next invocation through `attachment`
    /// right after its `before` entry, until released.
    pub fn gate(&self, attachment: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        gate.armed.store(true, Ordering::SeqCst);
        self.gates
            .lock()
            .unwrap()
            .insert(attachment.to_string(), gate.clone());
        gate
    }
}

type Gates = Arc<Mutex<HashMap<String, Arc<Gate>>>>;

/// One-shot pause point inside a policy instance.
#[derive(Debug, Default)]
pub struct Gate {
    armed: AtomicBool,
    /// Notified once an invocation is parked at the gate.
    pub entered: Notify,
    release: Notify,
}

impl Gate {
    pub fn open(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

impl RuntimeBuilder for ScriptedBuilder {
    fn build(&self, request: BuildRequest<'_>) -> Result<Box<dyn ArtifactRuntime>, RuntimeError> {
        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(request.artifact)
            .copied()
            .unwrap_or_default();
        let stats = self.stats(request.artifact);
        stats.builds.fetch_add(1, Ordering::SeqCst);

        let factory = (request.descriptor.kind == ArtifactKind::Policy).then(|| {
            Arc::new(TraceFactory {
                template: request.artifact.to_string(),
                trace: self.trace.clone(),
                creations: self.creations.clone(),
                gates: self.gates.clone(),
            }) as Arc<dyn PolicyFactory>
        });
        Ok(Box::new(ScriptedRuntime {
            behaviour,
            stats,
            context: request.context,
            factory,
            started: false,
        }))
    }
}

// -------------------------------------------------------------------------
// Recording policies
// -------------------------------------------------------------------------

struct TracePolicy {
    label: String,
    trace: Trace,
    gates: Gates,
}

#[async_trait]
impl Policy for TracePolicy {
    async fn apply(&self, params: InvocationParams, next: Next<'_>) -> InvocationResult {
        self.trace.lock().unwrap().push(format!("{}:before", self.label));
        let gate = self.gates.lock().unwrap().get(&self.label).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        let result = next.run(params).await;
        self.trace.lock().unwrap().push(format!("{}:after", self.label));
        result
    }
}

/// Creates a `TracePolicy` labelled with the attachment id. A `fail`
/// parameter makes creation fail.
struct TraceFactory {
    template: String,
    trace: Trace,
    creations: Trace,
    gates: Gates,
}

impl PolicyFactory for TraceFactory {
    fn create(&self, parametrization: &PolicyParametrization) -> anyhow::Result<Arc<dyn Policy>> {
        if parametrization.parameters.contains_key("fail") {
            anyhow::bail!("refusing to create {}", parametrization.id);
        }
        self.creations
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.template, parametrization.id));
        Ok(Arc::new(TracePolicy {
            label: parametrization.id.clone(),
            trace: self.trace.clone(),
            gates: self.gates.clone(),
        }))
    }
}

/// The wrapped application operation: records `op` and echoes its name.
pub struct RecordingOperation(pub Trace);

#[async_trait]
impl WrappedOperation for RecordingOperation {
    async fn call(&self, params: InvocationParams) -> InvocationResult {
        self.0.lock().unwrap().push("op".to_string());
        Ok(Value::String(params.operation))
    }
}

// -------------------------------------------------------------------------
// Descriptors
// -------------------------------------------------------------------------

pub fn descriptor(kind: &str, name: &str, version: &str) -> Value {
    json!({
        "group": "org.acme",
        "name": name,
        "version": version,
        "kind": kind,
    })
}

pub fn domain(name: &str, version: &str) -> Value {
    descriptor("domain", name, version)
}

pub fn policy(name: &str, version: &str) -> Value {
    descriptor("policy", name, version)
}

pub fn application(name: &str, version: &str) -> Value {
    descriptor("application", name, version)
}

/// Application bound to a domain by name, optionally within a major.minor window.
pub fn application_in(name: &str, version: &str, domain: &str, window: Option<&str>) -> Value {
    let mut app = application(name, version);
    let mut reference = json!({ "name": domain });
    if let Some(window) = window {
        reference["version"] = json!(window);
    }
    app["domain"] = json!({ "named": reference });
    app
}

/// Application bound to exactly `org.acme:<domain>:<version>`.
pub fn application_exact(name: &str, version: &str, domain: &str, domain_version: &str) -> Value {
    let mut app = application(name, version);
    app["domain"] = json!({
        "exact": { "group": "org.acme", "name": domain, "version": domain_version }
    });
    app
}

// -------------------------------------------------------------------------
// Harness
// -------------------------------------------------------------------------

pub struct Harness {
    pub home: TempDir,
    pub builder: Arc<ScriptedBuilder>,
    pub service: Arc<DeploymentService>,
    pub events: Arc<EventLog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tune: impl FnOnce(&mut BerthConfig)) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let mut config = BerthConfig::with_home(home.path());
        config.watcher.poll_interval_ms = 50;
        config.lifecycle.step_timeout_ms = 2_000;
        config.cleanup.retry_delay_ms = 20;
        tune(&mut config);

        let builder = Arc::new(ScriptedBuilder::default());
        let service = DeploymentService::new(config, builder.clone());
        service.repository().ensure_layout().expect("layout");
        let events = EventLog::new();
        service.add_listener(events.clone());

        Self {
            home,
            builder,
            service: Arc::new(service),
            events,
        }
    }

    pub fn repo(&self) -> &ArtifactRepository {
        self.service.repository()
    }

    /// Write `artifact.json` for an exploded artifact, returning its directory.
    pub fn write(&self, kind: ArtifactKind, name: &str, descriptor: &Value) -> PathBuf {
        let raw = serde_json::to_string_pretty(descriptor).expect("serialize descriptor");
        self.write_raw(kind, name, &raw)
    }

    pub fn write_raw(&self, kind: ArtifactKind, name: &str, raw: &str) -> PathBuf {
        let dir = self.repo().artifact_dir(kind, name);
        std::fs::create_dir_all(&dir).expect("create artifact dir");
        std::fs::write(dir.join(DESCRIPTOR_FILE), raw).expect("write descriptor");
        dir
    }

    /// Push the descriptor's modification time forward.
    pub fn touch(&self, kind: ArtifactKind, name: &str) {
        touch(&self.repo().descriptor_path(kind, name));
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.labels()
    }

    pub async fn deploy(&self, kind: ArtifactKind, name: &str) {
        self.service
            .deploy(kind, name)
            .await
            .unwrap_or_else(|e| panic!("deploy {name}: {e}"));
    }
}

pub fn touch(path: &Path) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for touch");
    let modified = file
        .metadata()
        .and_then(|m| m.modified())
        .expect("modification time");
    file.set_modified(modified + Duration::from_secs(2))
        .expect("set modification time");
}

/// Write a `.tar.gz` holding `files`.
pub fn pack(archive: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(archive).expect("create archive");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .expect("append entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

/// Poll `check` every 20ms until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
