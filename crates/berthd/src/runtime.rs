//! Runtime builder used by the daemon.
//!
//! The daemon has no execution engine of its own: every artifact gets a
//! runtime that only logs its lifecycle steps. Policy artifacts expose a
//! factory whose policies log each invocation and pass it on.

use std::sync::Arc;

use async_trait::async_trait;
use berth_core::{
    ArtifactRuntime, BuildRequest, InvocationParams, InvocationResult, Next, Policy,
    PolicyFactory, PolicyParametrization, RuntimeBuilder, RuntimeError,
};
use berth_repo::{ArtifactKind, Coordinate};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRuntimeBuilder;

impl RuntimeBuilder for LoggingRuntimeBuilder {
    fn build(&self, request: BuildRequest<'_>) -> Result<Box<dyn ArtifactRuntime>, RuntimeError> {
        debug!(
            artifact = %request.artifact,
            location = %request.location.display(),
            domain = request.domain.map(|d| d.artifact.as_str()),
            "building runtime"
        );
        Ok(Box::new(LoggingRuntime {
            artifact: request.artifact.to_string(),
            kind: request.descriptor.kind,
            coordinate: request.descriptor.coordinate.clone(),
        }))
    }
}

struct LoggingRuntime {
    artifact: String,
    kind: ArtifactKind,
    coordinate: Coordinate,
}

impl LoggingRuntime {
    fn log(&self, phase: &str) {
        info!(
            artifact = %self.artifact,
            kind = %self.kind,
            coordinate = %self.coordinate,
            phase,
            "runtime step"
        );
    }
}

#[async_trait]
impl ArtifactRuntime for LoggingRuntime {
    async fn init(&mut self) -> Result<(), RuntimeError> {
        self.log("init");
        Ok(())
    }

    async fn start(&mut self) -> Result<(), RuntimeError> {
        self.log("start");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), RuntimeError> {
        self.log("stop");
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), RuntimeError> {
        self.log("dispose");
        Ok(())
    }

    fn policy_factory(&self) -> Option<Arc<dyn PolicyFactory>> {
        (self.kind == ArtifactKind::Policy).then(|| {
            Arc::new(LoggingPolicyFactory {
                template: self.artifact.clone(),
            }) as Arc<dyn PolicyFactory>
        })
    }
}

struct LoggingPolicyFactory {
    template: String,
}

impl PolicyFactory for LoggingPolicyFactory {
    fn create(&self, parametrization: &PolicyParametrization) -> anyhow::Result<Arc<dyn Policy>> {
        Ok(Arc::new(LoggingPolicy {
            template: self.template.clone(),
            attachment: parametrization.id.clone(),
        }))
    }
}

struct LoggingPolicy {
    template: String,
    attachment: String,
}

#[async_trait]
impl Policy for LoggingPolicy {
    async fn apply(&self, params: InvocationParams, next: Next<'_>) -> InvocationResult {
        debug!(
            template = %self.template,
            attachment = %self.attachment,
            operation = %params.operation,
            "policy applied"
        );
        next.run(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{
        ContextRegistry, ContextSpec, ExecutionContext, PolicyManager, PolicyTemplate,
        WrappedOperation,
    };
    use berth_repo::ArtifactDescriptor;
    use serde_json::{json, Value};

    fn coordinate() -> Coordinate {
        Coordinate::new("org.acme", "audit", "1.0.0".parse().expect("version"))
    }

    fn build(kind: ArtifactKind) -> Box<dyn ArtifactRuntime> {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ContextRegistry::new();
        let context = ExecutionContext::create(
            &registry,
            ContextSpec {
                artifact: "audit".into(),
                kind,
                exported: Vec::new(),
                internal: Vec::new(),
                parent: None,
                native_libraries: Vec::new(),
                native_root: dir.path().join("native"),
            },
        )
        .expect("context");
        let descriptor = ArtifactDescriptor::new(coordinate(), kind);
        LoggingRuntimeBuilder
            .build(BuildRequest {
                artifact: "audit",
                descriptor: &descriptor,
                location: dir.path(),
                domain: None,
                context: context.handle(),
            })
            .expect("build")
    }

    struct Echo;

    #[async_trait]
    impl WrappedOperation for Echo {
        async fn call(&self, params: InvocationParams) -> InvocationResult {
            Ok(Value::String(params.operation))
        }
    }

    #[tokio::test]
    async fn test_runtime_steps_succeed() {
        let mut runtime = build(ArtifactKind::Application);
        runtime.init().await.expect("init");
        runtime.start().await.expect("start");
        runtime.stop().await.expect("stop");
        runtime.dispose().await.expect("dispose");
        assert!(runtime.policy_factory().is_none());
    }

    #[tokio::test]
    async fn test_policy_artifact_policies_pass_through() {
        let runtime = build(ArtifactKind::Policy);
        let factory = runtime.policy_factory().expect("policy factory");

        let manager = PolicyManager::new();
        manager.register_template(PolicyTemplate::new("audit", coordinate(), Vec::new(), factory));
        manager.activate_application("shop", Vec::new());
        manager
            .add_policy("shop", "audit", PolicyParametrization::new("a"))
            .expect("attach");

        let result = manager
            .invoke("shop", InvocationParams::new("checkout"), &Echo)
            .await
            .expect("invoke");
        assert_eq!(result, json!("checkout"));
    }
}
