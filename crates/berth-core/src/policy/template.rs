//! Policy templates and attachment parametrizations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use berth_repo::{ArtifactDescriptor, Coordinate, PluginDependency};
use serde_json::Value;

use super::chain::{Pointcut, Policy, PolicyNotificationListener};
use super::error::{PolicyRegistrationError, PolicyResult};

/// Creates policy instances for a template. Provided by a policy artifact's
/// runtime.
pub trait PolicyFactory: Send + Sync {
    fn create(&self, parametrization: &PolicyParametrization) -> anyhow::Result<Arc<dyn Policy>>;
}

/// How one attachment of a template is configured.
#[derive(Clone, Default)]
pub struct PolicyParametrization {
    /// Attachment id, unique per application
    pub id: String,
    pub order: i32,
    pub pointcut: Pointcut,
    pub parameters: BTreeMap<String, Value>,
    pub config_source: Option<PathBuf>,
    pub listeners: Vec<Arc<dyn PolicyNotificationListener>>,
}

impl std::fmt::Debug for PolicyParametrization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyParametrization")
            .field("id", &self.id)
            .field("order", &self.order)
            .field("pointcut", &self.pointcut)
            .field("parameters", &self.parameters)
            .field("config_source", &self.config_source)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl PolicyParametrization {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn pointcut(mut self, pointcut: Pointcut) -> Self {
        self.pointcut = pointcut;
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn config_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_source = Some(path.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn PolicyNotificationListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

/// A deployed policy artifact, ready to be attached to applications.
#[derive(Clone)]
pub struct PolicyTemplate {
    name: String,
    coordinate: Coordinate,
    required_plugins: Vec<PluginDependency>,
    factory: Arc<dyn PolicyFactory>,
}

impl std::fmt::Debug for PolicyTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyTemplate")
            .field("name", &self.name)
            .field("coordinate", &self.coordinate)
            .field("required_plugins", &self.required_plugins)
            .finish()
    }
}

impl PolicyTemplate {
    pub fn new(
        name: impl Into<String>,
        coordinate: Coordinate,
        required_plugins: Vec<PluginDependency>,
        factory: Arc<dyn PolicyFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            coordinate,
            required_plugins,
            factory,
        }
    }

    /// Template registered by the policy artifact deployed as `name`.
    pub fn from_descriptor(
        name: impl Into<String>,
        descriptor: &ArtifactDescriptor,
        factory: Arc<dyn PolicyFactory>,
    ) -> Self {
        Self::new(
            name,
            descriptor.coordinate.clone(),
            descriptor.required_plugins.clone(),
            factory,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinate(&self) -> &Coordinate {
        &self.coordinate
    }

    pub fn required_plugins(&self) -> &[PluginDependency] {
        &self.required_plugins
    }

    /// Every required plugin the application also bundles must share
    /// major.minor with it. Plugins the application lacks are not checked.
    pub fn check_compatible(
        &self,
        application: &str,
        plugins: &[PluginDependency],
    ) -> PolicyResult<()> {
        for required in &self.required_plugins {
            let clash = plugins
                .iter()
                .find(|p| p.name == required.name && !required.is_compatible_with(p));
            if let Some(found) = clash {
                return Err(PolicyRegistrationError::IncompatiblePlugin {
                    template: self.name.clone(),
                    application: application.to_string(),
                    plugin: required.name.clone(),
                    required: required.version.clone(),
                    found: found.version.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn instantiate(
        &self,
        parametrization: &PolicyParametrization,
    ) -> PolicyResult<Arc<dyn Policy>> {
        self.factory
            .create(parametrization)
            .map_err(|e| PolicyRegistrationError::Instantiation {
                template: self.name.clone(),
                attachment: parametrization.id.clone(),
                reason: format!("{e:#}"),
            })
    }
}
