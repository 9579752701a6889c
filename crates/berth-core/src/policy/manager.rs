//! Per-application policy attachments and their effective chains.
//!
//! Every mutation builds a fresh `EffectiveChain` from the current
//! attachment set and swaps it in. An invocation clones the chain `Arc`
//! once, up front, and runs to completion on it whatever happens after.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use berth_repo::PluginDependency;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::chain::{
    ChainLink, EffectiveChain, InvocationParams, InvocationResult, Pointcut, Policy,
    WrappedOperation,
};
use super::error::{InvocationError, PolicyRegistrationError, PolicyResult};
use super::template::{PolicyParametrization, PolicyTemplate};

struct Attachment {
    template: String,
    parametrization: PolicyParametrization,
    sequence: u64,
    policy: Arc<dyn Policy>,
}

impl Attachment {
    fn link(&self) -> ChainLink {
        ChainLink {
            attachment: self.parametrization.id.clone(),
            template: self.template.clone(),
            order: self.parametrization.order,
            sequence: self.sequence,
            pointcut: self.parametrization.pointcut.clone(),
            policy: self.policy.clone(),
            listeners: self.parametrization.listeners.clone(),
        }
    }
}

struct AppPolicies {
    /// False between the undeploy and deploy halves of a redeploy
    active: bool,
    plugins: Vec<PluginDependency>,
    attachments: BTreeMap<String, Attachment>,
    chain: Arc<EffectiveChain>,
}

impl AppPolicies {
    fn rebuild(&mut self, application: &str) {
        let links = self.attachments.values().map(Attachment::link).collect();
        self.chain = Arc::new(EffectiveChain::build(application, links));
    }
}

/// An attachment dropped as a side effect of a template or application change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedPolicy {
    pub application: String,
    pub attachment: String,
    pub template: String,
    pub reason: PolicyRegistrationError,
}

/// Query view of one attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentInfo {
    pub application: String,
    pub attachment: String,
    pub template: String,
    pub order: i32,
    pub sequence: u64,
    pub pointcut: Pointcut,
}

/// Registered templates and every application's attachments.
#[derive(Default)]
pub struct PolicyManager {
    templates: RwLock<HashMap<String, Arc<PolicyTemplate>>>,
    applications: RwLock<HashMap<String, AppPolicies>>,
    sequence: AtomicU64,
}

impl std::fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyManager")
            .field("templates", &self.template_names())
            .finish()
    }
}

impl PolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template. If one with the same name exists (the policy
    /// artifact was redeployed), every attachment made from it is
    /// re-instantiated from the new factory; sibling attachments keep their
    /// instances. Attachments that fail to re-instantiate are detached.
    pub fn register_template(&self, template: PolicyTemplate) -> Vec<DetachedPolicy> {
        let template = Arc::new(template);
        let name = template.name().to_string();
        let replaced = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), template.clone())
            .is_some();
        if !replaced {
            debug!(template = %name, "policy template registered");
            return Vec::new();
        }

        let mut detached = Vec::new();
        let mut apps = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (application, entry) in apps.iter_mut() {
            let mut changed = false;
            let mut failed = Vec::new();
            for (id, attachment) in entry.attachments.iter_mut() {
                if attachment.template != name {
                    continue;
                }
                changed = true;
                let fresh = template
                    .check_compatible(application, &entry.plugins)
                    .and_then(|()| template.instantiate(&attachment.parametrization));
                match fresh {
                    Ok(policy) => attachment.policy = policy,
                    Err(reason) => failed.push((id.clone(), reason)),
                }
            }
            for (id, reason) in failed {
                entry.attachments.remove(&id);
                warn!(
                    application = %application,
                    attachment = %id,
                    error = %reason,
                    "policy detached after template redeploy"
                );
                detached.push(DetachedPolicy {
                    application: application.clone(),
                    attachment: id,
                    template: name.clone(),
                    reason,
                });
            }
            if changed {
                entry.rebuild(application);
            }
        }
        info!(template = %name, "policy template replaced");
        detached
    }

    /// Remove a template and every attachment created from it.
    pub fn unregister_template(&self, name: &str) -> Vec<DetachedPolicy> {
        let removed = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if !removed {
            return Vec::new();
        }

        let mut detached = Vec::new();
        let mut apps = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (application, entry) in apps.iter_mut() {
            let before = entry.attachments.len();
            entry.attachments.retain(|id, attachment| {
                if attachment.template != name {
                    return true;
                }
                detached.push(DetachedPolicy {
                    application: application.clone(),
                    attachment: id.clone(),
                    template: name.to_string(),
                    reason: PolicyRegistrationError::UnknownTemplate {
                        template: name.to_string(),
                    },
                });
                false
            });
            if entry.attachments.len() != before {
                entry.rebuild(application);
            }
        }
        debug!(template = %name, detached = detached.len(), "policy template unregistered");
        detached
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Make `application` attachable with the given plugin set. For an
    /// application coming back from a redeploy, existing attachments are
    /// re-validated and incompatible ones detached.
    pub fn activate_application(
        &self,
        application: &str,
        plugins: Vec<PluginDependency>,
    ) -> Vec<DetachedPolicy> {
        let templates = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut apps = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = apps
            .entry(application.to_string())
            .or_insert_with(|| AppPolicies {
                active: false,
                plugins: Vec::new(),
                attachments: BTreeMap::new(),
                chain: Arc::new(EffectiveChain::empty(application)),
            });
        entry.active = true;
        entry.plugins = plugins;

        let mut detached = Vec::new();
        let incompatible: Vec<(String, String, PolicyRegistrationError)> = entry
            .attachments
            .iter()
            .filter_map(|(id, attachment)| {
                let check = match templates.get(&attachment.template) {
                    Some(template) => template.check_compatible(application, &entry.plugins),
                    None => Err(PolicyRegistrationError::UnknownTemplate {
                        template: attachment.template.clone(),
                    }),
                };
                check
                    .err()
                    .map(|reason| (id.clone(), attachment.template.clone(), reason))
            })
            .collect();
        for (id, template, reason) in incompatible {
            entry.attachments.remove(&id);
            warn!(
                application = %application,
                attachment = %id,
                error = %reason,
                "policy detached, no longer compatible"
            );
            detached.push(DetachedPolicy {
                application: application.to_string(),
                attachment: id,
                template,
                reason,
            });
        }
        if !detached.is_empty() {
            entry.rebuild(application);
        }
        detached
    }

    /// Stop accepting invocations for `application`, keeping its attachments
    /// for the deploy half of a redeploy.
    pub fn deactivate_application(&self, application: &str) {
        if let Some(entry) = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(application)
        {
            entry.active = false;
        }
    }

    /// Drop `application` and all of its attachments.
    pub fn forget_application(&self, application: &str) -> bool {
        self.applications
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(application)
            .is_some()
    }

    /// Attach an instance of `template` to `application`. Nothing changes
    /// unless every check passes.
    pub fn add_policy(
        &self,
        application: &str,
        template: &str,
        parametrization: PolicyParametrization,
    ) -> PolicyResult<()> {
        let found = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(template)
            .cloned();
        let template = found.ok_or_else(|| PolicyRegistrationError::UnknownTemplate {
            template: template.to_string(),
        })?;

        let mut apps = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = apps
            .get_mut(application)
            .filter(|e| e.active)
            .ok_or_else(|| PolicyRegistrationError::UnknownApplication {
                application: application.to_string(),
            })?;
        if entry.attachments.contains_key(&parametrization.id) {
            return Err(PolicyRegistrationError::DuplicateAttachment {
                application: application.to_string(),
                attachment: parametrization.id,
            });
        }
        template.check_compatible(application, &entry.plugins)?;
        let policy = template.instantiate(&parametrization)?;

        let id = parametrization.id.clone();
        entry.attachments.insert(
            id.clone(),
            Attachment {
                template: template.name().to_string(),
                parametrization,
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                policy,
            },
        );
        entry.rebuild(application);
        info!(
            application = %application,
            attachment = %id,
            template = %template.name(),
            "policy attached"
        );
        Ok(())
    }

    /// Detach `attachment` from `application`. In-flight invocations finish
    /// on the chain they started with.
    pub fn remove_policy(&self, application: &str, attachment: &str) -> PolicyResult<()> {
        let mut apps = self
            .applications
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = apps.get_mut(application).ok_or_else(|| {
            PolicyRegistrationError::UnknownApplication {
                application: application.to_string(),
            }
        })?;
        if entry.attachments.remove(attachment).is_none() {
            return Err(PolicyRegistrationError::UnknownAttachment {
                application: application.to_string(),
                attachment: attachment.to_string(),
            });
        }
        entry.rebuild(application);
        info!(application = %application, attachment = %attachment, "policy detached");
        Ok(())
    }

    /// Current chain of an active application.
    pub fn chain(&self, application: &str) -> Option<Arc<EffectiveChain>> {
        self.applications
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(application)
            .filter(|e| e.active)
            .map(|e| e.chain.clone())
    }

    /// Run `operation` for `application` through its current chain.
    pub async fn invoke(
        &self,
        application: &str,
        params: InvocationParams,
        operation: &dyn WrappedOperation,
    ) -> InvocationResult {
        let chain = self
            .chain(application)
            .ok_or_else(|| InvocationError::UnknownApplication(application.to_string()))?;
        chain.invoke(params, operation).await
    }

    pub fn attachments(&self, application: &str) -> Vec<AttachmentInfo> {
        let apps = self
            .applications
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = apps.get(application) else {
            return Vec::new();
        };
        entry
            .chain
            .links()
            .iter()
            .map(|link| AttachmentInfo {
                application: application.to_string(),
                attachment: link.attachment.clone(),
                template: link.template.clone(),
                order: link.order,
                sequence: link.sequence,
                pointcut: link.pointcut.clone(),
            })
            .collect()
    }
}
