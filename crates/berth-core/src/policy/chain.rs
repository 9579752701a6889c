//! Effective policy chains and their execution.
//!
//! A chain is immutable once built. Rebuilding produces a new `Arc` that is
//! swapped in; invocations that already captured the old one finish on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::InvocationError;

/// Parameters of one invocation of an application operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationParams {
    pub operation: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub payload: Value,
}

impl InvocationParams {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub type InvocationResult = Result<Value, InvocationError>;

/// Predicate deciding whether a policy applies to an invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pointcut {
    #[default]
    Always,
    Operation(String),
    OperationPrefix(String),
    Attribute { key: String, value: Value },
    All(Vec<Pointcut>),
    Any(Vec<Pointcut>),
    Not(Box<Pointcut>),
}

impl Pointcut {
    pub fn matches(&self, params: &InvocationParams) -> bool {
        match self {
            Pointcut::Always => true,
            Pointcut::Operation(op) => params.operation == *op,
            Pointcut::OperationPrefix(prefix) => params.operation.starts_with(prefix.as_str()),
            Pointcut::Attribute { key, value } => params.attributes.get(key) == Some(value),
            Pointcut::All(all) => all.iter().all(|p| p.matches(params)),
            Pointcut::Any(any) => any.iter().any(|p| p.matches(params)),
            Pointcut::Not(inner) => !inner.matches(params),
        }
    }
}

/// The application operation a chain wraps.
#[async_trait]
pub trait WrappedOperation: Send + Sync {
    async fn call(&self, params: InvocationParams) -> InvocationResult;
}

/// A policy instance: does its work around `next`.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn apply(&self, params: InvocationParams, next: Next<'_>) -> InvocationResult;
}

/// Notification boundaries around a policy's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    ProcessStart,
    BeforeNext,
    AfterNext,
    ProcessEnd,
}

/// One notification emitted by a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyNotification {
    pub application: String,
    pub attachment: String,
    pub operation: String,
    pub action: NotificationAction,
}

/// Receives notifications for one attachment.
pub trait PolicyNotificationListener: Send + Sync {
    fn on_notification(&self, notification: &PolicyNotification);
}

/// One policy in an effective chain.
#[derive(Clone)]
pub struct ChainLink {
    pub attachment: String,
    pub template: String,
    pub order: i32,
    pub sequence: u64,
    pub pointcut: Pointcut,
    pub policy: Arc<dyn Policy>,
    pub listeners: Vec<Arc<dyn PolicyNotificationListener>>,
}

impl std::fmt::Debug for ChainLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLink")
            .field("attachment", &self.attachment)
            .field("template", &self.template)
            .field("order", &self.order)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Ordered policies of one application.
#[derive(Debug, Clone)]
pub struct EffectiveChain {
    application: String,
    links: Vec<ChainLink>,
}

impl EffectiveChain {
    /// Order ascending by declared order, ties by attachment sequence.
    pub fn build(application: impl Into<String>, mut links: Vec<ChainLink>) -> Self {
        links.sort_by_key(|l| (l.order, l.sequence));
        Self {
            application: application.into(),
            links,
        }
    }

    pub fn empty(application: impl Into<String>) -> Self {
        Self::build(application, Vec::new())
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    pub fn attachment_ids(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.attachment.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run `operation` wrapped by every policy whose pointcut matches.
    pub async fn invoke(
        &self,
        params: InvocationParams,
        operation: &dyn WrappedOperation,
    ) -> InvocationResult {
        Next {
            chain: self,
            index: 0,
            owner: None,
            operation,
        }
        .run(params)
        .await
    }

    fn notify(&self, index: usize, action: NotificationAction, operation: &str) {
        let link = &self.links[index];
        if link.listeners.is_empty() {
            return;
        }
        let notification = PolicyNotification {
            application: self.application.clone(),
            attachment: link.attachment.clone(),
            operation: operation.to_string(),
            action,
        };
        for listener in &link.listeners {
            listener.on_notification(&notification);
        }
    }
}

/// Continuation handed to a policy: the rest of the chain plus the operation.
pub struct Next<'a> {
    chain: &'a EffectiveChain,
    index: usize,
    owner: Option<usize>,
    operation: &'a dyn WrappedOperation,
}

impl<'a> Next<'a> {
    /// Continue with the next matching policy, or the operation itself.
    pub fn run(self, params: InvocationParams) -> BoxFuture<'a, InvocationResult> {
        Box::pin(async move {
            let (chain, owner) = (self.chain, self.owner);
            let operation = params.operation.clone();
            if let Some(owner) = owner {
                chain.notify(owner, NotificationAction::BeforeNext, &operation);
            }
            let result = self.dispatch(params).await;
            if let Some(owner) = owner {
                chain.notify(owner, NotificationAction::AfterNext, &operation);
            }
            result
        })
    }

    async fn dispatch(self, params: InvocationParams) -> InvocationResult {
        let chain = self.chain;
        let found = chain.links[self.index..]
            .iter()
            .position(|l| l.pointcut.matches(&params))
            .map(|offset| self.index + offset);

        let Some(index) = found else {
            return self.operation.call(params).await;
        };
        let link = &chain.links[index];
        let operation = params.operation.clone();
        chain.notify(index, NotificationAction::ProcessStart, &operation);
        let next = Next {
            chain,
            index: index + 1,
            owner: Some(index),
            operation: self.operation,
        };
        let result = link.policy.apply(params, next).await;
        chain.notify(index, NotificationAction::ProcessEnd, &operation);
        result
    }
}
