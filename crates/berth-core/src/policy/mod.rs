//! Policy chain management.
//!
//! Policy artifacts register templates; applications get an ordered chain
//! of attachments wrapping their externally invoked operations.

mod chain;
mod error;
mod manager;
mod template;

pub use chain::{
    ChainLink, EffectiveChain, InvocationParams, InvocationResult, Next, NotificationAction,
    Pointcut, Policy, PolicyNotification, PolicyNotificationListener, WrappedOperation,
};
pub use error::{InvocationError, PolicyRegistrationError, PolicyResult};
pub use manager::{AttachmentInfo, DetachedPolicy, PolicyManager};
pub use template::{PolicyFactory, PolicyParametrization, PolicyTemplate};
