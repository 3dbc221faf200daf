//! BoxAction -- object-safe dynamic dispatch wrapper for Action.
//!
//! 1. An object-safe `ActionDyn` trait with boxed futures
//! 2. Blanket-impl `ActionDyn` for all `T: Action`
//! 3. `BoxAction` wraps `Box<dyn ActionDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use autoflow_types::instance::TaskInstance;

use super::{Action, ActionContext, ActionError, ActionOutcome};

/// Object-safe version of [`Action`] with boxed futures.
pub trait ActionDyn: Send + Sync {
    fn name(&self) -> &str;

    fn default_timeout_secs(&self) -> Option<u64>;

    fn restricted(&self) -> bool;

    fn cancellable(&self) -> bool;

    fn run_boxed<'a>(
        &'a self,
        ctx: &'a ActionContext,
        params: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, ActionError>> + Send + 'a>>;

    fn cancel_boxed<'a>(
        &'a self,
        task: &'a TaskInstance,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;
}

/// Blanket implementation: any `Action` automatically implements `ActionDyn`.
impl<T: Action> ActionDyn for T {
    fn name(&self) -> &str {
        Action::name(self)
    }

    fn default_timeout_secs(&self) -> Option<u64> {
        Action::default_timeout_secs(self)
    }

    fn restricted(&self) -> bool {
        Action::restricted(self)
    }

    fn cancellable(&self) -> bool {
        Action::cancellable(self)
    }

    fn run_boxed<'a>(
        &'a self,
        ctx: &'a ActionContext,
        params: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, ActionError>> + Send + 'a>> {
        Box::pin(self.run(ctx, params))
    }

    fn cancel_boxed<'a>(
        &'a self,
        task: &'a TaskInstance,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
        Box::pin(self.cancel(task))
    }
}

/// Type-erased action for the runtime registry.
///
/// Since `Action` uses RPITIT, it cannot be used as a trait object directly.
pub struct BoxAction {
    inner: Box<dyn ActionDyn + Send + Sync>,
}

impl BoxAction {
    /// Wrap a concrete `Action` in a type-erased box.
    pub fn new<T: Action + 'static>(action: T) -> Self {
        Self {
            inner: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn default_timeout_secs(&self) -> Option<u64> {
        self.inner.default_timeout_secs()
    }

    pub fn restricted(&self) -> bool {
        self.inner.restricted()
    }

    pub fn cancellable(&self) -> bool {
        self.inner.cancellable()
    }

    pub async fn run(
        &self,
        ctx: &ActionContext,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        self.inner.run_boxed(ctx, params).await
    }

    pub async fn cancel(&self, task: &TaskInstance) -> Result<(), ActionError> {
        self.inner.cancel_boxed(task).await
    }
}
