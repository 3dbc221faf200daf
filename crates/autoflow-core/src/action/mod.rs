//! Action abstractions.
//!
//! An action is the executable behind an operator name:
//! - `Action`: RPITIT trait for concrete action implementations
//! - `BoxAction`: object-safe wrapper for dynamic dispatch
//! - `ActionRegistry`: name-indexed registry injected into the compiler and
//!   the executor

pub mod box_action;
pub mod builtin;
pub mod registry;

pub use box_action::BoxAction;
pub use registry::ActionRegistry;

use serde_json::{Map, Value};
use uuid::Uuid;

use autoflow_types::instance::TaskInstance;

/// Errors raised by actions or by dispatching to them.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("action not registered: {0}")]
    NotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("execution failed: {0}")]
    Failed(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("canceled")]
    Canceled,

    #[error("action '{0}' cannot be canceled")]
    NotCancellable(String),
}

/// What the executor hands to an action.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub dag_ins_id: Uuid,
    /// Runtime task id, iteration-qualified inside loops.
    pub task_id: String,
    /// Snapshot of the instance environment when the task was dispatched.
    pub share_data: Map<String, Value>,
    pub vars: Map<String, Value>,
}

/// Result of running an action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Finished synchronously with this result.
    Completed(Value),
    /// Waiting on external input. The value is the placeholder result used to
    /// correlate the later resume call.
    Blocked(Value),
}

/// Trait for executable actions.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Optional
/// capabilities (cancel, restricted, default timeout) have defaults so most
/// actions only implement `name` and `run`.
pub trait Action: Send + Sync {
    /// Operator name this action handles, e.g. `@workflow/approval`.
    fn name(&self) -> &str;

    /// Execution timeout used when a step carries no explicit setting.
    fn default_timeout_secs(&self) -> Option<u64> {
        None
    }

    /// Whether only administrators may place this action in a workflow.
    fn restricted(&self) -> bool {
        false
    }

    /// Whether `cancel` does anything.
    fn cancellable(&self) -> bool {
        false
    }

    fn run(
        &self,
        ctx: &ActionContext,
        params: &Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<ActionOutcome, ActionError>> + Send;

    /// Withdraw the external work behind a blocked task.
    fn cancel(
        &self,
        _task: &TaskInstance,
    ) -> impl std::future::Future<Output = Result<(), ActionError>> + Send {
        let name = self.name().to_string();
        async move { Err(ActionError::NotCancellable(name)) }
    }
}
