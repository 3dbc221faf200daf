//! Engine error taxonomy.
//!
//! Validation and policy errors are raised at compile/commit time before
//! anything is persisted. State errors come from lifecycle operations invoked
//! on an instance in the wrong state. Dependency errors wrap failures of the
//! store, the lock, the expression resolver or an action.

use autoflow_types::error::RepositoryError;
use autoflow_types::instance::DagInstanceStatus;
use uuid::Uuid;

use crate::action::ActionError;
use crate::sync::LockError;
use crate::workflow::expression::ResolveError;

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

impl FlowError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        FlowError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Malformed step trees.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("step tree is empty")]
    EmptySteps,

    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("first step '{0}' is not a trigger")]
    FirstStepNotTrigger(String),

    #[error("trigger step '{0}' must be the first step")]
    TriggerOutOfPlace(String),

    #[error("unsupported operator '{operator}' in step '{step_id}'")]
    UnknownOperator { step_id: String, operator: String },

    #[error("invalid step tree: {0}")]
    Malformed(String),
}

/// Rejected by engine policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("reference cycle through dag {refer_dag_id} ({refer_name})")]
    ReferenceCycle { refer_dag_id: Uuid, refer_name: String },

    #[error("action '{0}' is restricted to administrators")]
    RestrictedAction(String),
}

/// An operation invoked on an instance in the wrong state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("instance {id} is {status} and cannot be resumed")]
    NotResumable { id: Uuid, status: DagInstanceStatus },

    #[error("no blocked task found among {0:?}")]
    TaskNotBlocked(Vec<Uuid>),

    #[error("instance {id} is {status} and cannot be retried")]
    NotRetryable { id: Uuid, status: DagInstanceStatus },

    #[error("instance {id} is {status} and cannot be canceled")]
    NotCancellable { id: Uuid, status: DagInstanceStatus },

    #[error("instance {id} is {status} and cannot be executed")]
    NotExecutable { id: Uuid, status: DagInstanceStatus },

    #[error("dag {0} is stopped or removed")]
    DagNotRunnable(Uuid),

    #[error("call chain depth {depth} exceeds limit {max}")]
    CallChainTooDeep { depth: usize, max: usize },

    #[error("dag {0} is already on the call chain")]
    CallChainLoop(Uuid),
}

/// A collaborator failed.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("store: {0}")]
    Store(#[from] RepositoryError),

    #[error("lock: {0}")]
    Lock(#[from] LockError),

    #[error("resolver: {0}")]
    Resolver(#[from] ResolveError),

    #[error("action: {0}")]
    Action(#[from] ActionError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RepositoryError> for FlowError {
    fn from(e: RepositoryError) -> Self {
        FlowError::Dependency(DependencyError::Store(e))
    }
}

impl From<LockError> for FlowError {
    fn from(e: LockError) -> Self {
        FlowError::Dependency(DependencyError::Lock(e))
    }
}

impl From<ResolveError> for FlowError {
    fn from(e: ResolveError) -> Self {
        FlowError::Dependency(DependencyError::Resolver(e))
    }
}

impl From<ActionError> for FlowError {
    fn from(e: ActionError) -> Self {
        FlowError::Dependency(DependencyError::Action(e))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Dependency(DependencyError::Serialization(e))
    }
}
