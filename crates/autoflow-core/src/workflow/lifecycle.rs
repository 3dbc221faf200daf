//! Cancel and retry.
//!
//! Both operations only touch persisted state. Interrupting an execution that
//! is still in flight is the executor's job; callers signal it first.

use chrono::Utc;
use uuid::Uuid;

use autoflow_types::instance::{DagInstance, DagInstanceStatus, TaskInstanceStatus};

use crate::action::ActionRegistry;
use crate::error::{FlowError, StateError};
use crate::repository::{Store, TaskFilter};

async fn load<S: Store>(store: &S, dag_ins_id: &Uuid) -> Result<DagInstance, FlowError> {
    store
        .get_instance(dag_ins_id)
        .await?
        .ok_or_else(|| FlowError::not_found("instance", dag_ins_id))
}

/// Cancel a non-terminal instance.
///
/// Pending and blocked tasks become Canceled. Blocked tasks whose action can
/// withdraw its external work are asked to do so first; a failed withdrawal
/// is logged and does not stop the cancellation. Returns the canceled task
/// instance ids.
pub async fn cancel<S: Store>(
    store: &S,
    registry: &ActionRegistry,
    dag_ins_id: &Uuid,
) -> Result<Vec<Uuid>, FlowError> {
    let instance = load(store, dag_ins_id).await?;
    if instance.status.is_terminal() {
        return Err(StateError::NotCancellable {
            id: instance.id,
            status: instance.status,
        }
        .into());
    }

    let filter = TaskFilter {
        statuses: vec![TaskInstanceStatus::Init, TaskInstanceStatus::Blocked],
        ..TaskFilter::for_instance(instance.id)
    };
    let tasks = store.list_tasks(&filter).await?;

    for task in tasks
        .iter()
        .filter(|t| t.status == TaskInstanceStatus::Blocked)
    {
        let Some(action) = registry.get(&task.action_name).filter(|a| a.cancellable()) else {
            continue;
        };
        if let Err(e) = action.cancel(task).await {
            tracing::warn!(
                %dag_ins_id,
                task_id = %task.task_id,
                action = %task.action_name,
                error = %e,
                "failed to withdraw blocked task"
            );
        }
    }

    let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
    store.cancel_instance(dag_ins_id, &ids, Utc::now()).await?;
    tracing::info!(%dag_ins_id, previous = %instance.status, tasks = ids.len(), "instance canceled");
    Ok(ids)
}

/// Reset a failed or canceled instance so it can be executed again.
///
/// Returns the ids of the task instances that were reset to Init.
pub async fn retry<S: Store>(store: &S, dag_ins_id: &Uuid) -> Result<Vec<Uuid>, FlowError> {
    let instance = load(store, dag_ins_id).await?;
    if !matches!(
        instance.status,
        DagInstanceStatus::Failed | DagInstanceStatus::Canceled
    ) {
        return Err(StateError::NotRetryable {
            id: instance.id,
            status: instance.status,
        }
        .into());
    }

    let ids = store.reset_for_retry(dag_ins_id).await?;
    tracing::info!(%dag_ins_id, previous = %instance.status, tasks = ids.len(), "instance reset for retry");
    Ok(ids)
}
