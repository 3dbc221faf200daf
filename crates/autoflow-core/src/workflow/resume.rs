//! Re-injecting external results into blocked tasks.
//!
//! An external decision (an approval, a callback) can arrive before the
//! instance has persisted its Blocked state, so each call is retried a bounded
//! number of times with a fixed backoff. Only transient conditions are
//! retried: the task is missing or not yet blocked, or the instance is not yet
//! blocked. Instances that already finished are rejected at once.
//!
//! Tasks already past Blocked make the call a no-op, which keeps delivering
//! the same decision twice harmless.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use autoflow_types::config::ResumeConfig;
use autoflow_types::event::DagInstanceEvent;
use autoflow_types::instance::{
    DagInstance, DagInstanceStatus, InstanceMode, TaskInstance, TaskInstanceStatus,
    APPROVAL_TASK_IDS_KEY,
};
use autoflow_types::operator;

use crate::error::{FlowError, StateError};
use crate::repository::{Store, TaskFilter};

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The result was applied. Holds the ids of the instances that changed.
    Applied(Vec<Uuid>),
    /// Every targeted task had already moved past Blocked.
    AlreadyApplied,
}

/// Whether a failed attempt may be retried.
enum Attempt {
    Retry(FlowError),
    Fatal(FlowError),
}

impl From<FlowError> for Attempt {
    fn from(e: FlowError) -> Self {
        Attempt::Fatal(e)
    }
}

/// Apply `result` with `status` to the blocked tasks among `task_ins_ids`.
pub async fn resume<S: Store>(
    store: &S,
    config: &ResumeConfig,
    task_ins_ids: &[Uuid],
    result: &Map<String, Value>,
    status: TaskInstanceStatus,
) -> Result<ResumeOutcome, FlowError> {
    tracing::info!(ids = ?task_ins_ids, status = %status, "resuming blocked tasks");
    let max_attempts = config.max_attempts.max(1);
    let backoff = Duration::from_millis(config.backoff_ms);

    let mut attempt = 1;
    loop {
        let final_attempt = attempt >= max_attempts;
        match try_resume(store, task_ins_ids, result, status, final_attempt).await {
            Ok(outcome) => return Ok(outcome),
            Err(Attempt::Retry(e)) if !final_attempt => {
                tracing::debug!(attempt, error = %e, "resume not applicable yet, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(Attempt::Retry(e)) | Err(Attempt::Fatal(e)) => {
                tracing::warn!(attempt, error = %e, "resume rejected");
                return Err(e);
            }
        }
    }
}

async fn try_resume<S: Store>(
    store: &S,
    task_ins_ids: &[Uuid],
    result: &Map<String, Value>,
    status: TaskInstanceStatus,
    final_attempt: bool,
) -> Result<ResumeOutcome, Attempt> {
    let filter = TaskFilter {
        ids: task_ins_ids.to_vec(),
        ..TaskFilter::default()
    };
    let tasks = store.list_tasks(&filter).await.map_err(FlowError::from)?;

    let (blocked, rest): (Vec<TaskInstance>, Vec<TaskInstance>) = tasks
        .into_iter()
        .partition(|t| t.status == TaskInstanceStatus::Blocked);
    if blocked.is_empty() {
        if rest.iter().any(|t| t.status.is_settled()) {
            tracing::info!(ids = ?task_ins_ids, "tasks already resumed");
            return Ok(ResumeOutcome::AlreadyApplied);
        }
        return Err(Attempt::Retry(
            StateError::TaskNotBlocked(task_ins_ids.to_vec()).into(),
        ));
    }

    let mut applied = Vec::with_capacity(blocked.len());
    for task in blocked {
        let instance = store
            .get_instance(&task.dag_ins_id)
            .await
            .map_err(FlowError::from)?
            .ok_or_else(|| FlowError::not_found("instance", task.dag_ins_id))?;
        check_resumable(&instance, final_attempt)?;
        applied.push(apply(store, task, instance, result, status).await?);
    }
    Ok(ResumeOutcome::Applied(applied))
}

fn check_resumable(instance: &DagInstance, final_attempt: bool) -> Result<(), Attempt> {
    let rejected = || -> FlowError {
        StateError::NotResumable {
            id: instance.id,
            status: instance.status,
        }
        .into()
    };
    match instance.status {
        DagInstanceStatus::Success | DagInstanceStatus::Failed => Err(Attempt::Fatal(rejected())),
        _ if instance.mode == InstanceMode::Vm && instance.status != DagInstanceStatus::Blocked => {
            Err(Attempt::Retry(rejected()))
        }
        DagInstanceStatus::Running if !final_attempt => Err(Attempt::Retry(rejected())),
        _ => Ok(()),
    }
}

/// Merge the result into one blocked task and move its instance on.
async fn apply<S: Store>(
    store: &S,
    mut task: TaskInstance,
    mut instance: DagInstance,
    result: &Map<String, Value>,
    status: TaskInstanceStatus,
) -> Result<Uuid, FlowError> {
    let previous = instance.status;
    let status = match (status, instance.mode) {
        (TaskInstanceStatus::Retrying, InstanceMode::Vm) => TaskInstanceStatus::Failed,
        (status, _) => status,
    };

    let mut merged = match task.results.take() {
        Some(Value::Object(placeholder)) => placeholder,
        _ => Map::new(),
    };
    for (k, v) in result {
        merged.insert(k.clone(), v.clone());
    }
    let merged_value = Value::Object(merged.clone());

    task.results = Some(merged_value.clone());
    if status == TaskInstanceStatus::Failed {
        task.reason = Some(merged_value.clone());
    }
    task.transition(status);
    store.update_task(&task).await?;

    if task.action_name == operator::WORKFLOW_APPROVAL {
        let mut ids = match instance.share_data.get(APPROVAL_TASK_IDS_KEY) {
            Some(Value::Array(ids)) => ids.clone(),
            _ => Vec::new(),
        };
        ids.push(Value::String(task.task_id.clone()));
        instance.share_data.set(APPROVAL_TASK_IDS_KEY, Value::Array(ids));
    }
    let stored = if merged.is_empty() {
        Value::String("null".into())
    } else {
        merged_value.clone()
    };
    instance.share_data.set(&task.task_id, stored);

    if instance.records_events() {
        let data = if status == TaskInstanceStatus::Failed {
            merged_value.clone()
        } else {
            Value::Null
        };
        let event = DagInstanceEvent::task_status(
            instance.id,
            &task.action_name,
            &task.task_id,
            status.as_str(),
            data,
            Utc::now().timestamp_micros(),
        );
        store.append_events(&[event]).await?;
    }

    let now = Utc::now();
    instance.status = DagInstanceStatus::Init;
    match instance.mode {
        InstanceMode::Vm => {
            instance.resume_status = Some(status);
            instance.resume_data = Some(match serde_json::to_string(&[&merged_value]) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(dag_ins_id = %instance.id, error = %e, "failed to encode resume payload");
                    instance.resume_status = Some(TaskInstanceStatus::Failed);
                    "[null]".to_string()
                }
            });
        }
        InstanceMode::Schedule if status == TaskInstanceStatus::Failed => {
            instance.status = DagInstanceStatus::Failed;
            instance.reason = Some(
                json!({
                    "taskId": task.task_id,
                    "name": task.name,
                    "actionName": task.action_name,
                    "detail": task.reason,
                })
                .to_string(),
            );
            instance.ended_at = Some(now);
        }
        InstanceMode::Schedule if previous == DagInstanceStatus::Running => {
            instance.status = DagInstanceStatus::Running;
        }
        InstanceMode::Schedule => {}
    }
    if previous == DagInstanceStatus::Canceled {
        instance.status = previous;
    }
    instance.updated_at = now;
    store.update_instance(&instance).await?;

    tracing::info!(
        dag_ins_id = %instance.id,
        task_id = %task.task_id,
        task_status = %status,
        instance_status = %instance.status,
        "blocked task resumed"
    );
    Ok(instance.id)
}
