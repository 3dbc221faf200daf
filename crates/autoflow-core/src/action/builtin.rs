//! Actions shipped with the engine.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use autoflow_types::instance::TaskInstance;
use autoflow_types::operator;

use super::{Action, ActionContext, ActionError, ActionOutcome};

/// Human approval.
///
/// Never completes synchronously: it blocks with a placeholder carrying a
/// fresh `group_id` that identifies the candidate approvers. The decision
/// arrives later through the resume protocol.
#[derive(Debug, Default)]
pub struct ApprovalAction;

impl ApprovalAction {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 7 * 24 * 3600;
}

impl Action for ApprovalAction {
    fn name(&self) -> &str {
        operator::WORKFLOW_APPROVAL
    }

    fn default_timeout_secs(&self) -> Option<u64> {
        Some(Self::DEFAULT_TIMEOUT_SECS)
    }

    fn cancellable(&self) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &ActionContext,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, ActionError> {
        let approvers = params.get("approvers").cloned().unwrap_or(Value::Array(vec![]));
        let group_id = Uuid::now_v7();
        tracing::info!(
            dag_ins_id = %ctx.dag_ins_id,
            task_id = %ctx.task_id,
            group_id = %group_id,
            "approval requested"
        );
        Ok(ActionOutcome::Blocked(json!({
            "group_id": group_id.to_string(),
            "approvers": approvers,
        })))
    }

    async fn cancel(&self, task: &TaskInstance) -> Result<(), ActionError> {
        tracing::info!(task_ins_id = %task.id, task_id = %task.task_id, "approval withdrawn");
        Ok(())
    }
}
