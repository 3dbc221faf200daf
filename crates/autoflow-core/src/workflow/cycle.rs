//! Cycle guards.
//!
//! Two independent checks:
//! - Self-trigger rules: a step whose side effect would satisfy the
//!   workflow's own trigger again. Rules are keyed by trigger operator.
//! - Reference cycles: composable workflows referencing each other through
//!   `sub_ids`, found by breadth-first traversal of the stored Dags.

use std::collections::{HashMap, HashSet};

use autoflow_types::error::RepositoryError;
use autoflow_types::operator;
use autoflow_types::step::Step;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::DagRepository;

// ---------------------------------------------------------------------------
// Self-trigger rules
// ---------------------------------------------------------------------------

/// Decides whether `step` would re-fire the trigger it is registered for.
pub trait SelfTriggerRule: Send + Sync {
    /// Trigger operator this rule applies to.
    fn trigger_operator(&self) -> &str;

    fn refires(&self, trigger: &Step, step: &Step) -> bool;
}

/// Uploading under a watched folder fires the trigger, so creating a file
/// there from inside the workflow would fire it again.
#[derive(Debug, Default)]
pub struct UploadCreateFileRule;

impl SelfTriggerRule for UploadCreateFileRule {
    fn trigger_operator(&self) -> &str {
        operator::TRIGGER_FILE_UPLOAD
    }

    fn refires(&self, trigger: &Step, step: &Step) -> bool {
        if step.operator != operator::FILE_CREATE {
            return false;
        }
        let Some(target) = step.parameters.get("docid").and_then(Value::as_str) else {
            return false;
        };
        let inherit = trigger
            .parameters
            .get("inherit")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let watched = trigger
            .parameters
            .get("docids")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        watched.iter().any(|id| {
            let id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if inherit {
                target.starts_with(&id)
            } else {
                target == id
            }
        })
    }
}

/// Self-trigger rules indexed by trigger operator.
#[derive(Default)]
pub struct SelfTriggerGuard {
    rules: HashMap<String, Box<dyn SelfTriggerRule>>,
}

impl SelfTriggerGuard {
    /// A guard with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// The rules known to be safe to enforce.
    pub fn with_defaults() -> Self {
        let mut guard = Self::new();
        guard.register(UploadCreateFileRule);
        guard
    }

    pub fn register<R: SelfTriggerRule + 'static>(&mut self, rule: R) {
        self.rules
            .insert(rule.trigger_operator().to_string(), Box::new(rule));
    }

    /// Whether running `step` could fire `trigger` again.
    pub fn refires(&self, trigger: &Step, step: &Step) -> bool {
        self.rules
            .get(&trigger.operator)
            .is_some_and(|rule| rule.refires(trigger, step))
    }
}

// ---------------------------------------------------------------------------
// Reference cycles
// ---------------------------------------------------------------------------

/// Outcome of [`has_cycle`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub cycle: bool,
    /// The Dag being checked, if it already has an id.
    pub curr_id: Option<Uuid>,
    /// First Dag reached twice.
    pub refer_dag_id: Option<Uuid>,
    pub refer_name: Option<String>,
}

/// Breadth-first search for a reference cycle through `sub_ids`.
///
/// Starts from `root` (the Dag under edit, marked visited) and its proposed
/// `sub_ids`. Only composable Dags that are the root or reference others are
/// expanded; anything else ends its path.
pub async fn has_cycle<R: DagRepository>(
    repo: &R,
    root: Option<Uuid>,
    sub_ids: &[Uuid],
) -> Result<CycleReport, RepositoryError> {
    let mut report = CycleReport {
        curr_id: root,
        ..Default::default()
    };
    let mut visited: HashSet<Uuid> = HashSet::new();
    if let Some(root) = root {
        visited.insert(root);
    }

    let mut queue: Vec<Uuid> = sub_ids.to_vec();
    while !queue.is_empty() {
        let level = std::mem::take(&mut queue);
        let dags = repo.list_dags_by_ids(&level).await?;
        for dag in dags {
            let is_root = root == Some(dag.id);
            if !dag.is_composable() || (dag.sub_ids.is_empty() && !is_root) {
                continue;
            }
            if !visited.insert(dag.id) {
                tracing::debug!(dag_id = %dag.id, name = %dag.name, "reference cycle found");
                report.cycle = true;
                report.refer_dag_id = Some(dag.id);
                report.refer_name = Some(dag.name);
                return Ok(report);
            }
            queue.extend(dag.sub_ids);
        }
    }
    Ok(report)
}
