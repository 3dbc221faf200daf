//! Step tree to task graph compilation.
//!
//! The tree is flattened depth-first into [`Task`]s:
//!
//! - A branch-control step becomes one header task carrying the inherited
//!   prechecks. Each branch body inherits those plus one skip check per
//!   condition group of its branch, keyed `"<branchStepID>_<groupIndex>"`.
//! - A loop step becomes one task holding its parameters and its body,
//!   unflattened. The body is expanded at run time.
//! - Any other step becomes one task with the inherited prechecks, unless it
//!   would re-fire the workflow's own trigger, in which case its prechecks
//!   are replaced with a single always-false check.
//!
//! Each task depends on the task emitted before it on the same level. The
//! first task of a branch body depends on the branch header, and the task
//! after a branch-control step depends on the header too.
//!
//! Besides the tasks the compiler returns a flat list of parameter views:
//! every step with `branches`/`steps` stripped plus every branch condition,
//! for schema validation by the caller.

use std::collections::HashSet;

use serde_json::{Map, Value};

use autoflow_types::config::EngineConfig;
use autoflow_types::operator;
use autoflow_types::step::{walk_steps, Branch, Step, StepKind};
use autoflow_types::task::{
    Check, ConditionOperator, ConditionParameters, ConditionSource, PreChecks, Task,
    TaskCondition,
};

use crate::action::ActionRegistry;
use crate::error::ValidationError;

use super::cycle::SelfTriggerGuard;

/// Precheck key of the always-false check attached to self-triggering steps.
pub const SELF_TRIGGER_CHECK: &str = "end";

/// Output of [`Compiler::compile`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    pub tasks: Vec<Task>,
    pub views: Vec<Map<String, Value>>,
}

pub struct Compiler<'a> {
    registry: &'a ActionRegistry,
    config: &'a EngineConfig,
    guard: &'a SelfTriggerGuard,
}

impl<'a> Compiler<'a> {
    pub fn new(
        registry: &'a ActionRegistry,
        config: &'a EngineConfig,
        guard: &'a SelfTriggerGuard,
    ) -> Self {
        Self {
            registry,
            config,
            guard,
        }
    }

    /// Check the tree's shape before anything is compiled or persisted.
    ///
    /// - the tree is non-empty
    /// - ids are unique across every nesting level
    /// - the first step is a trigger and no other step is
    /// - operators are registered, when the registry is not empty
    pub fn validate(&self, steps: &[Step]) -> Result<(), ValidationError> {
        let first = steps.first().ok_or(ValidationError::EmptySteps)?;
        if !operator::is_trigger(&first.operator) {
            return Err(ValidationError::FirstStepNotTrigger(first.id.clone()));
        }

        let mut all = Vec::new();
        walk_steps(steps, &mut |s| all.push(s));

        let mut seen = HashSet::new();
        for step in all {
            if step.id.is_empty() {
                return Err(ValidationError::Malformed(format!(
                    "step with operator '{}' has no id",
                    step.operator
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ValidationError::DuplicateStepId(step.id.clone()));
            }
            if !std::ptr::eq(step, first) && operator::is_trigger(&step.operator) {
                return Err(ValidationError::TriggerOutOfPlace(step.id.clone()));
            }
            if !self.is_known(&step.operator) {
                return Err(ValidationError::UnknownOperator {
                    step_id: step.id.clone(),
                    operator: step.operator.clone(),
                });
            }
        }
        Ok(())
    }

    fn is_known(&self, op: &str) -> bool {
        self.registry.is_empty()
            || engine_handles(op)
            || operator::is_trigger(op)
            || self.registry.contains(op)
    }

    /// Validate and compile `steps`. Deterministic for a given tree.
    pub fn compile(&self, steps: &[Step]) -> Result<CompiledGraph, ValidationError> {
        self.validate(steps)?;
        let trigger = &steps[0];

        let mut graph = CompiledGraph {
            tasks: Vec::new(),
            views: Vec::new(),
        };
        self.build(trigger, steps, &PreChecks::new(), None, &mut graph)?;

        tracing::debug!(
            trigger = %trigger.operator,
            tasks = graph.tasks.len(),
            views = graph.views.len(),
            "compiled step tree"
        );
        Ok(graph)
    }

    fn build(
        &self,
        trigger: &Step,
        steps: &[Step],
        inherited: &PreChecks,
        mut prev: Option<String>,
        graph: &mut CompiledGraph,
    ) -> Result<(), ValidationError> {
        for step in steps {
            graph.views.push(step_view(step)?);
            let depend_on: Vec<String> = prev.iter().cloned().collect();

            match step.kind() {
                StepKind::Branch => {
                    graph.tasks.push(Task {
                        id: step.id.clone(),
                        name: step.title.clone(),
                        depend_on,
                        action_name: step.operator.clone(),
                        timeout_secs: 0,
                        params: Map::new(),
                        pre_checks: inherited.clone(),
                        steps: Vec::new(),
                        settings: None,
                    });
                    for branch in &step.branches {
                        let checks = branch_checks(&step.id, branch, inherited);
                        for group in &branch.conditions {
                            for cond in group {
                                graph.views.push(condition_view(cond)?);
                            }
                        }
                        self.build(trigger, &branch.steps, &checks, Some(step.id.clone()), graph)?;
                    }
                }
                StepKind::Loop => {
                    graph.tasks.push(Task {
                        id: step.id.clone(),
                        name: step.title.clone(),
                        depend_on,
                        action_name: step.operator.clone(),
                        timeout_secs: 0,
                        params: step.parameters.clone(),
                        pre_checks: inherited.clone(),
                        steps: step.steps.clone(),
                        settings: None,
                    });
                }
                StepKind::Sequential => {
                    let pre_checks = if self.guard.refires(trigger, step) {
                        tracing::info!(
                            step_id = %step.id,
                            operator = %step.operator,
                            trigger = %trigger.operator,
                            "step would re-fire its own trigger, skipping it unconditionally"
                        );
                        never_check()
                    } else {
                        inherited.clone()
                    };
                    graph.tasks.push(Task {
                        id: step.id.clone(),
                        name: step.title.clone(),
                        depend_on,
                        action_name: step.operator.clone(),
                        timeout_secs: task_timeout(step, self.registry, self.config),
                        params: step.parameters.clone(),
                        pre_checks,
                        steps: Vec::new(),
                        settings: effective_settings(step).cloned(),
                    });
                }
            }
            prev = Some(step.id.clone());
        }
        Ok(())
    }
}

/// Operators the engine interprets itself.
fn engine_handles(op: &str) -> bool {
    matches!(
        op,
        operator::BRANCH | operator::LOOP | operator::INTERNAL_RETURN | operator::INTERNAL_ASSIGN
    )
}

/// Approval and transfer steps always use their action's default policy.
pub fn effective_settings(step: &Step) -> Option<&autoflow_types::step::StepSettings> {
    match step.operator.as_str() {
        operator::WORKFLOW_APPROVAL | operator::INTELLIINFO_TRANSFER => None,
        _ => step.settings.as_ref(),
    }
}

/// Watchdog timeout of `step` in seconds, margin included.
///
/// An explicit timeout setting wins. Otherwise the registry's declared
/// default, then the configured per-action override, then the global default.
pub fn task_timeout(step: &Step, registry: &ActionRegistry, config: &EngineConfig) -> u64 {
    let explicit = effective_settings(step)
        .and_then(|s| s.timeout.as_ref())
        .map(|t| t.delay);
    let base = explicit.unwrap_or_else(|| {
        registry
            .default_timeout(&step.operator)
            .or_else(|| config.task_timeouts.get(&step.operator).copied())
            .unwrap_or(config.default_task_timeout_secs)
    });
    base + config.watchdog_margin_secs
}

/// Inherited checks plus one skip check per condition group of `branch`.
pub fn branch_checks(branch_step_id: &str, branch: &Branch, inherited: &PreChecks) -> PreChecks {
    let mut checks = inherited.clone();
    for (index, group) in branch.conditions.iter().enumerate() {
        checks.insert(format!("{branch_step_id}_{index}"), Check::skip(group.clone()));
    }
    checks
}

/// Prechecks that can never be met.
fn never_check() -> PreChecks {
    let cond = TaskCondition {
        id: "0000000000".to_string(),
        source: ConditionSource::ShareData,
        parameters: ConditionParameters {
            a: Value::String("0".into()),
            b: Value::String("1".into()),
        },
        operator: ConditionOperator::StringEq.as_str().to_string(),
    };
    let mut checks = PreChecks::new();
    checks.insert(SELF_TRIGGER_CHECK.to_string(), Check::skip(vec![cond]));
    checks
}

fn step_view(step: &Step) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::to_value(step) {
        Ok(Value::Object(mut map)) => {
            map.remove("branches");
            map.remove("steps");
            Ok(map)
        }
        Ok(_) => Err(ValidationError::Malformed(format!("step '{}' is not an object", step.id))),
        Err(e) => Err(ValidationError::Malformed(e.to_string())),
    }
}

fn condition_view(cond: &TaskCondition) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::to_value(cond) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::Malformed(format!("condition '{}' is not an object", cond.id))),
        Err(e) => Err(ValidationError::Malformed(e.to_string())),
    }
}
