//! Authored step tree.
//!
//! A workflow is written as a list of [`Step`]s. Branch-control steps carry
//! [`Branch`]es, loop steps carry a nested body in `steps`. The compiler in
//! `autoflow-core` flattens this tree into [`crate::task::Task`]s.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::operator;
use crate::task::TaskCondition;

/// One node of the authored workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Caller-assigned id, unique within the whole workflow.
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Present on branch-control steps only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    /// Loop body. Kept nested through compilation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<StepSettings>,
}

/// One arm of a branch-control step.
///
/// `conditions` is a list of condition groups. Conditions within a group are
/// AND-ed; the branch runs when any group holds. No groups means the branch
/// always runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub conditions: Vec<Vec<TaskCondition>>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetrySettings {
    #[serde(default)]
    pub max: u32,
    /// Seconds between attempts.
    #[serde(default)]
    pub delay: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TimeoutSettings {
    /// Execution timeout in seconds.
    #[serde(default)]
    pub delay: u64,
}

/// Structural kind of a step, derived from its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Sequential,
    Branch,
    Loop,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self.operator.as_str() {
            operator::BRANCH => StepKind::Branch,
            operator::LOOP => StepKind::Loop,
            _ => StepKind::Sequential,
        }
    }

    /// Whether nothing after this step is reachable.
    pub fn is_return(&self) -> bool {
        self.operator == operator::INTERNAL_RETURN
    }

    /// Visit this step and every nested step, depth-first, branches before
    /// loop bodies.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Step)) {
        visit(self);
        for branch in &self.branches {
            for step in &branch.steps {
                step.walk(visit);
            }
        }
        for step in &self.steps {
            step.walk(visit);
        }
    }
}

/// Visit every step of a tree in authoring order.
pub fn walk_steps<'a>(steps: &'a [Step], visit: &mut impl FnMut(&'a Step)) {
    for step in steps {
        step.walk(visit);
    }
}
