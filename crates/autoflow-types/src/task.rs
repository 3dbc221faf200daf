//! Compiled task graph and its preconditions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::step::{Step, StepSettings};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Flat, compiled form of a [`Step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Normally the id of the immediately preceding compiled task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_on: Vec<String>,
    pub action_name: String,
    /// Watchdog timeout in seconds, margin included.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "PreChecks::is_empty")]
    pub pre_checks: PreChecks,
    /// Loop body, unflattened.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<StepSettings>,
}

// ---------------------------------------------------------------------------
// PreChecks
// ---------------------------------------------------------------------------

/// Named checks attached to a task, keyed `"<branchStepID>_<k>"`.
///
/// Ordered so that compiled output is deterministic.
pub type PreChecks = BTreeMap<String, Check>;

/// One condition group plus what to do when it does not hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    #[serde(default)]
    pub conditions: Vec<TaskCondition>,
    #[serde(default)]
    pub act: ActiveAction,
}

impl Check {
    pub fn skip(conditions: Vec<TaskCondition>) -> Self {
        Self {
            conditions,
            act: ActiveAction::Skip,
        }
    }
}

/// Outcome applied to a task whose check is not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActiveAction {
    #[default]
    Skip,
    Block,
}

/// Group key of a check: the part of the key before the first `_`.
pub fn check_group(key: &str) -> &str {
    key.split('_').next().unwrap_or(key)
}

// ---------------------------------------------------------------------------
// TaskCondition
// ---------------------------------------------------------------------------

/// A boolean comparison between two operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCondition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: ConditionSource,
    #[serde(default)]
    pub parameters: ConditionParameters,
    /// Comparison operator, e.g. `@internal/cmp/string-eq`.
    pub operator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConditionParameters {
    #[serde(default)]
    pub a: Value,
    #[serde(default)]
    pub b: Value,
}

/// Where condition operands are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionSource {
    Vars,
    #[default]
    ShareData,
}

/// Comparison operators understood by precheck evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionOperator {
    StringContains,
    StringNotContains,
    StringEq,
    StringNeq,
    StringStartWith,
    StringEndWith,
    StringEmpty,
    StringNotEmpty,
    StringMatch,
    NumberEq,
    NumberNeq,
    NumberGt,
    NumberGte,
    NumberLt,
    NumberLte,
    DateEq,
    DateNeq,
    DateEarlierThan,
    DateLaterThan,
    ApprovalEq,
    ApprovalNeq,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionOperator::StringContains => "@internal/cmp/string-contains",
            ConditionOperator::StringNotContains => "@internal/cmp/string-not-contains",
            ConditionOperator::StringEq => "@internal/cmp/string-eq",
            ConditionOperator::StringNeq => "@internal/cmp/string-neq",
            ConditionOperator::StringStartWith => "@internal/cmp/string-start-with",
            ConditionOperator::StringEndWith => "@internal/cmp/string-end-with",
            ConditionOperator::StringEmpty => "@internal/cmp/string-empty",
            ConditionOperator::StringNotEmpty => "@internal/cmp/string-not-empty",
            ConditionOperator::StringMatch => "@internal/cmp/string-match",
            ConditionOperator::NumberEq => "@internal/cmp/number-eq",
            ConditionOperator::NumberNeq => "@internal/cmp/number-neq",
            ConditionOperator::NumberGt => "@internal/cmp/number-gt",
            ConditionOperator::NumberGte => "@internal/cmp/number-gte",
            ConditionOperator::NumberLt => "@internal/cmp/number-lt",
            ConditionOperator::NumberLte => "@internal/cmp/number-lte",
            ConditionOperator::DateEq => "@internal/cmp/date-eq",
            ConditionOperator::DateNeq => "@internal/cmp/date-neq",
            ConditionOperator::DateEarlierThan => "@internal/cmp/date-earlier-than",
            ConditionOperator::DateLaterThan => "@internal/cmp/date-later-than",
            ConditionOperator::ApprovalEq => "@workflow/cmp/approval-eq",
            ConditionOperator::ApprovalNeq => "@workflow/cmp/approval-neq",
        }
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ConditionOperator; 21] = [
            ConditionOperator::StringContains,
            ConditionOperator::StringNotContains,
            ConditionOperator::StringEq,
            ConditionOperator::StringNeq,
            ConditionOperator::StringStartWith,
            ConditionOperator::StringEndWith,
            ConditionOperator::StringEmpty,
            ConditionOperator::StringNotEmpty,
            ConditionOperator::StringMatch,
            ConditionOperator::NumberEq,
            ConditionOperator::NumberNeq,
            ConditionOperator::NumberGt,
            ConditionOperator::NumberGte,
            ConditionOperator::NumberLt,
            ConditionOperator::NumberLte,
            ConditionOperator::DateEq,
            ConditionOperator::DateNeq,
            ConditionOperator::DateEarlierThan,
            ConditionOperator::DateLaterThan,
            ConditionOperator::ApprovalEq,
            ConditionOperator::ApprovalNeq,
        ];
        ALL.into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("invalid condition operator: '{s}'"))
    }
}
