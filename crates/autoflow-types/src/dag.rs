//! Persisted workflow definitions.
//!
//! A [`Dag`] holds both the authored step tree and the task list compiled
//! from it. Every create or update also writes a [`DagVersion`] snapshot so
//! that instances keep resolving against the tasks they were started with.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operator::TriggerKind;
use crate::step::Step;
use crate::task::Task;

// ---------------------------------------------------------------------------
// Dag
// ---------------------------------------------------------------------------

/// A persisted workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dag {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: DagStatus,
    /// Soft-delete marker. Removed Dags cannot run.
    #[serde(default)]
    pub removed: bool,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub dag_type: DagType,
    /// The authored step tree.
    pub steps: Vec<Step>,
    /// Tasks compiled from `steps` for the current version.
    pub tasks: Vec<Task>,
    /// Composable Dags referenced by this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_ids: Vec<Uuid>,
    /// Monotonic version number, starting at 1.
    pub version: u32,
    /// Id of the [`DagVersion`] matching `version`.
    pub version_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dag {
    /// A new `Normal` Dag at version 1. The trigger kind follows the first
    /// step's operator.
    pub fn new(name: impl Into<String>, steps: Vec<Step>, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        let trigger = steps
            .first()
            .map(|s| TriggerKind::from_operator(&s.operator))
            .unwrap_or_default();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            status: DagStatus::Normal,
            removed: false,
            trigger,
            dag_type: DagType::Default,
            steps,
            tasks,
            sub_ids: Vec::new(),
            version: 1,
            version_id: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Snapshot of the current version.
    pub fn snapshot(&self) -> DagVersion {
        DagVersion {
            id: self.version_id,
            dag_id: self.id,
            version: self.version,
            steps: self.steps.clone(),
            tasks: self.tasks.clone(),
            created_at: self.updated_at,
        }
    }

    /// Whether new instances may be started.
    pub fn is_runnable(&self) -> bool {
        self.status == DagStatus::Normal && !self.removed
    }

    /// Whether this Dag takes part in cross-workflow reference checks.
    pub fn is_composable(&self) -> bool {
        self.dag_type == DagType::ComboOperator
    }
}

/// Immutable snapshot of a Dag's compiled form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagVersion {
    pub id: Uuid,
    pub dag_id: Uuid,
    pub version: u32,
    pub steps: Vec<Step>,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DagStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DagStatus {
    #[default]
    Normal,
    Stopped,
}

impl fmt::Display for DagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagStatus::Normal => write!(f, "normal"),
            DagStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl FromStr for DagStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(DagStatus::Normal),
            "stopped" => Ok(DagStatus::Stopped),
            other => Err(format!("invalid dag status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// DagType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DagType {
    #[default]
    Default,
    DataFlow,
    /// A workflow usable as an operator inside other workflows.
    ComboOperator,
}

impl DagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DagType::Default => "default",
            DagType::DataFlow => "data-flow",
            DagType::ComboOperator => "combo-operator",
        }
    }
}

impl fmt::Display for DagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" | "" => Ok(DagType::Default),
            "data-flow" => Ok(DagType::DataFlow),
            "combo-operator" => Ok(DagType::ComboOperator),
            other => Err(format!("invalid dag type: '{other}'")),
        }
    }
}
