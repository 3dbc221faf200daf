//! Run-time instances: one [`DagInstance`] per execution, one
//! [`TaskInstance`] per executed task.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dag::{Dag, DagType};
use crate::operator::TriggerKind;
use crate::step::Step;
use crate::task::{PreChecks, Task};

/// ShareData key listing every approval task resumed so far.
pub const APPROVAL_TASK_IDS_KEY: &str = "__workflow_approval_task_ids";

/// Branch step nested in a loop body: `<loop>_i<k>_s<step>..._<branchStep>`.
static NESTED_BODY_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\d+_i\d+_s\d+.+_(\d+)$").ok());
/// Loop body step: `<loop>_i<k>_s<step>`.
static BODY_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\d+_i\d+_s(\d+)$").ok());
/// Loop header past iteration 0: `<loop>_i<k>`.
static ITERATION_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d+)_i\d+$").ok());
/// Any key ending in an iteration-qualified step, captured without the prefix.
static ITERATION_STEP_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"_i\d+_s([^_]+)$").ok());

/// Map an iteration-qualified runtime id back to the step id it came from.
///
/// Ids that are not iteration-qualified are returned unchanged.
pub fn normalize_event_task_id(id: &str) -> String {
    let patterns = [
        NESTED_BODY_ID.as_ref(),
        BODY_ID.as_ref(),
        ITERATION_ID.as_ref(),
    ];
    for re in patterns.into_iter().flatten() {
        if let Some(step) = re.captures(id).and_then(|c| c.get(1)) {
            return step.as_str().to_string();
        }
    }
    id.to_string()
}

// ---------------------------------------------------------------------------
// DagInstance
// ---------------------------------------------------------------------------

/// One execution of a Dag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagInstance {
    pub id: Uuid,
    pub dag_id: Uuid,
    /// Version the instance was created against. Tasks always come from here.
    pub version_id: Uuid,
    pub trigger: TriggerKind,
    pub status: DagInstanceStatus,
    #[serde(default)]
    pub mode: InstanceMode,
    #[serde(default)]
    pub event_persistence: EventPersistence,
    #[serde(default)]
    pub dag_type: DagType,
    /// Variables accumulated as tasks produce results.
    #[serde(default)]
    pub share_data: ShareData,
    /// Run-time inputs supplied by the caller.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub vars: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Dags on the invocation path that led to this instance, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub call_chain: Vec<Uuid>,
    /// One-shot status injected by the resume protocol (VM mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_status: Option<TaskInstanceStatus>,
    /// One-shot JSON payload injected by the resume protocol (VM mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_data: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl DagInstance {
    /// A fresh `Init` instance bound to the dag's current version.
    pub fn for_dag(dag: &Dag) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            dag_id: dag.id,
            version_id: dag.version_id,
            trigger: dag.trigger,
            status: DagInstanceStatus::Init,
            mode: InstanceMode::default(),
            event_persistence: EventPersistence::default(),
            dag_type: dag.dag_type,
            share_data: ShareData::new(),
            vars: Map::new(),
            reason: None,
            call_chain: Vec::new(),
            resume_status: None,
            resume_data: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Whether event-sourced persistence applies to writes on this instance.
    ///
    /// VM instances record their environment elsewhere, so only scheduled
    /// instances with SQL persistence append events.
    pub fn records_events(&self) -> bool {
        self.event_persistence == EventPersistence::Sql && self.mode != InstanceMode::Vm
    }

    /// Take the one-shot resume payload, leaving none behind.
    pub fn take_resume(&mut self) -> Option<(TaskInstanceStatus, Option<String>)> {
        let status = self.resume_status.take()?;
        Some((status, self.resume_data.take()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DagInstanceStatus {
    #[default]
    Init,
    Scheduled,
    Running,
    Blocked,
    Failed,
    Success,
    Canceled,
}

impl DagInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DagInstanceStatus::Init => "init",
            DagInstanceStatus::Scheduled => "scheduled",
            DagInstanceStatus::Running => "running",
            DagInstanceStatus::Blocked => "blocked",
            DagInstanceStatus::Failed => "failed",
            DagInstanceStatus::Success => "success",
            DagInstanceStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DagInstanceStatus::Success | DagInstanceStatus::Failed | DagInstanceStatus::Canceled
        )
    }
}

impl fmt::Display for DagInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DagInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(DagInstanceStatus::Init),
            "scheduled" => Ok(DagInstanceStatus::Scheduled),
            "running" => Ok(DagInstanceStatus::Running),
            "blocked" => Ok(DagInstanceStatus::Blocked),
            "failed" => Ok(DagInstanceStatus::Failed),
            "success" => Ok(DagInstanceStatus::Success),
            "canceled" | "cancelled" => Ok(DagInstanceStatus::Canceled),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

/// How an instance is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceMode {
    /// Task-by-task scheduling against the compiled graph.
    #[default]
    Schedule,
    /// Driven by the expression VM, resumed through a one-shot payload.
    Vm,
}

impl InstanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceMode::Schedule => "schedule",
            InstanceMode::Vm => "vm",
        }
    }
}

impl FromStr for InstanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(InstanceMode::Schedule),
            "vm" => Ok(InstanceMode::Vm),
            other => Err(format!("invalid instance mode: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPersistence {
    #[default]
    None,
    Sql,
}

impl EventPersistence {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPersistence::None => "none",
            EventPersistence::Sql => "sql",
        }
    }
}

impl FromStr for EventPersistence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(EventPersistence::None),
            "sql" => Ok(EventPersistence::Sql),
            other => Err(format!("invalid event persistence: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// ShareData
// ---------------------------------------------------------------------------

/// Per-instance variable environment.
///
/// Task results live under `__<taskID>`. Writing an iteration-qualified id
/// also writes the plain step key so later steps can reference either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ShareData(pub Map<String, Value>);

impl ShareData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Result stored for `task_id`.
    pub fn task_result(&self, task_id: &str) -> Option<&Value> {
        self.0.get(&task_key(task_id))
    }

    /// Store `value` for `key` and return every entry that was written.
    pub fn set(&mut self, key: &str, value: Value) -> Vec<(String, Value)> {
        let mut written = Vec::new();
        if key.starts_with("__") {
            written.push((key.to_string(), value));
        } else if key.contains("_i") {
            let origin = iteration_origin(key);
            written.push((task_key(origin), value.clone()));
            written.push((task_key(key), value));
        } else if !key.is_empty() {
            written.push((task_key(key), value));
        }
        for (k, v) in &written {
            self.0.insert(k.clone(), v.clone());
        }
        written
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Reserved ShareData key for a task's result.
pub fn task_key(task_id: &str) -> String {
    format!("__{task_id}")
}

/// Step id that an iteration-qualified key was produced from.
///
/// `<loop>_i<k>_s<step>` yields `<step>`; any other `_`-joined key yields
/// its last segment.
fn iteration_origin(key: &str) -> &str {
    let matched = ITERATION_STEP_SUFFIX
        .as_ref()
        .and_then(|re| re.captures(key))
        .and_then(|c| c.get(1));
    match matched {
        Some(step) => step.as_str(),
        None => key.rsplit('_').next().unwrap_or(key),
    }
}

// ---------------------------------------------------------------------------
// TaskInstance
// ---------------------------------------------------------------------------

/// One executed, skipped or pending task within a DagInstance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    pub id: Uuid,
    pub task_id: String,
    pub dag_ins_id: Uuid,
    #[serde(default)]
    pub name: String,
    pub action_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    pub status: TaskInstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    #[serde(default, skip_serializing_if = "PreChecks::is_empty")]
    pub pre_checks: PreChecks,
    /// Action output. For blocked tasks, the placeholder used to correlate a
    /// later resume call (e.g. an approval group id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Nanosecond timestamp of the last change, used for ordering views.
    #[serde(default)]
    pub last_modified_at: i64,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    /// A pending instance of `task`.
    pub fn from_task(dag_ins_id: Uuid, task: &Task) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_id: task.id.clone(),
            dag_ins_id,
            name: task.name.clone(),
            action_name: task.action_name.clone(),
            depend_on: task.depend_on.clone(),
            timeout_secs: task.timeout_secs,
            params: task.params.clone(),
            status: TaskInstanceStatus::Init,
            reason: None,
            pre_checks: task.pre_checks.clone(),
            results: None,
            steps: task.steps.clone(),
            last_modified_at: PENDING_SORT_KEY,
            metadata: TaskMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status` and stamp the modification time.
    pub fn transition(&mut self, status: TaskInstanceStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.last_modified_at = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    }
}

/// Sort key that places never-run tasks after every executed one.
pub const PENDING_SORT_KEY: i64 = i64::MAX;

/// Timing information attached to a task view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskMetadata {
    #[serde(default)]
    pub attempts: u32,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Milliseconds spent on the executor.
    #[serde(default)]
    pub duration: i64,
    /// Milliseconds from start to completion.
    #[serde(default)]
    pub elapsed_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskInstanceStatus {
    #[default]
    Init,
    Running,
    Success,
    Failed,
    Blocked,
    Skipped,
    Canceled,
    /// Transient status used during resume classification.
    Retrying,
}

impl TaskInstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskInstanceStatus::Init => "init",
            TaskInstanceStatus::Running => "running",
            TaskInstanceStatus::Success => "success",
            TaskInstanceStatus::Failed => "failed",
            TaskInstanceStatus::Blocked => "blocked",
            TaskInstanceStatus::Skipped => "skipped",
            TaskInstanceStatus::Canceled => "canceled",
            TaskInstanceStatus::Retrying => "retrying",
        }
    }

    /// Whether the task has moved past Blocked and will not change again.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskInstanceStatus::Success
                | TaskInstanceStatus::Failed
                | TaskInstanceStatus::Skipped
                | TaskInstanceStatus::Canceled
        )
    }
}

impl fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskInstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(TaskInstanceStatus::Init),
            "running" => Ok(TaskInstanceStatus::Running),
            "success" => Ok(TaskInstanceStatus::Success),
            "failed" => Ok(TaskInstanceStatus::Failed),
            "blocked" => Ok(TaskInstanceStatus::Blocked),
            "skipped" => Ok(TaskInstanceStatus::Skipped),
            "canceled" | "cancelled" => Ok(TaskInstanceStatus::Canceled),
            "retrying" => Ok(TaskInstanceStatus::Retrying),
            other => Err(format!("invalid task status: '{other}'")),
        }
    }
}
