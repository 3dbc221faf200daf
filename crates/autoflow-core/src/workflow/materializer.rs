//! Task result views.
//!
//! The observable list of task views for an instance is rebuilt on demand,
//! either by replaying the instance's event log or, when the instance does
//! not record events, by replaying its compiled task graph against the final
//! ShareData snapshot.
//!
//! Graph replay re-expands loops and branches inside loops with the id scheme
//! of [`super::expand`], since those tasks have no compiled identity.
//! Everything after an executed internal return is unreachable and is not
//! materialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use autoflow_types::config::MaterializerConfig;
use autoflow_types::dag::DagType;
use autoflow_types::event::{DagInstanceEvent, EventType};
use autoflow_types::instance::{
    task_key, DagInstance, TaskInstance, TaskInstanceStatus, TaskMetadata, PENDING_SORT_KEY,
};
use autoflow_types::operator;
use autoflow_types::step::{walk_steps, Step, StepKind};
use autoflow_types::task::{ActiveAction, PreChecks, Task};

use crate::error::FlowError;
use crate::repository::Store;

use super::cache::ViewCache;
use super::compiler::branch_checks;
use super::expand::{
    body_task_id, branch_task_id, iteration_task_id, loop_iterations, normalize_event_task_id,
    render_checks, render_params, LoopScope,
};
use super::expression::ExpressionResolver;
use super::precheck::{self, ConditionEnv};

// ---------------------------------------------------------------------------
// Materializer
// ---------------------------------------------------------------------------

pub struct Materializer<S> {
    store: Arc<S>,
    resolver: Arc<dyn ExpressionResolver>,
    cache: ViewCache,
}

impl<S: Store> Materializer<S> {
    pub fn new(
        store: Arc<S>,
        resolver: Arc<dyn ExpressionResolver>,
        config: &MaterializerConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            cache: ViewCache::new(Duration::from_secs(config.cache_ttl_secs)),
        }
    }

    /// Total number of views and the requested page of them.
    ///
    /// `limit = None` returns every view.
    pub async fn list_task_results(
        &self,
        dag_ins_id: &Uuid,
        page: u64,
        limit: Option<u64>,
    ) -> Result<(u64, Vec<TaskInstance>), FlowError> {
        let views = match self.cache.get(dag_ins_id) {
            Some(views) => views,
            None => {
                let views = self.materialize(dag_ins_id).await?;
                self.cache.insert(*dag_ins_id, views.clone());
                views
            }
        };
        Ok(paginate(views, page, limit))
    }

    /// Rebuild the views of an instance, bypassing the cache.
    pub async fn materialize(&self, dag_ins_id: &Uuid) -> Result<Vec<TaskInstance>, FlowError> {
        let instance = self
            .store
            .get_instance(dag_ins_id)
            .await?
            .ok_or_else(|| FlowError::not_found("instance", dag_ins_id))?;

        if instance.records_events() {
            let steps = match self.store.get_version(&instance.version_id).await? {
                Some(version) => version.steps,
                None => self.current_dag(&instance).await?.steps,
            };
            let events = self.store.list_events(dag_ins_id, &[]).await?;
            tracing::debug!(%dag_ins_id, events = events.len(), "replaying event log");
            return Ok(replay_events(&events, &instance, &steps, self.resolver.as_ref()));
        }

        let tasks = match self.store.get_version(&instance.version_id).await? {
            Some(version) => version.tasks,
            None => self.current_dag(&instance).await?.tasks,
        };
        tracing::debug!(%dag_ins_id, tasks = tasks.len(), "replaying task graph");
        Ok(replay_graph(&tasks, &instance, self.resolver.as_ref()))
    }

    async fn current_dag(
        &self,
        instance: &DagInstance,
    ) -> Result<autoflow_types::dag::Dag, FlowError> {
        tracing::warn!(
            dag_ins_id = %instance.id,
            version_id = %instance.version_id,
            "dag version missing, falling back to the current dag"
        );
        self.store
            .get_dag(&instance.dag_id)
            .await?
            .ok_or_else(|| FlowError::not_found("dag", instance.dag_id))
    }

    pub fn invalidate(&self, dag_ins_id: &Uuid) {
        self.cache.invalidate(dag_ins_id);
    }
}

/// Slice `[page * limit, (page + 1) * limit)` clamped to the list.
pub fn paginate<T>(mut items: Vec<T>, page: u64, limit: Option<u64>) -> (u64, Vec<T>) {
    let total = items.len() as u64;
    let Some(limit) = limit else {
        return (total, items);
    };
    let start = page.saturating_mul(limit).min(total) as usize;
    let end = page.saturating_add(1).saturating_mul(limit).min(total) as usize;
    (total, items.drain(start..end).collect())
}

// ---------------------------------------------------------------------------
// Event replay
// ---------------------------------------------------------------------------

/// Fold an event log into task views.
///
/// Consecutive status events of one task collapse into a single view. Views
/// keep the iteration-qualified id the event was written under; the step is
/// looked up by the id it normalizes to. Each view's parameters are resolved
/// against the variables written before it opened.
pub fn replay_events(
    events: &[DagInstanceEvent],
    instance: &DagInstance,
    steps: &[Step],
    resolver: &dyn ExpressionResolver,
) -> Vec<TaskInstance> {
    let mut step_map: HashMap<&str, &Step> = HashMap::new();
    walk_steps(steps, &mut |s| {
        step_map.insert(s.id.as_str(), s);
    });

    let mut env = Map::new();
    let mut views = Vec::new();
    let mut current: Option<TaskInstance> = None;

    for event in events {
        match event.event_type {
            EventType::Variable => {
                env.insert(event.name.clone(), event.data.clone());
            }
            EventType::TaskStatus => {
                let Ok(status) = event.status.parse::<TaskInstanceStatus>() else {
                    tracing::warn!(event_id = event.id, status = %event.status, "skipping event with unknown status");
                    continue;
                };

                if let Some(view) = current.as_mut().filter(|v| v.task_id == event.task_id) {
                    let at = micros_to_datetime(event.timestamp);
                    view.status = status;
                    view.updated_at = at;
                    view.last_modified_at = event.timestamp.saturating_mul(1000);
                    view.metadata.elapsed_time = event.timestamp / 1000 - view.metadata.started_at;
                    apply_outcome(view, status, event, &env);
                    continue;
                }
                views.extend(current.take());

                let at = micros_to_datetime(event.timestamp);
                let mut view = TaskInstance {
                    id: Uuid::from_u64_pair(0, event.id as u64),
                    task_id: event.task_id.clone(),
                    dag_ins_id: instance.id,
                    name: String::new(),
                    action_name: event.operator.clone(),
                    depend_on: Vec::new(),
                    timeout_secs: 0,
                    params: Map::new(),
                    status,
                    reason: None,
                    pre_checks: PreChecks::new(),
                    results: None,
                    steps: Vec::new(),
                    last_modified_at: event.timestamp.saturating_mul(1000),
                    metadata: TaskMetadata {
                        started_at: event.timestamp / 1000,
                        ..Default::default()
                    },
                    created_at: at,
                    updated_at: at,
                };
                let step_id = normalize_event_task_id(&event.task_id);
                if let Some(step) = step_map.get(step_id.as_str()) {
                    view.name = step.title.clone();
                    view.params = event_params(step, &env, resolver);
                }
                apply_outcome(&mut view, status, event, &env);
                current = Some(view);
            }
            EventType::Trace => {
                if let Some(view) = current.as_mut() {
                    merge_metadata(&mut view.metadata, &event.data);
                }
            }
        }
    }

    views.extend(current);
    views
}

fn event_params(step: &Step, env: &Map<String, Value>, resolver: &dyn ExpressionResolver) -> Map<String, Value> {
    let env = Value::Object(env.clone());
    match step.operator.as_str() {
        operator::INTERNAL_ASSIGN => {
            let target = step.parameters.get("target").cloned().unwrap_or(Value::Null);
            let value = step
                .parameters
                .get("value")
                .map(|raw| resolver.resolve(raw, &env).unwrap_or_else(|_| raw.clone()))
                .unwrap_or(Value::Null);
            let mut params = Map::new();
            params.insert("target".into(), target);
            params.insert("value".into(), value);
            params
        }
        operator::BRANCH => Map::new(),
        _ => resolver
            .resolve_map(&step.parameters, &env)
            .unwrap_or_else(|_| step.parameters.clone()),
    }
}

fn apply_outcome(
    view: &mut TaskInstance,
    status: TaskInstanceStatus,
    event: &DagInstanceEvent,
    env: &Map<String, Value>,
) {
    match status {
        TaskInstanceStatus::Success => {
            if let Some(result) = env.get(&task_key(&view.task_id)) {
                view.results = Some(result.clone());
            }
        }
        TaskInstanceStatus::Failed => view.reason = Some(event.data.clone()),
        _ => {}
    }
}

fn merge_metadata(metadata: &mut TaskMetadata, data: &Value) {
    let Value::Object(patch) = data else {
        return;
    };
    let Ok(Value::Object(mut merged)) = serde_json::to_value(&*metadata) else {
        return;
    };
    for (k, v) in patch {
        merged.insert(k.clone(), v.clone());
    }
    match serde_json::from_value(Value::Object(merged)) {
        Ok(m) => *metadata = m,
        Err(e) => tracing::warn!(error = %e, "ignoring malformed trace event"),
    }
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Graph replay
// ---------------------------------------------------------------------------

/// Synthesize task views from compiled tasks and the final ShareData.
///
/// Views are Success by convention unless their prechecks deactivate them.
/// Skipped views sort after every other view; the order is stable otherwise.
pub fn replay_graph(
    tasks: &[Task],
    instance: &DagInstance,
    resolver: &dyn ExpressionResolver,
) -> Vec<TaskInstance> {
    let ended_at = instance.ended_at.unwrap_or(instance.updated_at);
    let mut replay = GraphReplay {
        instance,
        env: instance.share_data.clone().into_value(),
        vars: Value::Object(instance.vars.clone()),
        resolver,
        ended_at,
        ended_ns: ended_at.timestamp_nanos_opt().unwrap_or(i64::MAX),
        views: Vec::new(),
    };

    for task in tasks {
        let flow = if task.action_name == operator::LOOP {
            replay.expand_loop(task)
        } else {
            let view = replay.view(ViewSpec::from_task(task), None, false);
            replay.push(view)
        };
        if flow == Flow::Return {
            break;
        }
    }

    let mut views = replay.views;
    views.sort_by_key(|v| v.last_modified_at);
    views
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Return,
}

struct ViewSpec<'s> {
    id: String,
    name: &'s str,
    action_name: &'s str,
    depend_on: Vec<String>,
    timeout_secs: u64,
    params: &'s Map<String, Value>,
    pre_checks: PreChecks,
}

impl<'s> ViewSpec<'s> {
    fn from_task(task: &'s Task) -> Self {
        Self {
            id: task.id.clone(),
            name: &task.name,
            action_name: &task.action_name,
            depend_on: task.depend_on.clone(),
            timeout_secs: task.timeout_secs,
            params: &task.params,
            pre_checks: task.pre_checks.clone(),
        }
    }

    fn from_step(id: String, step: &'s Step, pre_checks: PreChecks) -> Self {
        Self {
            id,
            name: &step.title,
            action_name: &step.operator,
            depend_on: Vec::new(),
            timeout_secs: 0,
            params: &step.parameters,
            pre_checks,
        }
    }
}

struct GraphReplay<'a> {
    instance: &'a DagInstance,
    env: Value,
    vars: Value,
    resolver: &'a dyn ExpressionResolver,
    ended_at: DateTime<Utc>,
    ended_ns: i64,
    views: Vec<TaskInstance>,
}

impl GraphReplay<'_> {
    fn push(&mut self, view: TaskInstance) -> Flow {
        let returned =
            view.action_name == operator::INTERNAL_RETURN && view.status != TaskInstanceStatus::Skipped;
        self.views.push(view);
        if returned {
            Flow::Return
        } else {
            Flow::Continue
        }
    }

    fn view(&self, spec: ViewSpec<'_>, scope: Option<&LoopScope>, skipped: bool) -> TaskInstance {
        let mut view = TaskInstance {
            id: Uuid::now_v7(),
            results: self.env.get(task_key(&spec.id)).cloned(),
            task_id: spec.id,
            dag_ins_id: self.instance.id,
            name: spec.name.to_string(),
            action_name: spec.action_name.to_string(),
            depend_on: spec.depend_on,
            timeout_secs: spec.timeout_secs,
            params: Map::new(),
            status: TaskInstanceStatus::Success,
            reason: None,
            pre_checks: spec.pre_checks,
            steps: Vec::new(),
            last_modified_at: self.ended_ns,
            metadata: TaskMetadata {
                started_at: self.instance.created_at.timestamp_millis(),
                ..Default::default()
            },
            created_at: self.instance.created_at,
            updated_at: self.ended_at,
        };

        let deactivated = if skipped {
            Some(ActiveAction::Skip)
        } else {
            self.deactivation(&view.pre_checks)
        };
        match deactivated {
            Some(ActiveAction::Skip) => {
                view.status = TaskInstanceStatus::Skipped;
                view.last_modified_at = PENDING_SORT_KEY;
            }
            Some(ActiveAction::Block) => view.status = TaskInstanceStatus::Blocked,
            None => {}
        }

        view.params = render_params(spec.params, scope, &self.env, self.resolver);
        if view.action_name == operator::INTERNAL_RETURN {
            view.results = Some(Value::Object(view.params.clone()));
            if self.instance.dag_type == DagType::ComboOperator {
                view.params = Map::new();
            }
        }
        view
    }

    fn deactivation(&self, pre_checks: &PreChecks) -> Option<ActiveAction> {
        let env = ConditionEnv {
            share_data: &self.env,
            vars: &self.vars,
        };
        precheck::evaluate(pre_checks, &env, self.resolver)
    }

    /// One header per iteration, each followed by the expanded body.
    fn expand_loop(&mut self, task: &Task) -> Flow {
        let header = self.view(ViewSpec::from_task(task), None, false);
        let (iterations, items) = loop_iterations(&header.params);
        let array_mode = header.params.get("mode").and_then(Value::as_str) == Some("array");

        let mut scope = LoopScope::new(task.id.clone(), items);
        let mut outputs: Option<Value> = None;
        for index in 0..iterations {
            scope.index = index;
            let mut spec = ViewSpec::from_task(task);
            spec.id = iteration_task_id(&task.id, index);
            let mut header = self.view(spec, None, false);

            if let Some(Value::Object(result)) = header.results.as_mut() {
                if outputs.is_none() {
                    outputs = result.get("outputs").filter(|v| !v.is_null()).cloned();
                }
                result.insert("index".into(), json!(index));
                if array_mode {
                    result.insert("value".into(), scope.value());
                }
                match &outputs {
                    Some(out) if index + 1 == iterations => {
                        result.insert("outputs".into(), out.clone());
                    }
                    _ => {
                        result.remove("outputs");
                    }
                }
            }
            self.views.push(header);

            if self.expand_body(&task.steps, &mut scope) == Flow::Return {
                return Flow::Return;
            }
        }
        Flow::Continue
    }

    fn expand_body(&mut self, steps: &[Step], scope: &mut LoopScope) -> Flow {
        for step in steps {
            let id = body_task_id(&scope.loop_task_id, scope.index, &step.id);
            let flow = match step.kind() {
                StepKind::Branch => self.expand_branch(id, step, scope, false),
                StepKind::Sequential | StepKind::Loop => {
                    let view = self.view(
                        ViewSpec::from_step(id, step, PreChecks::new()),
                        Some(&*scope),
                        false,
                    );
                    scope.step_map.insert(step.id.clone(), view.task_id.clone());
                    self.push(view)
                }
            };
            if flow == Flow::Return {
                return Flow::Return;
            }
        }
        Flow::Continue
    }

    /// A branch-control step inside a loop: its header, then every branch
    /// body step with the branch's conditions as prechecks.
    fn expand_branch(&mut self, header_id: String, step: &Step, scope: &mut LoopScope, skipped: bool) -> Flow {
        let mut header = self.view(
            ViewSpec::from_step(header_id.clone(), step, PreChecks::new()),
            None,
            skipped,
        );
        header.params.clear();
        self.views.push(header);

        for (branch_index, branch) in step.branches.iter().enumerate() {
            let checks = render_checks(
                branch_checks(&header_id, branch, &PreChecks::new()),
                scope,
                &self.env,
                self.resolver,
            );
            let branch_skipped = skipped || self.deactivation(&checks).is_some();

            for branch_step in &branch.steps {
                let id = branch_task_id(
                    self.instance.mode,
                    &header_id,
                    branch_index,
                    scope.index,
                    &branch_step.id,
                );
                let flow = match branch_step.kind() {
                    StepKind::Branch => self.expand_branch(id, branch_step, scope, branch_skipped),
                    StepKind::Sequential | StepKind::Loop => {
                        let view = self.view(
                            ViewSpec::from_step(id, branch_step, checks.clone()),
                            Some(&*scope),
                            skipped,
                        );
                        if !branch_step.is_return() {
                            scope.step_map.insert(branch_step.id.clone(), view.task_id.clone());
                        }
                        self.push(view)
                    }
                };
                if flow == Flow::Return {
                    return Flow::Return;
                }
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::repository::memory::MemoryStore;
    use crate::repository::{DagRepository, EventRepository, InstanceRepository};
    use crate::workflow::compiler::Compiler;
    use crate::workflow::cycle::SelfTriggerGuard;
    use crate::workflow::expression::TemplateResolver;
    use autoflow_types::config::EngineConfig;
    use autoflow_types::dag::Dag;
    use autoflow_types::instance::{DagInstanceStatus, EventPersistence, InstanceMode};

    fn compile(value: Value) -> (Vec<Step>, Vec<Task>) {
        let steps: Vec<Step> = serde_json::from_value(value).unwrap();
        let registry = ActionRegistry::new();
        let config = EngineConfig::default();
        let guard = SelfTriggerGuard::with_defaults();
        let graph = Compiler::new(&registry, &config, &guard).compile(&steps).unwrap();
        (steps, graph.tasks)
    }

    fn finished(dag: &Dag, share: Value) -> DagInstance {
        let mut ins = DagInstance::for_dag(dag);
        ins.status = DagInstanceStatus::Success;
        ins.share_data = serde_json::from_value(share).unwrap();
        ins.ended_at = Some(Utc::now());
        ins
    }

    fn branch_tree() -> Value {
        json!([
            {"id": "0", "operator": "@trigger/manual"},
            {
                "id": "1",
                "operator": "@control/flow/branches",
                "branches": [
                    {"conditions": [[{"operator": "@internal/cmp/number-eq",
                                      "parameters": {"a": "{{__0.x}}", "b": 1}}]],
                     "steps": [{"id": "A", "operator": "@test/a", "parameters": {"n": "{{__0.x}}"}}]},
                    {"conditions": [[{"operator": "@internal/cmp/number-neq",
                                      "parameters": {"a": "{{__0.x}}", "b": 1}}]],
                     "steps": [{"id": "B", "operator": "@test/b"}]}
                ]
            },
            {"id": "C", "operator": "@test/c"}
        ])
    }

    fn ids(views: &[TaskInstance]) -> Vec<&str> {
        views.iter().map(|v| v.task_id.as_str()).collect()
    }

    #[test]
    fn test_graph_replay_branch_scenario() {
        let (steps, tasks) = compile(branch_tree());
        let dag = Dag::new("branch", steps, tasks.clone());
        let ins = finished(&dag, json!({"__0": {"x": 1}, "__A": {"ok": true}, "__C": "done"}));

        let views = replay_graph(&tasks, &ins, &TemplateResolver::new());
        assert_eq!(ids(&views), vec!["0", "1", "A", "C", "B"]);
        assert_eq!(views[2].status, TaskInstanceStatus::Success);
        assert_eq!(views[2].params["n"], json!(1));
        assert_eq!(views[2].results, Some(json!({"ok": true})));
        assert_eq!(views[3].depend_on, vec!["1".to_string()]);
        assert_eq!(views[4].status, TaskInstanceStatus::Skipped);
    }

    #[test]
    fn test_graph_replay_limit_loop() {
        let (steps, tasks) = compile(json!([
            {"id": "0", "operator": "@trigger/manual"},
            {"id": "7", "operator": "@control/flow/loop",
             "parameters": {"mode": "limit", "limit": "3"},
             "steps": [
                {"id": "8", "operator": "@test/a", "parameters": {"i": "{{__7.index}}"}},
                {"id": "9", "operator": "@test/b", "parameters": {"prev": "{{__8.n}}"}}
             ]}
        ]));
        let dag = Dag::new("loop", steps, tasks.clone());
        let ins = finished(&dag, json!({
            "__7": {"outputs": {"total": 3}},
            "__7_i1": {},
            "__7_i2": {},
            "__7_i2_s8": {"n": "third"}
        }));

        let views = replay_graph(&tasks, &ins, &TemplateResolver::new());
        let headers: Vec<_> = views.iter().filter(|v| v.action_name == operator::LOOP).collect();
        assert_eq!(headers.len(), 3);
        assert_eq!(views.len(), 1 + 3 + 3 * 2);
        assert_eq!(ids(&views)[1..5], ["7", "7_i0_s8", "7_i0_s9", "7_i1"]);

        assert!(headers[0].results.as_ref().unwrap().get("outputs").is_none());
        assert!(headers[1].results.as_ref().unwrap().get("outputs").is_none());
        assert_eq!(headers[2].results.as_ref().unwrap()["outputs"], json!({"total": 3}));
        assert_eq!(headers[2].results.as_ref().unwrap()["index"], json!(2));

        let last_body = views.iter().find(|v| v.task_id == "7_i2_s9").unwrap();
        assert_eq!(last_body.params["prev"], json!("third"));
        let second = views.iter().find(|v| v.task_id == "7_i1_s8").unwrap();
        assert_eq!(second.params["i"], json!(1));
    }

    #[test]
    fn test_graph_replay_array_loop_with_branch() {
        let (steps, tasks) = compile(json!([
            {"id": "0", "operator": "@trigger/manual"},
            {"id": "7", "operator": "@control/flow/loop",
             "parameters": {"mode": "array", "array": "{{__0.docs}}"},
             "steps": [{
                "id": "8",
                "operator": "@control/flow/branches",
                "branches": [
                    {"conditions": [[{"operator": "@internal/cmp/string-eq",
                                      "parameters": {"a": "{{__7.value}}", "b": "keep"}}]],
                     "steps": [{"id": "9", "operator": "@test/a", "parameters": {"doc": "{{__7.value}}"}}]}
                ]
             }]}
        ]));
        let dag = Dag::new("loop", steps, tasks.clone());
        let ins = finished(&dag, json!({"__0": {"docs": ["keep", "drop"]}, "__7": {}}));

        let views = replay_graph(&tasks, &ins, &TemplateResolver::new());
        let first = views.iter().find(|v| v.task_id == "7_i0_s8_0_9").unwrap();
        assert_eq!(first.status, TaskInstanceStatus::Success);
        assert_eq!(first.params["doc"], json!("keep"));
        let second = views.iter().find(|v| v.task_id == "7_i1_s8_0_9").unwrap();
        assert_eq!(second.status, TaskInstanceStatus::Skipped);
        assert_eq!(views.last().unwrap().task_id, "7_i1_s8_0_9");
        assert_eq!(views[1].results, Some(json!({"index": 0, "value": "keep"})));

        let mut vm = ins.clone();
        vm.mode = InstanceMode::Vm;
        let views = replay_graph(&tasks, &vm, &TemplateResolver::new());
        assert!(views.iter().any(|v| v.task_id == "7_i1_s9"));
    }

    #[test]
    fn test_graph_replay_stops_at_return() {
        let (steps, tasks) = compile(json!([
            {"id": "0", "operator": "@trigger/manual"},
            {"id": "1", "operator": "@internal/return", "parameters": {"answer": "{{__0.x}}"}},
            {"id": "2", "operator": "@test/a"}
        ]));
        let mut dag = Dag::new("ret", steps, tasks.clone());
        let ins = finished(&dag, json!({"__0": {"x": 42}}));

        let views = replay_graph(&tasks, &ins, &TemplateResolver::new());
        assert_eq!(ids(&views), vec!["0", "1"]);
        assert_eq!(views[1].results, Some(json!({"answer": 42})));
        assert_eq!(views[1].params["answer"], json!(42));

        dag.dag_type = DagType::ComboOperator;
        let ins = finished(&dag, json!({"__0": {"x": 42}}));
        let views = replay_graph(&tasks, &ins, &TemplateResolver::new());
        assert!(views[1].params.is_empty());
        assert_eq!(views[1].results, Some(json!({"answer": 42})));
    }

    fn status(ins: &DagInstance, op: &str, id: &str, s: &str, ts: i64) -> DagInstanceEvent {
        DagInstanceEvent::task_status(ins.id, op, id, s, Value::Null, ts)
    }

    fn var(ins: &DagInstance, name: &str, data: Value, ts: i64) -> DagInstanceEvent {
        DagInstanceEvent::variable(ins.id, name, data, ts)
    }

    #[test]
    fn test_event_replay_collapses_status_changes() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"id": "0", "operator": "@trigger/manual"},
            {"id": "1", "operator": "@internal/assign",
             "parameters": {"target": "total", "value": "{{__0.x}}", "extra": 1}},
            {"id": "2", "operator": "@test/a", "parameters": {"v": "{{__1.value}}"}}
        ]))
        .unwrap();
        let dag = Dag::new("events", steps.clone(), vec![]);
        let ins = DagInstance::for_dag(&dag);

        let mut failed = status(&ins, "@test/a", "2", "failed", 4_000_000);
        failed.data = json!("boom");
        let events = vec![
            var(&ins, "__0", json!({"x": 5}), 1_000_000),
            status(&ins, "@trigger/manual", "0", "success", 1_000_000),
            status(&ins, "@internal/assign", "1", "running", 2_000_000),
            var(&ins, "__1", json!({"target": "total", "value": 5}), 2_500_000),
            status(&ins, "@internal/assign", "1", "success", 3_000_000),
            DagInstanceEvent::trace(ins.id, "__1_trace", json!({"duration": 7, "attempts": 1}), 3_000_000),
            status(&ins, "@test/a", "2", "running", 3_500_000),
            failed,
        ];

        let views = replay_events(&events, &ins, &steps, &TemplateResolver::new());
        assert_eq!(ids(&views), vec!["0", "1", "2"]);
        assert_eq!(views[0].results, Some(json!({"x": 5})));

        let assign = &views[1];
        assert_eq!(assign.status, TaskInstanceStatus::Success);
        assert_eq!(assign.params, serde_json::from_value::<Map<String, Value>>(json!({"target": "total", "value": 5})).unwrap());
        assert_eq!(assign.results, Some(json!({"target": "total", "value": 5})));
        assert_eq!(assign.metadata.elapsed_time, 1000);
        assert_eq!(assign.metadata.duration, 7);
        assert_eq!(assign.metadata.attempts, 1);

        let last = &views[2];
        assert_eq!(last.status, TaskInstanceStatus::Failed);
        assert_eq!(last.reason, Some(json!("boom")));
        assert_eq!(last.params["v"], json!(5));
    }

    #[test]
    fn test_event_and_graph_replay_agree() {
        let (steps, tasks) = compile(branch_tree());
        let dag = Dag::new("branch", steps.clone(), tasks.clone());
        let ins = finished(&dag, json!({"__0": {"x": 1}, "__A": {"ok": true}, "__C": "done"}));

        let events = vec![
            var(&ins, "__0", json!({"x": 1}), 1),
            status(&ins, "@trigger/manual", "0", "success", 1),
            status(&ins, operator::BRANCH, "1", "success", 2),
            var(&ins, "__A", json!({"ok": true}), 3),
            status(&ins, "@test/a", "A", "success", 3),
            var(&ins, "__C", json!("done"), 4),
            status(&ins, "@test/c", "C", "success", 4),
        ];
        let from_events = replay_events(&events, &ins, &steps, &TemplateResolver::new());
        let from_graph: Vec<_> = replay_graph(&tasks, &ins, &TemplateResolver::new())
            .into_iter()
            .filter(|v| v.status != TaskInstanceStatus::Skipped)
            .collect();

        assert_eq!(ids(&from_events), ids(&from_graph));
        let results = |views: &[TaskInstance]| views.iter().map(|v| v.results.clone()).collect::<Vec<_>>();
        assert_eq!(results(&from_events), results(&from_graph));
    }

    #[test]
    fn test_event_and_graph_replay_agree_on_loops() {
        let (steps, tasks) = compile(json!([
            {"id": "0", "operator": "@trigger/manual"},
            {"id": "7", "operator": "@control/flow/loop",
             "parameters": {"mode": "array", "array": [1, 2]},
             "steps": [{"id": "8", "operator": "@test/a", "title": "Fetch"}]}
        ]));
        let dag = Dag::new("loop", steps.clone(), tasks.clone());
        let ins = finished(&dag, json!({
            "__0": {},
            "__7": {"index": 0, "value": 1},
            "__7_i0_s8": {"n": 1},
            "__7_i1": {"index": 1, "value": 2},
            "__7_i1_s8": {"n": 2},
            "__8": {"n": 2}
        }));

        let events = vec![
            var(&ins, "__0", json!({}), 1),
            status(&ins, "@trigger/manual", "0", "success", 1),
            var(&ins, "__7", json!({"index": 0, "value": 1}), 2),
            status(&ins, operator::LOOP, "7", "success", 2),
            status(&ins, "@test/a", "7_i0_s8", "running", 3),
            var(&ins, "__8", json!({"n": 1}), 4),
            var(&ins, "__7_i0_s8", json!({"n": 1}), 4),
            status(&ins, "@test/a", "7_i0_s8", "success", 4),
            var(&ins, "__7_i1", json!({"index": 1, "value": 2}), 5),
            status(&ins, operator::LOOP, "7_i1", "success", 5),
            status(&ins, "@test/a", "7_i1_s8", "running", 6),
            var(&ins, "__8", json!({"n": 2}), 7),
            var(&ins, "__7_i1_s8", json!({"n": 2}), 7),
            status(&ins, "@test/a", "7_i1_s8", "success", 7),
        ];
        let from_events = replay_events(&events, &ins, &steps, &TemplateResolver::new());
        let from_graph: Vec<_> = replay_graph(&tasks, &ins, &TemplateResolver::new())
            .into_iter()
            .filter(|v| v.status != TaskInstanceStatus::Skipped)
            .collect();

        assert_eq!(ids(&from_events), vec!["0", "7", "7_i0_s8", "7_i1", "7_i1_s8"]);
        assert_eq!(ids(&from_events), ids(&from_graph));
        assert_eq!(from_events[2].name, "Fetch");
        assert_eq!(from_events[2].results, Some(json!({"n": 1})));
        assert_eq!(from_events[4].results, from_graph[4].results);
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (0..5).collect();
        assert_eq!(paginate(items.clone(), 0, None), (5, items.clone()));
        assert_eq!(paginate(items.clone(), 1, Some(2)), (5, vec![2, 3]));
        assert_eq!(paginate(items.clone(), 2, Some(2)), (5, vec![4]));
        assert_eq!(paginate(items, 9, Some(2)), (5, vec![]));
    }

    #[tokio::test]
    async fn test_list_task_results_uses_store_and_cache() {
        let store = Arc::new(MemoryStore::new());
        let (steps, tasks) = compile(branch_tree());
        let dag = Dag::new("branch", steps, tasks);
        store.create_dag(&dag).await.unwrap();
        store.create_version(&dag.snapshot()).await.unwrap();

        let mut ins = finished(&dag, json!({"__0": {"x": 2}}));
        ins.event_persistence = EventPersistence::Sql;
        store.create_instance(&ins).await.unwrap();
        store
            .append_events(&[
                var(&ins, "__0", json!({"x": 2}), 1),
                status(&ins, "@trigger/manual", "0", "success", 1),
                status(&ins, operator::BRANCH, "1", "success", 2),
                status(&ins, "@test/b", "B", "success", 3),
            ])
            .await
            .unwrap();

        let materializer = Materializer::new(
            store.clone(),
            Arc::new(TemplateResolver::new()),
            &MaterializerConfig::default(),
        );
        let (total, page) = materializer.list_task_results(&ins.id, 0, Some(2)).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(ids(&page), vec!["0", "1"]);

        store
            .append_events(&[status(&ins, "@test/c", "C", "success", 4)])
            .await
            .unwrap();
        let (cached_total, _) = materializer.list_task_results(&ins.id, 0, None).await.unwrap();
        assert_eq!(cached_total, 3);

        materializer.invalidate(&ins.id);
        let (total, all) = materializer.list_task_results(&ins.id, 0, None).await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(all.last().unwrap().task_id, "C");
    }

    #[tokio::test]
    async fn test_missing_instance_is_not_found() {
        let materializer = Materializer::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TemplateResolver::new()),
            &MaterializerConfig::default(),
        );
        let err = materializer.materialize(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, FlowError::NotFound { kind: "instance", .. }));
    }
}
