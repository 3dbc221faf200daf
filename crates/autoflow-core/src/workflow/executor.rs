//! Reference executor.
//!
//! Walks the compiled tasks of an instance's version in order, one at a time:
//!
//! 1. Load the instance (must be `Init` or `Scheduled`) and its version.
//! 2. Consume any one-shot resume payload and mark the instance `Running`.
//! 3. Create the task rows that do not exist yet. Rows that already settled
//!    are kept, so re-executing a resumed instance continues where it stopped.
//! 4. For each task: evaluate prechecks, run it, write its result to
//!    ShareData and persist the row, the instance and any events.
//! 5. Stop at the first blocked, failed, canceled or returning task.
//!
//! Loops and branches inside loops have no compiled rows. They run inline and
//! are only visible through ShareData and the event log, under the ids
//! produced by [`super::expand`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use autoflow_types::config::EngineConfig;
use autoflow_types::event::DagInstanceEvent;
use autoflow_types::instance::{
    DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus, TaskMetadata,
};
use autoflow_types::operator;
use autoflow_types::step::{Step, StepKind, StepSettings};
use autoflow_types::task::{ActiveAction, PreChecks, Task};

use crate::action::{ActionContext, ActionError, ActionOutcome, ActionRegistry};
use crate::error::{FlowError, StateError};
use crate::repository::{Store, TaskFilter};

use super::compiler::{branch_checks, effective_settings, task_timeout};
use super::expand::{
    body_task_id, branch_task_id, iteration_task_id, loop_iterations, render_checks,
    render_params, LoopScope,
};
use super::expression::ExpressionResolver;
use super::precheck::{self, ConditionEnv};

// ---------------------------------------------------------------------------
// Internal outcomes
// ---------------------------------------------------------------------------

/// How the walk continues after a top-level task.
#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Continue,
    Return,
    Blocked,
    Failed(String),
    Canceled,
}

/// Result of one executable unit: a top-level task or a loop body step.
#[derive(Debug)]
enum UnitResult {
    Completed(Value),
    Returned(Value),
    Blocked(Value),
    Failed(String),
    Canceled,
}

/// How a loop body continues after a step.
#[derive(Debug, Clone, PartialEq)]
enum BodyFlow {
    Continue,
    Return,
    Failed(String),
    Canceled,
}

/// One thing to run, with its parameters already rendered.
struct Unit<'u> {
    id: String,
    action_name: &'u str,
    params: Map<String, Value>,
    settings: Option<&'u StepSettings>,
    timeout_secs: u64,
}

/// Mutable state of one execution.
struct Run {
    instance: DagInstance,
    token: CancellationToken,
    events: Vec<DagInstanceEvent>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor<S> {
    store: Arc<S>,
    registry: Arc<ActionRegistry>,
    resolver: Arc<dyn ExpressionResolver>,
    config: EngineConfig,
    /// Cancellation tokens keyed by instance id, present while executing.
    tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: Store> Executor<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<ActionRegistry>,
        resolver: Arc<dyn ExpressionResolver>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            config,
            tokens: DashMap::new(),
        }
    }

    /// Signal a running execution to stop. Returns whether one was running.
    pub fn cancel(&self, dag_ins_id: &Uuid) -> bool {
        match self.tokens.get(dag_ins_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(%dag_ins_id, "execution cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, dag_ins_id: &Uuid) -> bool {
        self.tokens.contains_key(dag_ins_id)
    }

    /// Run an instance until it finishes, blocks or is canceled.
    pub async fn execute(&self, dag_ins_id: &Uuid) -> Result<DagInstanceStatus, FlowError> {
        let mut instance = self
            .store
            .get_instance(dag_ins_id)
            .await?
            .ok_or_else(|| FlowError::not_found("instance", dag_ins_id))?;
        if !matches!(
            instance.status,
            DagInstanceStatus::Init | DagInstanceStatus::Scheduled
        ) {
            return Err(StateError::NotExecutable {
                id: instance.id,
                status: instance.status,
            }
            .into());
        }
        let version = self
            .store
            .get_version(&instance.version_id)
            .await?
            .ok_or_else(|| FlowError::not_found("dag version", instance.version_id))?;

        // Resume has already written the result to the task row and ShareData.
        // The payload only marks this run as a VM re-entry and is cleared here.
        if let Some((status, data)) = instance.take_resume() {
            tracing::info!(
                %dag_ins_id,
                resume_status = %status,
                has_data = data.is_some(),
                "consumed resume payload"
            );
        }
        instance.status = DagInstanceStatus::Running;
        instance.updated_at = Utc::now();
        self.store.update_instance(&instance).await?;

        let mut task_instances = self.prepare_tasks(&instance, &version.tasks).await?;

        let token = CancellationToken::new();
        self.tokens.insert(instance.id, token.clone());
        tracing::info!(
            %dag_ins_id,
            dag_id = %instance.dag_id,
            tasks = version.tasks.len(),
            "executing instance"
        );

        let start = Instant::now();
        let mut run = Run {
            instance,
            token,
            events: Vec::new(),
        };
        let walked = self.walk(&mut run, &version.tasks, &mut task_instances).await;
        self.tokens.remove(dag_ins_id);

        let outcome = match walked {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%dag_ins_id, error = %e, "execution aborted");
                run.instance.status = DagInstanceStatus::Failed;
                run.instance.reason = Some(e.to_string());
                run.instance.ended_at = Some(Utc::now());
                if let Err(save_err) = self.store.update_instance(&run.instance).await {
                    tracing::warn!(%dag_ins_id, error = %save_err, "failed to record aborted execution");
                }
                return Err(e);
            }
        };

        let status = self.finish(run, outcome).await?;
        tracing::info!(
            %dag_ins_id,
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "execution finished"
        );
        Ok(status)
    }

    /// Existing rows in compiled order, creating the missing ones.
    async fn prepare_tasks(
        &self,
        instance: &DagInstance,
        tasks: &[Task],
    ) -> Result<Vec<TaskInstance>, FlowError> {
        let mut existing = self
            .store
            .list_tasks(&TaskFilter::for_instance(instance.id))
            .await?;

        let mut created = Vec::new();
        let mut ordered = Vec::with_capacity(tasks.len());
        for task in tasks {
            match existing.iter().position(|t| t.task_id == task.id) {
                Some(pos) => ordered.push(existing.swap_remove(pos)),
                None => {
                    let ti = TaskInstance::from_task(instance.id, task);
                    created.push(ti.clone());
                    ordered.push(ti);
                }
            }
        }
        if !created.is_empty() {
            self.store.save_tasks(&created).await?;
        }
        Ok(ordered)
    }

    async fn walk(
        &self,
        run: &mut Run,
        tasks: &[Task],
        task_instances: &mut [TaskInstance],
    ) -> Result<Outcome, FlowError> {
        for (task, ti) in tasks.iter().zip(task_instances.iter_mut()) {
            if run.token.is_cancelled() {
                return Ok(Outcome::Canceled);
            }
            let outcome = match ti.status {
                TaskInstanceStatus::Success | TaskInstanceStatus::Skipped => continue,
                TaskInstanceStatus::Failed => Outcome::Failed(reason_text(ti.reason.as_ref())),
                TaskInstanceStatus::Canceled => Outcome::Canceled,
                TaskInstanceStatus::Blocked => Outcome::Blocked,
                TaskInstanceStatus::Init
                | TaskInstanceStatus::Running
                | TaskInstanceStatus::Retrying => {
                    let outcome = self.run_task(run, task, ti).await?;
                    self.store.update_task(ti).await?;
                    self.flush(run).await?;
                    outcome
                }
            };
            if outcome != Outcome::Continue {
                return Ok(outcome);
            }
        }
        Ok(Outcome::Continue)
    }

    async fn run_task(
        &self,
        run: &mut Run,
        task: &Task,
        ti: &mut TaskInstance,
    ) -> Result<Outcome, FlowError> {
        match self.deactivation(&run.instance, &ti.pre_checks) {
            Some(ActiveAction::Skip) => {
                tracing::debug!(dag_ins_id = %run.instance.id, task_id = %ti.task_id, "task skipped");
                ti.transition(TaskInstanceStatus::Skipped);
                return Ok(Outcome::Continue);
            }
            Some(ActiveAction::Block) => {
                tracing::info!(dag_ins_id = %run.instance.id, task_id = %ti.task_id, "task blocked by precheck");
                ti.transition(TaskInstanceStatus::Blocked);
                self.emit_status(run, &ti.task_id, &ti.action_name, TaskInstanceStatus::Blocked, Value::Null);
                return Ok(Outcome::Blocked);
            }
            None => {}
        }

        match task.action_name.as_str() {
            operator::BRANCH => {
                ti.transition(TaskInstanceStatus::Success);
                self.emit_status(run, &ti.task_id, &ti.action_name, TaskInstanceStatus::Success, Value::Null);
                Ok(Outcome::Continue)
            }
            operator::LOOP => {
                ti.transition(TaskInstanceStatus::Running);
                self.store.update_task(ti).await?;
                Ok(self.run_loop(run, task, ti).await)
            }
            _ => {
                let params = self.render(&run.instance, &task.params, None);
                ti.params = params.clone();
                ti.transition(TaskInstanceStatus::Running);
                self.store.update_task(ti).await?;

                let unit = Unit {
                    id: task.id.clone(),
                    action_name: &task.action_name,
                    params,
                    settings: task.settings.as_ref(),
                    timeout_secs: task.timeout_secs,
                };
                let result = self.run_unit(run, &unit, &mut ti.metadata).await;
                Ok(settle(ti, result))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    /// Run one unit and record its result in ShareData and the event log.
    async fn run_unit(
        &self,
        run: &mut Run,
        unit: &Unit<'_>,
        metadata: &mut TaskMetadata,
    ) -> UnitResult {
        self.emit_status(run, &unit.id, unit.action_name, TaskInstanceStatus::Running, Value::Null);

        let result = match unit.action_name {
            operator::INTERNAL_RETURN => UnitResult::Returned(Value::Object(unit.params.clone())),
            operator::INTERNAL_ASSIGN => {
                let target = unit.params.get("target").cloned().unwrap_or(Value::Null);
                let value = unit.params.get("value").cloned().unwrap_or(Value::Null);
                if let Some(name) = target.as_str().filter(|s| !s.is_empty()) {
                    run.instance.vars.insert(name.to_string(), value.clone());
                }
                UnitResult::Completed(json!({"target": target, "value": value}))
            }
            name if operator::is_trigger(name) => {
                UnitResult::Completed(Value::Object(run.instance.vars.clone()))
            }
            _ => self.dispatch(run, unit, metadata).await,
        };

        match &result {
            UnitResult::Completed(value) | UnitResult::Returned(value) => {
                self.write_result(run, &unit.id, value.clone());
                self.emit_status(run, &unit.id, unit.action_name, TaskInstanceStatus::Success, Value::Null);
            }
            UnitResult::Blocked(placeholder) => {
                self.emit_status(run, &unit.id, unit.action_name, TaskInstanceStatus::Blocked, placeholder.clone());
            }
            UnitResult::Failed(reason) => {
                tracing::warn!(dag_ins_id = %run.instance.id, task_id = %unit.id, reason = %reason, "task failed");
                self.emit_status(run, &unit.id, unit.action_name, TaskInstanceStatus::Failed, json!(reason));
            }
            UnitResult::Canceled => {
                self.emit_status(run, &unit.id, unit.action_name, TaskInstanceStatus::Canceled, Value::Null);
            }
        }
        result
    }

    /// Hand a unit to its registered action, under the watchdog timeout and
    /// the instance's cancellation token, retrying per its settings.
    async fn dispatch(
        &self,
        run: &mut Run,
        unit: &Unit<'_>,
        metadata: &mut TaskMetadata,
    ) -> UnitResult {
        let Some(action) = self.registry.get(unit.action_name) else {
            return UnitResult::Failed(ActionError::NotFound(unit.action_name.to_string()).to_string());
        };

        let ctx = ActionContext {
            dag_ins_id: run.instance.id,
            task_id: unit.id.clone(),
            share_data: run.instance.share_data.as_map().clone(),
            vars: run.instance.vars.clone(),
        };
        let retry = unit.settings.and_then(|s| s.retry.as_ref());
        let max_attempts = retry.map_or(1, |r| r.max.saturating_add(1));
        let delay = Duration::from_secs(retry.map_or(0, |r| r.delay));
        let timeout_secs = if unit.timeout_secs == 0 {
            self.config.default_task_timeout_secs + self.config.watchdog_margin_secs
        } else {
            unit.timeout_secs
        };
        let token = run.token.clone();

        let started_at = Utc::now().timestamp_millis();
        metadata.started_at = started_at;
        let clock = Instant::now();
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            metadata.attempts = attempt;
            let result = tokio::select! {
                _ = token.cancelled() => Err(ActionError::Canceled),
                r = tokio::time::timeout(
                    Duration::from_secs(timeout_secs),
                    action.run(&ctx, &unit.params),
                ) => r.unwrap_or(Err(ActionError::Timeout(timeout_secs))),
            };
            match result {
                Err(e) if attempt < max_attempts && !matches!(e, ActionError::Canceled) => {
                    tracing::warn!(
                        dag_ins_id = %ctx.dag_ins_id,
                        task_id = %unit.id,
                        attempt,
                        error = %e,
                        "action failed, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break Err(ActionError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => break other,
            }
        };

        let ended_at = Utc::now().timestamp_millis();
        metadata.ended_at = Some(ended_at);
        metadata.duration = clock.elapsed().as_millis() as i64;
        metadata.elapsed_time = ended_at - started_at;
        self.emit_trace(run, &unit.id, metadata);

        match outcome {
            Ok(ActionOutcome::Completed(value)) => UnitResult::Completed(value),
            Ok(ActionOutcome::Blocked(placeholder)) => UnitResult::Blocked(placeholder),
            Err(ActionError::Canceled) => UnitResult::Canceled,
            Err(e) => UnitResult::Failed(e.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    async fn run_loop(&self, run: &mut Run, task: &Task, ti: &mut TaskInstance) -> Outcome {
        let params = self.render(&run.instance, &task.params, None);
        let (iterations, items) = loop_iterations(&params);
        let array_mode = params.get("mode").and_then(Value::as_str) == Some("array");
        ti.params = params;

        let outputs = loop_outputs(task.params.get("outputs"));
        let mut collected: Map<String, Value> = Map::new();
        let mut scope = LoopScope::new(task.id.clone(), items);

        tracing::debug!(dag_ins_id = %run.instance.id, task_id = %task.id, iterations, "running loop");
        let mut returned = false;
        for index in 0..iterations {
            if run.token.is_cancelled() {
                ti.transition(TaskInstanceStatus::Canceled);
                return Outcome::Canceled;
            }
            scope.index = index;
            let header_id = iteration_task_id(&task.id, index);
            let mut header = json!({"index": index});
            if array_mode {
                header["value"] = scope.value();
            }
            self.write_result(run, &header_id, header);
            self.emit_status(run, &header_id, &task.action_name, TaskInstanceStatus::Success, Value::Null);

            match self.run_body(run, &task.steps, &mut scope).await {
                BodyFlow::Continue => {}
                BodyFlow::Return => returned = true,
                BodyFlow::Failed(reason) => {
                    ti.reason = Some(json!(reason));
                    ti.transition(TaskInstanceStatus::Failed);
                    return Outcome::Failed(reason);
                }
                BodyFlow::Canceled => {
                    ti.transition(TaskInstanceStatus::Canceled);
                    return Outcome::Canceled;
                }
            }

            for (key, template) in &outputs {
                let value = self.render_value(&run.instance, template, &scope);
                let slot = collected
                    .entry(key.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(values) = slot {
                    values.push(value);
                }
            }
            if returned {
                break;
            }
        }

        let mut result = match run.instance.share_data.task_result(&task.id) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if !outputs.is_empty() {
            result.insert("outputs".into(), Value::Object(collected));
        }
        let result = Value::Object(result);
        self.write_result(run, &task.id, result.clone());
        ti.results = Some(result);
        ti.transition(TaskInstanceStatus::Success);
        if returned {
            Outcome::Return
        } else {
            Outcome::Continue
        }
    }

    async fn run_body(&self, run: &mut Run, steps: &[Step], scope: &mut LoopScope) -> BodyFlow {
        for step in steps {
            if run.token.is_cancelled() {
                return BodyFlow::Canceled;
            }
            let id = body_task_id(&scope.loop_task_id, scope.index, &step.id);
            let flow = match step.kind() {
                StepKind::Branch => self.run_branch(run, id, step, scope, false).await,
                StepKind::Loop => BodyFlow::Failed(format!("nested loop '{}' is not supported", step.id)),
                StepKind::Sequential => self.run_body_step(run, id, step, scope).await,
            };
            if flow != BodyFlow::Continue {
                return flow;
            }
        }
        BodyFlow::Continue
    }

    /// Run a branch-control step inside a loop body. Branch bodies whose
    /// conditions do not hold are not run at all.
    fn run_branch<'a>(
        &'a self,
        run: &'a mut Run,
        header_id: String,
        step: &'a Step,
        scope: &'a mut LoopScope,
        skipped: bool,
    ) -> BoxFuture<'a, BodyFlow> {
        Box::pin(async move {
            if !skipped {
                self.emit_status(run, &header_id, &step.operator, TaskInstanceStatus::Success, Value::Null);
            }
            for (branch_index, branch) in step.branches.iter().enumerate() {
                let env = environment(&run.instance);
                let checks = render_checks(
                    branch_checks(&header_id, branch, &PreChecks::new()),
                    scope,
                    &env,
                    self.resolver.as_ref(),
                );
                let branch_skipped = skipped || self.deactivation(&run.instance, &checks).is_some();

                for branch_step in &branch.steps {
                    let id = branch_task_id(
                        run.instance.mode,
                        &header_id,
                        branch_index,
                        scope.index,
                        &branch_step.id,
                    );
                    let flow = match branch_step.kind() {
                        StepKind::Branch => {
                            self.run_branch(run, id, branch_step, scope, branch_skipped).await
                        }
                        _ if branch_skipped => continue,
                        StepKind::Loop => BodyFlow::Failed(format!(
                            "nested loop '{}' is not supported",
                            branch_step.id
                        )),
                        StepKind::Sequential => self.run_body_step(run, id, branch_step, scope).await,
                    };
                    if flow != BodyFlow::Continue {
                        return flow;
                    }
                }
            }
            BodyFlow::Continue
        })
    }

    async fn run_body_step(
        &self,
        run: &mut Run,
        id: String,
        step: &Step,
        scope: &mut LoopScope,
    ) -> BodyFlow {
        let params = self.render(&run.instance, &step.parameters, Some(&*scope));
        let unit = Unit {
            id,
            action_name: &step.operator,
            params,
            settings: effective_settings(step),
            timeout_secs: task_timeout(step, &self.registry, &self.config),
        };
        let mut metadata = TaskMetadata::default();
        let result = self.run_unit(run, &unit, &mut metadata).await;
        if !step.is_return() {
            scope.step_map.insert(step.id.clone(), unit.id.clone());
        }
        match result {
            UnitResult::Completed(_) => BodyFlow::Continue,
            UnitResult::Returned(_) => BodyFlow::Return,
            UnitResult::Blocked(_) => {
                BodyFlow::Failed(format!("step '{}' cannot block inside a loop", step.id))
            }
            UnitResult::Failed(reason) => BodyFlow::Failed(reason),
            UnitResult::Canceled => BodyFlow::Canceled,
        }
    }

    // -----------------------------------------------------------------------
    // Environment and persistence
    // -----------------------------------------------------------------------

    fn deactivation(&self, instance: &DagInstance, pre_checks: &PreChecks) -> Option<ActiveAction> {
        if pre_checks.is_empty() {
            return None;
        }
        let share_data = Value::Object(instance.share_data.as_map().clone());
        let vars = Value::Object(instance.vars.clone());
        let env = ConditionEnv {
            share_data: &share_data,
            vars: &vars,
        };
        precheck::evaluate(pre_checks, &env, self.resolver.as_ref())
    }

    fn render(
        &self,
        instance: &DagInstance,
        params: &Map<String, Value>,
        scope: Option<&LoopScope>,
    ) -> Map<String, Value> {
        render_params(params, scope, &environment(instance), self.resolver.as_ref())
    }

    fn render_value(&self, instance: &DagInstance, template: &Value, scope: &LoopScope) -> Value {
        let mut wrapper = Map::new();
        wrapper.insert("v".into(), template.clone());
        self.render(instance, &wrapper, Some(scope))
            .remove("v")
            .unwrap_or(Value::Null)
    }

    fn write_result(&self, run: &mut Run, task_id: &str, value: Value) {
        let written = run.instance.share_data.set(task_id, value);
        if run.instance.records_events() {
            let now = now_micros();
            for (name, data) in written {
                run.events
                    .push(DagInstanceEvent::variable(run.instance.id, &name, data, now));
            }
        }
    }

    fn emit_status(
        &self,
        run: &mut Run,
        task_id: &str,
        action_name: &str,
        status: TaskInstanceStatus,
        data: Value,
    ) {
        if !run.instance.records_events() {
            return;
        }
        run.events.push(DagInstanceEvent::task_status(
            run.instance.id,
            action_name,
            task_id,
            status.as_str(),
            data,
            now_micros(),
        ));
    }

    fn emit_trace(&self, run: &mut Run, task_id: &str, metadata: &TaskMetadata) {
        if !run.instance.records_events() {
            return;
        }
        let data = match serde_json::to_value(metadata) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "failed to encode trace");
                return;
            }
        };
        run.events.push(DagInstanceEvent::trace(
            run.instance.id,
            &format!("__{task_id}_trace"),
            data,
            now_micros(),
        ));
    }

    /// Persist the instance and pending events.
    async fn flush(&self, run: &mut Run) -> Result<(), FlowError> {
        run.instance.updated_at = Utc::now();
        self.store.update_instance(&run.instance).await?;
        if !run.events.is_empty() {
            let events = std::mem::take(&mut run.events);
            self.store.append_events(&events).await?;
        }
        Ok(())
    }

    async fn finish(&self, mut run: Run, outcome: Outcome) -> Result<DagInstanceStatus, FlowError> {
        let status = match outcome {
            Outcome::Continue | Outcome::Return => DagInstanceStatus::Success,
            Outcome::Blocked => DagInstanceStatus::Blocked,
            Outcome::Failed(reason) => {
                run.instance.reason = Some(reason);
                DagInstanceStatus::Failed
            }
            Outcome::Canceled => DagInstanceStatus::Canceled,
        };
        let now = Utc::now();
        run.instance.status = status;
        if status.is_terminal() {
            run.instance.ended_at = Some(now);
        }
        self.flush(&mut run).await?;
        Ok(status)
    }
}

/// Apply a unit result to a top-level task row.
fn settle(ti: &mut TaskInstance, result: UnitResult) -> Outcome {
    match result {
        UnitResult::Completed(value) => {
            ti.results = Some(value);
            ti.transition(TaskInstanceStatus::Success);
            Outcome::Continue
        }
        UnitResult::Returned(value) => {
            ti.results = Some(value);
            ti.transition(TaskInstanceStatus::Success);
            Outcome::Return
        }
        UnitResult::Blocked(placeholder) => {
            ti.results = Some(placeholder);
            ti.transition(TaskInstanceStatus::Blocked);
            Outcome::Blocked
        }
        UnitResult::Failed(reason) => {
            ti.reason = Some(json!(reason));
            ti.transition(TaskInstanceStatus::Failed);
            Outcome::Failed(reason)
        }
        UnitResult::Canceled => {
            ti.transition(TaskInstanceStatus::Canceled);
            Outcome::Canceled
        }
    }
}

/// Variables merged with ShareData, ShareData winning.
fn environment(instance: &DagInstance) -> Value {
    let mut env = instance.vars.clone();
    for (k, v) in instance.share_data.as_map() {
        env.insert(k.clone(), v.clone());
    }
    Value::Object(env)
}

/// `[{key, value}]` output declarations of a loop.
fn loop_outputs(raw: Option<&Value>) -> Vec<(String, Value)> {
    raw.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let key = item.get("key")?.as_str()?;
                    Some((key.to_string(), item.get("value").cloned().unwrap_or(Value::Null)))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn reason_text(reason: Option<&Value>) -> String {
    match reason {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "task failed".to_string(),
    }
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::action::builtin::ApprovalAction;
    use crate::repository::memory::MemoryStore;
    use crate::repository::{DagRepository, EventRepository, InstanceRepository};
    use crate::workflow::compiler::Compiler;
    use crate::workflow::cycle::SelfTriggerGuard;
    use crate::workflow::expression::TemplateResolver;
    use crate::workflow::materializer::{replay_events, replay_graph};
    use autoflow_types::dag::Dag;
    use autoflow_types::instance::{EventPersistence, InstanceMode};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Completes with its parameters.
    struct Echo(&'static str);

    impl Action for Echo {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(
            &self,
            _ctx: &ActionContext,
            params: &Map<String, Value>,
        ) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::Completed(Value::Object(params.clone())))
        }
    }

    /// Fails until it has been called `succeed_on` times.
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    impl Action for Flaky {
        fn name(&self) -> &str {
            "@test/flaky"
        }

        async fn run(
            &self,
            _ctx: &ActionContext,
            _params: &Map<String, Value>,
        ) -> Result<ActionOutcome, ActionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(ActionOutcome::Completed(json!({"calls": n})))
            } else {
                Err(ActionError::Failed(format!("attempt {n}")))
            }
        }
    }

    struct Slow;

    impl Action for Slow {
        fn name(&self) -> &str {
            "@test/slow"
        }

        async fn run(
            &self,
            _ctx: &ActionContext,
            _params: &Map<String, Value>,
        ) -> Result<ActionOutcome, ActionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ActionOutcome::Completed(Value::Null))
        }
    }

    struct Harness {
        config: EngineConfig,
        store: Arc<MemoryStore>,
        executor: Executor<MemoryStore>,
        calls: Arc<AtomicU32>,
    }

    fn harness(config: EngineConfig) -> Harness {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ActionRegistry::new();
        for name in ["@test/a", "@test/b", "@test/c"] {
            registry.register(Echo(name));
        }
        registry.register(Flaky {
            calls: calls.clone(),
            succeed_on: 3,
        });
        registry.register(Slow);
        registry.register(ApprovalAction);

        let store = Arc::new(MemoryStore::new());
        let executor = Executor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(TemplateResolver::new()),
            config.clone(),
        );
        Harness {
            config,
            store,
            executor,
            calls,
        }
    }

    impl Harness {
        /// Compile `steps`, persist the dag and a fresh instance with `vars`.
        async fn instance(&self, steps: Value, vars: Value, events: bool) -> (Dag, DagInstance) {
            let steps: Vec<Step> = serde_json::from_value(steps).unwrap();
            let registry = ActionRegistry::new();
            let guard = SelfTriggerGuard::with_defaults();
            let graph = Compiler::new(&registry, &self.config, &guard)
                .compile(&steps)
                .unwrap();

            let dag = Dag::new("test", steps, graph.tasks);
            self.store.create_dag(&dag).await.unwrap();
            self.store.create_version(&dag.snapshot()).await.unwrap();

            let mut ins = DagInstance::for_dag(&dag);
            ins.vars = serde_json::from_value(vars).unwrap();
            if events {
                ins.event_persistence = EventPersistence::Sql;
            }
            self.store.create_instance(&ins).await.unwrap();
            (dag, ins)
        }

        async fn reload(&self, id: &Uuid) -> DagInstance {
            self.store.get_instance(id).await.unwrap().unwrap()
        }

        async fn task(&self, dag_ins_id: Uuid, task_id: &str) -> TaskInstance {
            self.store
                .list_tasks(&TaskFilter::for_instance(dag_ins_id))
                .await
                .unwrap()
                .into_iter()
                .find(|t| t.task_id == task_id)
                .unwrap()
        }
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
            {"id": "C", "operator": "@test/c", "parameters": {"from": "{{__A.n}}"}}
        ])
    }

    #[tokio::test]
    async fn test_sequential_run_succeeds() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@test/a", "parameters": {"who": "{{__0.name}}"}},
                    {"id": "2", "operator": "@test/b", "parameters": {"greeting": "hi {{__1.who}}"}}
                ]),
                json!({"name": "ada"}),
                false,
            )
            .await;

        let status = h.executor.execute(&ins.id).await.unwrap();
        assert_eq!(status, DagInstanceStatus::Success);

        let done = h.reload(&ins.id).await;
        assert_eq!(done.status, DagInstanceStatus::Success);
        assert!(done.ended_at.is_some());
        assert_eq!(done.share_data.get("__2"), Some(&json!({"greeting": "hi ada"})));

        let task = h.task(ins.id, "2").await;
        assert_eq!(task.status, TaskInstanceStatus::Success);
        assert_eq!(task.params["greeting"], json!("hi ada"));
        assert_eq!(task.metadata.attempts, 1);
        assert!(!h.executor.is_running(&ins.id));
    }

    #[tokio::test]
    async fn test_branch_scenario_skips_untaken_branch() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h.instance(branch_tree(), json!({"x": 1}), false).await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        assert_eq!(h.task(ins.id, "A").await.status, TaskInstanceStatus::Success);
        assert_eq!(h.task(ins.id, "B").await.status, TaskInstanceStatus::Skipped);
        let c = h.task(ins.id, "C").await;
        assert_eq!(c.status, TaskInstanceStatus::Success);
        assert_eq!(c.params["from"], json!(1));
    }

    #[tokio::test]
    async fn test_event_replay_matches_graph_replay_after_run() {
        let h = harness(EngineConfig::default());
        let (dag, ins) = h.instance(branch_tree(), json!({"x": 1}), true).await;
        h.executor.execute(&ins.id).await.unwrap();

        let done = h.reload(&ins.id).await;
        let events = h.store.list_events(&ins.id, &[]).await.unwrap();
        let resolver = TemplateResolver::new();
        let from_events = replay_events(&events, &done, &dag.steps, &resolver);
        let from_graph = replay_graph(&dag.tasks, &done, &resolver);

        let event_ids: Vec<&str> = from_events.iter().map(|v| v.task_id.as_str()).collect();
        let graph_ids: Vec<&str> = from_graph
            .iter()
            .filter(|v| v.status != TaskInstanceStatus::Skipped)
            .map(|v| v.task_id.as_str())
            .collect();
        assert_eq!(event_ids, vec!["0", "1", "A", "C"]);
        assert_eq!(event_ids, graph_ids);
        assert_eq!(from_events[2].results, from_graph[2].results);
        assert!(from_events.iter().all(|v| v.status == TaskInstanceStatus::Success));
    }

    /// Task ids from event replay and from graph replay with Skipped views dropped.
    async fn replay_ids(h: &Harness, dag: &Dag, dag_ins_id: &Uuid) -> (Vec<String>, Vec<String>) {
        let done = h.reload(dag_ins_id).await;
        let events = h.store.list_events(dag_ins_id, &[]).await.unwrap();
        let resolver = TemplateResolver::new();
        let from_events = replay_events(&events, &done, &dag.steps, &resolver)
            .into_iter()
            .map(|v| v.task_id)
            .collect();
        let from_graph = replay_graph(&dag.tasks, &done, &resolver)
            .into_iter()
            .filter(|v| v.status != TaskInstanceStatus::Skipped)
            .map(|v| v.task_id)
            .collect();
        (from_events, from_graph)
    }

    #[tokio::test]
    async fn test_event_and_graph_replay_agree_on_loop_ids() {
        let h = harness(EngineConfig::default());
        let (dag, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "7", "operator": "@control/flow/loop",
                     "parameters": {"mode": "array", "array": [1, 2]},
                     "steps": [{"id": "8", "operator": "@test/a"}]}
                ]),
                json!({}),
                true,
            )
            .await;
        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);

        let (events, graph) = replay_ids(&h, &dag, &ins.id).await;
        assert_eq!(events, vec!["0", "7", "7_i0_s8", "7_i1", "7_i1_s8"]);
        assert_eq!(events, graph);

        let done = h.reload(&ins.id).await;
        let stored = h.store.list_events(&ins.id, &[]).await.unwrap();
        let views = replay_events(&stored, &done, &dag.steps, &TemplateResolver::new());
        let second_body = views.iter().find(|v| v.task_id == "7_i1_s8").unwrap();
        assert_eq!(second_body.action_name, "@test/a");
        assert_eq!(second_body.status, TaskInstanceStatus::Success);
    }

    #[tokio::test]
    async fn test_event_and_graph_replay_agree_on_loop_branch_ids() {
        let h = harness(EngineConfig::default());
        let (dag, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "7", "operator": "@control/flow/loop",
                     "parameters": {"mode": "array", "array": [1, 2]},
                     "steps": [{
                        "id": "8",
                        "operator": "@control/flow/branches",
                        "branches": [
                            {"conditions": [[{"operator": "@internal/cmp/number-eq",
                                              "parameters": {"a": "{{__7.value}}", "b": 1}}]],
                             "steps": [{"id": "9", "operator": "@test/a"}]},
                            {"conditions": [[{"operator": "@internal/cmp/number-eq",
                                              "parameters": {"a": "{{__7.value}}", "b": 2}}]],
                             "steps": [{"id": "10", "operator": "@test/b"}]}
                        ]
                     }]}
                ]),
                json!({}),
                true,
            )
            .await;
        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);

        let (events, graph) = replay_ids(&h, &dag, &ins.id).await;
        assert_eq!(
            events,
            vec!["0", "7", "7_i0_s8", "7_i0_s8_0_9", "7_i1", "7_i1_s8", "7_i1_s8_1_10"]
        );
        assert_eq!(events, graph);
    }

    #[tokio::test]
    async fn test_return_stops_the_walk() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@internal/return", "parameters": {"code": 7}},
                    {"id": "2", "operator": "@test/a"}
                ]),
                json!({}),
                false,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        assert_eq!(h.task(ins.id, "1").await.results, Some(json!({"code": 7})));
        assert_eq!(h.task(ins.id, "2").await.status, TaskInstanceStatus::Init);
    }

    #[tokio::test]
    async fn test_loop_collects_outputs() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "7", "operator": "@control/flow/loop",
                     "parameters": {"mode": "array", "array": "{{__0.docs}}",
                                    "outputs": [{"key": "names", "value": "{{__8.name}}"}]},
                     "steps": [
                        {"id": "8", "operator": "@test/a", "parameters": {"name": "{{__7.value}}"}},
                        {"id": "9", "operator": "@internal/assign",
                         "parameters": {"target": "last", "value": "{{__8.name}}"}}
                     ]}
                ]),
                json!({"docs": ["a.txt", "b.txt"]}),
                true,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        let done = h.reload(&ins.id).await;
        assert_eq!(done.share_data.get("__7_i1_s8"), Some(&json!({"name": "b.txt"})));
        assert_eq!(done.share_data.get("__7_i0_s8"), Some(&json!({"name": "a.txt"})));
        assert_eq!(
            done.share_data.task_result("7").unwrap()["outputs"],
            json!({"names": ["a.txt", "b.txt"]})
        );
        assert_eq!(done.vars["last"], json!("b.txt"));

        let looped = h.task(ins.id, "7").await;
        assert_eq!(looped.status, TaskInstanceStatus::Success);

        let headers = h
            .store
            .list_events(&ins.id, &[autoflow_types::event::EventType::TaskStatus])
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.operator == operator::LOOP)
            .map(|e| e.task_id)
            .collect::<Vec<_>>();
        assert_eq!(headers, vec!["7".to_string(), "7_i1".to_string()]);
    }

    #[tokio::test]
    async fn test_loop_branch_runs_matching_arm_only() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "7", "operator": "@control/flow/loop",
                     "parameters": {"mode": "array", "array": [1, 2]},
                     "steps": [{
                        "id": "8",
                        "operator": "@control/flow/branches",
                        "branches": [
                            {"conditions": [[{"operator": "@internal/cmp/number-eq",
                                              "parameters": {"a": "{{__7.value}}", "b": 1}}]],
                             "steps": [{"id": "9", "operator": "@test/a", "parameters": {"v": "{{__7.value}}"}}]},
                            {"conditions": [[{"operator": "@internal/cmp/number-eq",
                                              "parameters": {"a": "{{__7.value}}", "b": 2}}]],
                             "steps": [{"id": "10", "operator": "@test/b", "parameters": {"v": "{{__7.value}}"}}]}
                        ]
                     }]}
                ]),
                json!({}),
                false,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        let done = h.reload(&ins.id).await;
        assert_eq!(done.share_data.get("__7_i0_s8_0_9"), Some(&json!({"v": 1})));
        assert_eq!(done.share_data.get("__7_i1_s8_1_10"), Some(&json!({"v": 2})));
        assert!(done.share_data.get("__7_i0_s8_1_10").is_none());
        assert!(done.share_data.get("__7_i1_s8_0_9").is_none());
    }

    #[tokio::test]
    async fn test_approval_blocks_instance() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@workflow/approval", "parameters": {"approvers": ["bob"]}},
                    {"id": "2", "operator": "@test/a"}
                ]),
                json!({}),
                false,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Blocked);
        let blocked = h.task(ins.id, "1").await;
        assert_eq!(blocked.status, TaskInstanceStatus::Blocked);
        assert!(blocked.results.unwrap()["group_id"].is_string());
        assert_eq!(h.task(ins.id, "2").await.status, TaskInstanceStatus::Init);
        assert!(h.reload(&ins.id).await.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_reentry_skips_settled_tasks() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@workflow/approval"},
                    {"id": "2", "operator": "@test/a", "parameters": {"ok": "{{__1.result}}"}}
                ]),
                json!({}),
                false,
            )
            .await;
        h.executor.execute(&ins.id).await.unwrap();

        // Settle the approval the way a resume would.
        let mut approval = h.task(ins.id, "1").await;
        approval.results = Some(json!({"result": "pass"}));
        approval.transition(TaskInstanceStatus::Success);
        h.store.update_task(&approval).await.unwrap();
        let mut reloaded = h.reload(&ins.id).await;
        reloaded.share_data.set("1", json!({"result": "pass"}));
        reloaded.status = DagInstanceStatus::Init;
        h.store.update_instance(&reloaded).await.unwrap();

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        assert_eq!(h.task(ins.id, "2").await.params["ok"], json!("pass"));
        assert_eq!(h.task(ins.id, "1").await.status, TaskInstanceStatus::Success);
    }

    #[tokio::test]
    async fn test_retry_settings_are_honored() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@test/flaky",
                     "settings": {"retry": {"max": 2, "delay": 0}}}
                ]),
                json!({}),
                false,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        let task = h.task(ins.id, "1").await;
        assert_eq!(task.metadata.attempts, 3);
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_fails_instance() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@test/flaky"},
                    {"id": "2", "operator": "@test/a"}
                ]),
                json!({}),
                false,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Failed);
        let done = h.reload(&ins.id).await;
        assert!(done.reason.unwrap().contains("attempt 1"));
        assert_eq!(h.task(ins.id, "1").await.status, TaskInstanceStatus::Failed);
        assert_eq!(h.task(ins.id, "2").await.status, TaskInstanceStatus::Init);
    }

    #[tokio::test]
    async fn test_watchdog_timeout_fails_task() {
        let config = EngineConfig {
            watchdog_margin_secs: 0,
            ..EngineConfig::default()
        };
        let h = harness(config);
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@test/slow", "settings": {"timeout": {"delay": 1}}}
                ]),
                json!({}),
                false,
            )
            .await;

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Failed);
        let reason = h.task(ins.id, "1").await.reason.unwrap();
        assert!(reason.as_str().unwrap().contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_action() {
        let h = harness(EngineConfig::default());
        let (_, ins) = h
            .instance(
                json!([
                    {"id": "0", "operator": "@trigger/manual"},
                    {"id": "1", "operator": "@test/slow"},
                    {"id": "2", "operator": "@test/a"}
                ]),
                json!({}),
                false,
            )
            .await;

        let (status, signaled) = tokio::join!(h.executor.execute(&ins.id), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.executor.cancel(&ins.id)
        });
        assert!(signaled);
        assert_eq!(status.unwrap(), DagInstanceStatus::Canceled);
        assert_eq!(h.task(ins.id, "1").await.status, TaskInstanceStatus::Canceled);
        assert_eq!(h.task(ins.id, "2").await.status, TaskInstanceStatus::Init);
        assert!(!h.executor.cancel(&ins.id));
    }

    #[tokio::test]
    async fn test_rejects_non_executable_instance() {
        let h = harness(EngineConfig::default());
        let (_, mut ins) = h.instance(branch_tree(), json!({"x": 1}), false).await;
        ins.status = DagInstanceStatus::Blocked;
        h.store.update_instance(&ins).await.unwrap();

        let err = h.executor.execute(&ins.id).await.unwrap_err();
        assert!(matches!(err, FlowError::State(StateError::NotExecutable { .. })));
    }

    #[tokio::test]
    async fn test_vm_mode_consumes_resume_payload() {
        let h = harness(EngineConfig::default());
        let (_, mut ins) = h.instance(branch_tree(), json!({"x": 2}), false).await;
        ins.mode = InstanceMode::Vm;
        ins.resume_status = Some(TaskInstanceStatus::Success);
        ins.resume_data = Some("[{}]".into());
        h.store.update_instance(&ins).await.unwrap();

        assert_eq!(h.executor.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        let done = h.reload(&ins.id).await;
        assert!(done.resume_status.is_none());
        assert!(done.resume_data.is_none());
        assert_eq!(h.task(ins.id, "B").await.status, TaskInstanceStatus::Success);
    }
}
