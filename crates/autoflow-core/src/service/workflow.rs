//! Workflow management service.
//!
//! Orchestrates the full life of a workflow: committing authored step trees
//! as versioned Dags, starting instances, driving them through the executor,
//! and the cancel / retry / resume operations that act on them afterwards.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use autoflow_types::config::EngineConfig;
use autoflow_types::dag::{Dag, DagStatus, DagVersion};
use autoflow_types::instance::{
    DagInstance, DagInstanceStatus, EventPersistence, InstanceMode, TaskInstance,
    TaskInstanceStatus,
};
use autoflow_types::operator::TriggerKind;
use autoflow_types::step::{walk_steps, Step};

use crate::action::ActionRegistry;
use crate::error::{FlowError, PolicyError, StateError};
use crate::repository::{DagFilter, DagRepository, InstanceFilter, Store};
use crate::workflow::compiler::{CompiledGraph, Compiler};
use crate::workflow::cycle::{has_cycle, SelfTriggerGuard};
use crate::workflow::definition::WorkflowDocument;
use crate::workflow::executor::Executor;
use crate::workflow::expression::ExpressionResolver;
use crate::workflow::lifecycle;
use crate::workflow::materializer::Materializer;
use crate::workflow::resume::{self, ResumeOutcome};

/// Options for starting an instance.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub mode: InstanceMode,
    pub event_persistence: EventPersistence,
    pub vars: Map<String, Value>,
    /// Dags on the invocation path that led here, outermost first.
    pub call_chain: Vec<Uuid>,
}

/// Service orchestrating the workflow lifecycle.
///
/// Generic over the store so autoflow-core never depends on autoflow-infra.
pub struct WorkflowService<S: Store> {
    store: Arc<S>,
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
    guard: SelfTriggerGuard,
    executor: Executor<S>,
    materializer: Materializer<S>,
}

impl<S: Store> WorkflowService<S> {
    /// Create a new WorkflowService.
    ///
    /// - `store`: persistence for Dags, instances and events
    /// - `registry`: actions available to task dispatch
    /// - `resolver`: `{{...}}` parameter resolution
    /// - `config`: timeouts, resume budget, cache TTL and call-chain limit
    pub fn new(
        store: Arc<S>,
        registry: Arc<ActionRegistry>,
        resolver: Arc<dyn ExpressionResolver>,
        config: EngineConfig,
    ) -> Self {
        let executor = Executor::new(
            store.clone(),
            registry.clone(),
            resolver.clone(),
            config.clone(),
        );
        let materializer = Materializer::new(store.clone(), resolver, &config.materializer);
        Self {
            store,
            registry,
            config,
            guard: SelfTriggerGuard::with_defaults(),
            executor,
            materializer,
        }
    }

    /// Replace the default self-trigger rules.
    pub fn with_guard(mut self, guard: SelfTriggerGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Validate and compile a step tree without persisting anything.
    pub fn compile(&self, steps: &[Step]) -> Result<CompiledGraph, FlowError> {
        Ok(Compiler::new(&self.registry, &self.config, &self.guard).compile(steps)?)
    }

    // -----------------------------------------------------------------------
    // Dags
    // -----------------------------------------------------------------------

    /// Commit a new workflow.
    ///
    /// 1. Validates and compiles the step tree
    /// 2. Rejects restricted actions for non-administrators
    /// 3. Checks composable Dags for reference cycles
    /// 4. Writes the Dag and its first version
    pub async fn create_dag(&self, doc: WorkflowDocument, is_admin: bool) -> Result<Dag, FlowError> {
        let graph = self.compile(&doc.steps)?;
        self.check_restricted(&doc.steps, is_admin)?;

        let mut dag = Dag::new(doc.name, doc.steps, graph.tasks);
        dag.description = doc.description;
        dag.dag_type = doc.dag_type;
        dag.sub_ids = doc.sub_ids;
        if dag.is_composable() {
            self.check_references(None, &dag.sub_ids).await?;
        }

        commit_new_dag(self.store.as_ref(), &dag).await?;
        tracing::info!(dag_id = %dag.id, name = %dag.name, tasks = dag.tasks.len(), "dag created");
        Ok(dag)
    }

    /// Replace the step tree of an existing workflow.
    ///
    /// Runs the same checks as [`create_dag`](Self::create_dag), bumps the
    /// version and issues a new version id. Instances already started keep
    /// resolving against the version they were bound to.
    pub async fn update_dag(
        &self,
        dag_id: &Uuid,
        doc: WorkflowDocument,
        is_admin: bool,
    ) -> Result<Dag, FlowError> {
        let mut dag = self.get_dag(dag_id).await?;
        let graph = self.compile(&doc.steps)?;
        self.check_restricted(&doc.steps, is_admin)?;

        if !doc.name.is_empty() {
            dag.name = doc.name;
        }
        if doc.description.is_some() {
            dag.description = doc.description;
        }
        dag.dag_type = doc.dag_type;
        dag.sub_ids = doc.sub_ids;
        if dag.is_composable() {
            self.check_references(Some(dag.id), &dag.sub_ids).await?;
        }

        dag.trigger = doc
            .steps
            .first()
            .map(|s| TriggerKind::from_operator(&s.operator))
            .unwrap_or_default();
        dag.steps = doc.steps;
        dag.tasks = graph.tasks;
        dag.version += 1;
        dag.version_id = Uuid::now_v7();
        dag.updated_at = Utc::now();

        // The version goes first so a failed write leaves the Dag untouched.
        self.store.create_version(&dag.snapshot()).await?;
        self.store.update_dag(&dag).await?;
        tracing::info!(dag_id = %dag.id, version = dag.version, "dag updated");
        Ok(dag)
    }

    pub async fn get_dag(&self, dag_id: &Uuid) -> Result<Dag, FlowError> {
        self.store
            .get_dag(dag_id)
            .await?
            .ok_or_else(|| FlowError::not_found("dag", dag_id))
    }

    pub async fn list_dags(&self, filter: &DagFilter) -> Result<Vec<Dag>, FlowError> {
        Ok(self.store.list_dags(filter).await?)
    }

    pub async fn list_versions(&self, dag_id: &Uuid) -> Result<Vec<DagVersion>, FlowError> {
        Ok(self.store.list_versions(dag_id).await?)
    }

    /// Stop or reopen a workflow for new instances.
    pub async fn set_dag_status(&self, dag_id: &Uuid, status: DagStatus) -> Result<Dag, FlowError> {
        let mut dag = self.get_dag(dag_id).await?;
        dag.status = status;
        dag.updated_at = Utc::now();
        self.store.update_dag(&dag).await?;
        tracing::info!(%dag_id, %status, "dag status changed");
        Ok(dag)
    }

    pub async fn delete_dag(&self, dag_id: &Uuid) -> Result<(), FlowError> {
        if !self.store.delete_dag(dag_id).await? {
            return Err(FlowError::not_found("dag", dag_id));
        }
        tracing::info!(%dag_id, "dag deleted");
        Ok(())
    }

    fn check_restricted(&self, steps: &[Step], is_admin: bool) -> Result<(), FlowError> {
        if is_admin {
            return Ok(());
        }
        let mut restricted = None;
        walk_steps(steps, &mut |step| {
            if restricted.is_none()
                && self
                    .registry
                    .get(&step.operator)
                    .is_some_and(|action| action.restricted())
            {
                restricted = Some(step.operator.clone());
            }
        });
        match restricted {
            Some(op) => Err(PolicyError::RestrictedAction(op).into()),
            None => Ok(()),
        }
    }

    async fn check_references(&self, root: Option<Uuid>, sub_ids: &[Uuid]) -> Result<(), FlowError> {
        let report = has_cycle(self.store.as_ref(), root, sub_ids).await?;
        if !report.cycle {
            return Ok(());
        }
        Err(PolicyError::ReferenceCycle {
            refer_dag_id: report.refer_dag_id.unwrap_or_default(),
            refer_name: report.refer_name.unwrap_or_default(),
        }
        .into())
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Start an instance of a workflow in `Init`.
    ///
    /// 1. Rejects stopped or removed Dags
    /// 2. Rejects a Dag already on the call chain
    /// 3. Caps the call chain at `max_call_chain_depth`
    /// 4. Binds the instance to the Dag's current version
    pub async fn run_instance(
        &self,
        dag_id: &Uuid,
        request: RunRequest,
    ) -> Result<DagInstance, FlowError> {
        let dag = self.get_dag(dag_id).await?;
        if !dag.is_runnable() {
            return Err(StateError::DagNotRunnable(dag.id).into());
        }
        if request.call_chain.contains(&dag.id) {
            return Err(StateError::CallChainLoop(dag.id).into());
        }
        let depth = request.call_chain.len() + 1;
        let max = self.config.max_call_chain_depth;
        if depth > max {
            return Err(StateError::CallChainTooDeep { depth, max }.into());
        }

        let mut instance = DagInstance::for_dag(&dag);
        instance.mode = request.mode;
        instance.event_persistence = request.event_persistence;
        instance.vars = request.vars;
        instance.call_chain = request.call_chain;
        instance.call_chain.push(dag.id);

        self.store.create_instance(&instance).await?;
        tracing::info!(
            dag_ins_id = %instance.id,
            %dag_id,
            mode = instance.mode.as_str(),
            depth,
            "instance created"
        );
        Ok(instance)
    }

    pub async fn get_instance(&self, dag_ins_id: &Uuid) -> Result<DagInstance, FlowError> {
        self.store
            .get_instance(dag_ins_id)
            .await?
            .ok_or_else(|| FlowError::not_found("instance", dag_ins_id))
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<DagInstance>, FlowError> {
        Ok(self.store.list_instances(filter).await?)
    }

    /// Run an instance until it finishes, blocks or is canceled.
    pub async fn execute(&self, dag_ins_id: &Uuid) -> Result<DagInstanceStatus, FlowError> {
        let result = self.executor.execute(dag_ins_id).await;
        self.materializer.invalidate(dag_ins_id);
        result
    }

    /// Interrupt an in-flight execution, if any, then cancel the instance.
    pub async fn cancel(&self, dag_ins_id: &Uuid) -> Result<Vec<Uuid>, FlowError> {
        self.executor.cancel(dag_ins_id);
        let result = lifecycle::cancel(self.store.as_ref(), &self.registry, dag_ins_id).await;
        self.materializer.invalidate(dag_ins_id);
        result
    }

    pub async fn retry(&self, dag_ins_id: &Uuid) -> Result<Vec<Uuid>, FlowError> {
        let result = lifecycle::retry(self.store.as_ref(), dag_ins_id).await;
        self.materializer.invalidate(dag_ins_id);
        result
    }

    /// Re-inject an external result into blocked tasks.
    pub async fn resume(
        &self,
        task_ins_ids: &[Uuid],
        result: &Map<String, Value>,
        status: TaskInstanceStatus,
    ) -> Result<ResumeOutcome, FlowError> {
        let outcome =
            resume::resume(self.store.as_ref(), &self.config.resume, task_ins_ids, result, status)
                .await?;
        if let ResumeOutcome::Applied(ids) = &outcome {
            for id in ids {
                self.materializer.invalidate(id);
            }
        }
        Ok(outcome)
    }

    /// Total number of task views and the requested page of them.
    pub async fn list_task_results(
        &self,
        dag_ins_id: &Uuid,
        page: u64,
        limit: Option<u64>,
    ) -> Result<(u64, Vec<TaskInstance>), FlowError> {
        self.materializer.list_task_results(dag_ins_id, page, limit).await
    }
}

/// Write a new Dag and its first version.
///
/// A Dag whose version cannot be written is deleted again before the error
/// is returned. Failures of that cleanup are logged and swallowed.
async fn commit_new_dag<R: DagRepository>(repo: &R, dag: &Dag) -> Result<(), FlowError> {
    repo.create_dag(dag).await?;
    if let Err(e) = repo.create_version(&dag.snapshot()).await {
        if let Err(cleanup) = repo.delete_dag(&dag.id).await {
            tracing::warn!(dag_id = %dag.id, error = %cleanup, "failed to remove dag without version");
        }
        return Err(e.into());
    }
    Ok(())
}
