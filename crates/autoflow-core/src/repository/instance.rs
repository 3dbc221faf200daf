//! Instance repository trait definition.
//!
//! Covers two entity families:
//! - **DagInstances:** one row per execution.
//! - **TaskInstances:** one row per executed, skipped or pending task.

use autoflow_types::error::RepositoryError;
use autoflow_types::instance::{DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::SortOrder;

/// Filter for listing dag instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub dag_id: Option<Uuid>,
    pub status: Option<DagInstanceStatus>,
    pub sort: SortOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Filter for listing task instances. Empty vectors do not filter.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub dag_ins_id: Option<Uuid>,
    pub ids: Vec<Uuid>,
    pub statuses: Vec<TaskInstanceStatus>,
}

impl TaskFilter {
    pub fn for_instance(dag_ins_id: Uuid) -> Self {
        Self {
            dag_ins_id: Some(dag_ins_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &TaskInstance) -> bool {
        self.dag_ins_id.is_none_or(|id| task.dag_ins_id == id)
            && (self.ids.is_empty() || self.ids.contains(&task.id))
            && (self.statuses.is_empty() || self.statuses.contains(&task.status))
    }
}

pub trait InstanceRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // DagInstances
    // -----------------------------------------------------------------------

    fn create_instance(
        &self,
        instance: &DagInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DagInstance>, RepositoryError>> + Send;

    /// Replace an existing instance. Fails with `NotFound` when absent.
    fn update_instance(
        &self,
        instance: &DagInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> impl std::future::Future<Output = Result<Vec<DagInstance>, RepositoryError>> + Send;

    /// Number of instances matching `filter`, ignoring limit and offset.
    fn count_instances(
        &self,
        filter: &InstanceFilter,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // TaskInstances
    // -----------------------------------------------------------------------

    /// Insert or replace task instances by id.
    fn save_tasks(
        &self,
        tasks: &[TaskInstance],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TaskInstance>, RepositoryError>> + Send;

    /// Tasks matching `filter`, in creation order.
    fn list_tasks(
        &self,
        filter: &TaskFilter,
    ) -> impl std::future::Future<Output = Result<Vec<TaskInstance>, RepositoryError>> + Send;

    /// Replace an existing task. Fails with `NotFound` when absent.
    fn update_task(
        &self,
        task: &TaskInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Transitions spanning both
    // -----------------------------------------------------------------------

    /// Mark `task_ids` Canceled and the instance Canceled with `ended_at`,
    /// atomically.
    fn cancel_instance(
        &self,
        id: &Uuid,
        task_ids: &[Uuid],
        ended_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Reset Failed/Canceled tasks to Init with no reason and the instance to
    /// Init with no reason or end time, atomically. Returns the reset task ids.
    fn reset_for_retry(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;
}
