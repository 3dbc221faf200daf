//! The SQLite store handle.

use super::pool::DatabasePool;

/// SQLite-backed implementation of every repository trait in
/// `autoflow-core`.
///
/// Cloning is cheap: clones share the underlying pools.
#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: DatabasePool,
}

impl SqliteStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use autoflow_core::action::builtin::ApprovalAction;
    use autoflow_core::action::ActionRegistry;
    use autoflow_core::repository::{InstanceFilter, InstanceRepository, TaskFilter};
    use autoflow_core::service::workflow::{RunRequest, WorkflowService};
    use autoflow_core::sync::incremental::IncrementalSync;
    use autoflow_core::workflow::definition::parse_document;
    use autoflow_core::workflow::expression::TemplateResolver;
    use autoflow_types::config::EngineConfig;
    use autoflow_types::instance::{
        DagInstance, DagInstanceStatus, EventPersistence, TaskInstanceStatus,
    };
    use serde_json::json;

    use super::*;
    use crate::sqlite::lock::SqliteLock;
    use crate::sqlite::pool::tests::test_pool;

    const APPROVAL: &str = r#"
name: approve
steps:
  - id: "0"
    operator: "@trigger/manual"
  - id: "1"
    operator: "@workflow/approval"
    parameters:
      approvers: [bob]
  - id: "2"
    operator: "@internal/assign"
    parameters:
      target: decision
      value: "{{__1.result}}"
"#;

    fn service(store: SqliteStore) -> WorkflowService<SqliteStore> {
        let mut registry = ActionRegistry::new();
        registry.register(ApprovalAction);
        let mut config = EngineConfig::default();
        config.resume.backoff_ms = 1;
        WorkflowService::new(
            Arc::new(store),
            Arc::new(registry),
            Arc::new(TemplateResolver::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_approval_workflow_on_sqlite() {
        let store = SqliteStore::new(test_pool().await);
        let svc = service(store.clone());

        let dag = svc.create_dag(parse_document(APPROVAL).unwrap(), false).await.unwrap();
        let ins = svc
            .run_instance(
                &dag.id,
                RunRequest {
                    event_persistence: EventPersistence::Sql,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(svc.execute(&ins.id).await.unwrap(), DagInstanceStatus::Blocked);

        let blocked = store
            .list_tasks(&TaskFilter::for_instance(ins.id))
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.status == TaskInstanceStatus::Blocked)
            .unwrap();
        let result = serde_json::from_value(json!({"result": "pass"})).unwrap();
        svc.resume(&[blocked.id], &result, TaskInstanceStatus::Success)
            .await
            .unwrap();

        assert_eq!(svc.execute(&ins.id).await.unwrap(), DagInstanceStatus::Success);
        let done = svc.get_instance(&ins.id).await.unwrap();
        assert_eq!(done.vars["decision"], json!("pass"));
        let (total, _) = svc.list_task_results(&ins.id, 0, None).await.unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_incremental_sync_on_sqlite() {
        let pool = test_pool().await;
        let store = Arc::new(SqliteStore::new(pool.clone()));
        let lock = Arc::new(SqliteLock::new(pool));
        let svc = service(store.as_ref().clone());
        let dag = svc.create_dag(parse_document(APPROVAL).unwrap(), false).await.unwrap();

        let sync = IncrementalSync::new(store.clone(), lock, &EngineConfig::default().lock);
        let first = sync
            .start(DagInstance::for_dag(&dag), "modified_at", "100")
            .await
            .unwrap();
        assert!(first.is_some());
        let again = sync
            .start(DagInstance::for_dag(&dag), "modified_at", "100")
            .await
            .unwrap();
        assert!(again.is_none());

        let count = store
            .count_instances(&InstanceFilter {
                dag_id: Some(dag.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
