//! Application state wiring the workflow service to SQLite.

use std::sync::Arc;

use autoflow_core::action::builtin::ApprovalAction;
use autoflow_core::action::ActionRegistry;
use autoflow_core::service::workflow::WorkflowService;
use autoflow_core::workflow::expression::TemplateResolver;
use autoflow_infra::config::{database_url, load_config, resolve_data_dir};
use autoflow_infra::sqlite::pool::DatabasePool;
use autoflow_infra::sqlite::store::SqliteStore;

/// The workflow service pinned to the SQLite store.
pub type ConcreteWorkflowService = WorkflowService<SqliteStore>;

pub struct AppState {
    pub workflow_service: ConcreteWorkflowService,
}

impl AppState {
    /// Initialize the application state: load config, open the database,
    /// register the shipped actions.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&config, &data_dir)).await?;

        let mut registry = ActionRegistry::new();
        registry.register(ApprovalAction);

        let workflow_service = WorkflowService::new(
            Arc::new(SqliteStore::new(db_pool)),
            Arc::new(registry),
            Arc::new(TemplateResolver::new()),
            config,
        );
        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self { workflow_service })
    }
}
