//! Incremental-sync cursor trait definition.

use autoflow_types::cursor::IncrementalCursor;
use autoflow_types::error::RepositoryError;
use autoflow_types::instance::DagInstance;
use uuid::Uuid;

pub trait CursorRepository: Send + Sync {
    fn get_cursor(
        &self,
        dag_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<IncrementalCursor>, RepositoryError>> + Send;

    /// Create `instance` and upsert `cursor` in one transaction.
    fn create_instance_with_cursor(
        &self,
        instance: &DagInstance,
        cursor: &IncrementalCursor,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
