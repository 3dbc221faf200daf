//! Dag repository trait definition.

use autoflow_types::dag::{Dag, DagStatus, DagVersion};
use autoflow_types::error::RepositoryError;
use autoflow_types::operator::TriggerKind;
use uuid::Uuid;

use super::SortOrder;

/// Filter for listing dags.
#[derive(Debug, Clone, Default)]
pub struct DagFilter {
    pub status: Option<DagStatus>,
    pub trigger: Option<TriggerKind>,
    /// `None` lists removed and live dags alike.
    pub removed: Option<bool>,
    pub sort: SortOrder,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Storage for dags and their immutable versions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DagRepository: Send + Sync {
    /// Insert a new dag. Fails with `Conflict` when the id exists.
    fn create_dag(
        &self,
        dag: &Dag,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace an existing dag. Fails with `NotFound` when absent.
    fn update_dag(
        &self,
        dag: &Dag,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_dag(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Dag>, RepositoryError>> + Send;

    fn list_dags(
        &self,
        filter: &DagFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Dag>, RepositoryError>> + Send;

    /// Fetch every dag whose id is in `ids`. Missing ids are ignored.
    fn list_dags_by_ids(
        &self,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Dag>, RepositoryError>> + Send;

    /// Delete a dag with its versions and instances. Returns `true` if it existed.
    fn delete_dag(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn create_version(
        &self,
        version: &DagVersion,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_version(
        &self,
        version_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DagVersion>, RepositoryError>> + Send;

    /// Versions of a dag, newest first.
    fn list_versions(
        &self,
        dag_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<DagVersion>, RepositoryError>> + Send;
}
