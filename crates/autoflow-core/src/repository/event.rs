//! Append-only event log trait definition.

use autoflow_types::error::RepositoryError;
use autoflow_types::event::{DagInstanceEvent, EventType};
use uuid::Uuid;

pub trait EventRepository: Send + Sync {
    /// Append events in order, in one transaction. The store assigns ids.
    fn append_events(
        &self,
        events: &[DagInstanceEvent],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Events of an instance in append order. An empty `types` lists all.
    fn list_events(
        &self,
        instance_id: &Uuid,
        types: &[EventType],
    ) -> impl std::future::Future<Output = Result<Vec<DagInstanceEvent>, RepositoryError>> + Send;
}
