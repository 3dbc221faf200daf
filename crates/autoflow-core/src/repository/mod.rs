//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (autoflow-infra) implements. The core crate never depends on any
//! specific storage technology. [`memory::MemoryStore`] implements all of
//! them in process for tests and dry runs.

pub mod cursor;
pub mod dag;
pub mod event;
pub mod instance;
pub mod memory;

pub use cursor::CursorRepository;
pub use dag::{DagFilter, DagRepository};
pub use event::EventRepository;
pub use instance::{InstanceFilter, InstanceRepository, TaskFilter};

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Everything the engine services need from persistence.
pub trait Store: DagRepository + InstanceRepository + EventRepository + CursorRepository {}

impl<T> Store for T where T: DagRepository + InstanceRepository + EventRepository + CursorRepository {}
