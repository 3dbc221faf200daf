//! Incremental-sync cursor shared by every scheduled run of one Dag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last value seen for `field` by incremental runs of `dag_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalCursor {
    pub dag_id: Uuid,
    pub field: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl IncrementalCursor {
    pub fn new(dag_id: Uuid, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            dag_id,
            field: field.into(),
            value: value.into(),
            updated_at: Utc::now(),
        }
    }

    /// Whether `value` would move the cursor.
    pub fn advances_to(&self, field: &str, value: &str) -> bool {
        self.field != field || self.value != value
    }
}
