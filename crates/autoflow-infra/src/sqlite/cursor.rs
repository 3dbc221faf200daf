//! SQLite incremental-sync cursor implementation.
//!
//! Implements `CursorRepository` from `autoflow-core`. Instance creation and
//! the cursor advance commit together.

use autoflow_core::repository::CursorRepository;
use autoflow_types::cursor::IncrementalCursor;
use autoflow_types::error::RepositoryError;
use autoflow_types::instance::DagInstance;
use sqlx::Row;
use uuid::Uuid;

use super::codec::{format_datetime, parse_datetime, parse_uuid, query_err};
use super::instance::insert_instance;
use super::store::SqliteStore;

impl CursorRepository for SqliteStore {
    async fn get_cursor(&self, dag_id: &Uuid) -> Result<Option<IncrementalCursor>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM incremental_cursors WHERE dag_id = ?")
            .bind(dag_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let dag_id: String = row.try_get("dag_id").map_err(query_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(query_err)?;
        Ok(Some(IncrementalCursor {
            dag_id: parse_uuid(&dag_id)?,
            field: row.try_get("field").map_err(query_err)?,
            value: row.try_get("value").map_err(query_err)?,
            updated_at: parse_datetime(&updated_at)?,
        }))
    }

    async fn create_instance_with_cursor(
        &self,
        instance: &DagInstance,
        cursor: &IncrementalCursor,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        insert_instance(&mut *tx, instance).await?;
        sqlx::query(
            "INSERT INTO incremental_cursors (dag_id, field, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (dag_id) DO UPDATE SET field = excluded.field, value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(cursor.dag_id.to_string())
        .bind(&cursor.field)
        .bind(&cursor.value)
        .bind(format_datetime(&cursor.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }
}
