//! SQLite Dag repository implementation.
//!
//! Implements `DagRepository` from `autoflow-core`. Step trees and compiled
//! tasks are stored as JSON text; versions are immutable rows.

use autoflow_core::repository::{DagFilter, DagRepository, SortOrder};
use autoflow_types::dag::{Dag, DagVersion};
use autoflow_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::codec::{
    format_datetime, from_json, parse_datetime, parse_enum, parse_uuid, placeholders, query_err,
    to_json,
};
use super::store::SqliteStore;

/// Internal row type for mapping SQLite rows to domain Dag.
struct DagRow {
    id: String,
    name: String,
    description: Option<String>,
    status: String,
    removed: bool,
    trigger: String,
    dag_type: String,
    steps: String,
    tasks: String,
    sub_ids: String,
    version: u32,
    version_id: String,
    created_at: String,
    updated_at: String,
}

impl DagRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            removed: row.try_get("removed")?,
            trigger: row.try_get("trigger")?,
            dag_type: row.try_get("dag_type")?,
            steps: row.try_get("steps")?,
            tasks: row.try_get("tasks")?,
            sub_ids: row.try_get("sub_ids")?,
            version: row.try_get("version")?,
            version_id: row.try_get("version_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_dag(self) -> Result<Dag, RepositoryError> {
        Ok(Dag {
            id: parse_uuid(&self.id)?,
            name: self.name,
            description: self.description,
            status: parse_enum(&self.status)?,
            removed: self.removed,
            trigger: parse_enum(&self.trigger)?,
            dag_type: parse_enum(&self.dag_type)?,
            steps: from_json(&self.steps, "steps")?,
            tasks: from_json(&self.tasks, "tasks")?,
            sub_ids: from_json(&self.sub_ids, "sub_ids")?,
            version: self.version,
            version_id: parse_uuid(&self.version_id)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn dag_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Dag, RepositoryError> {
    DagRow::from_row(row).map_err(query_err)?.into_dag()
}

fn version_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DagVersion, RepositoryError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let dag_id: String = row.try_get("dag_id").map_err(query_err)?;
    let steps: String = row.try_get("steps").map_err(query_err)?;
    let tasks: String = row.try_get("tasks").map_err(query_err)?;
    let created_at: String = row.try_get("created_at").map_err(query_err)?;
    Ok(DagVersion {
        id: parse_uuid(&id)?,
        dag_id: parse_uuid(&dag_id)?,
        version: row.try_get("version").map_err(query_err)?,
        steps: from_json(&steps, "steps")?,
        tasks: from_json(&tasks, "tasks")?,
        created_at: parse_datetime(&created_at)?,
    })
}

impl DagRepository for SqliteStore {
    async fn create_dag(&self, dag: &Dag) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dags (id, name, description, status, removed, trigger, dag_type, steps, tasks, sub_ids, version, version_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(dag.id.to_string())
        .bind(&dag.name)
        .bind(&dag.description)
        .bind(dag.status.to_string())
        .bind(dag.removed)
        .bind(dag.trigger.as_str())
        .bind(dag.dag_type.as_str())
        .bind(to_json(&dag.steps)?)
        .bind(to_json(&dag.tasks)?)
        .bind(to_json(&dag.sub_ids)?)
        .bind(dag.version)
        .bind(dag.version_id.to_string())
        .bind(format_datetime(&dag.created_at))
        .bind(format_datetime(&dag.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_dag(&self, dag: &Dag) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE dags SET name = ?, description = ?, status = ?, removed = ?, trigger = ?, dag_type = ?, steps = ?, tasks = ?, sub_ids = ?, version = ?, version_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&dag.name)
        .bind(&dag.description)
        .bind(dag.status.to_string())
        .bind(dag.removed)
        .bind(dag.trigger.as_str())
        .bind(dag.dag_type.as_str())
        .bind(to_json(&dag.steps)?)
        .bind(to_json(&dag.tasks)?)
        .bind(to_json(&dag.sub_ids)?)
        .bind(dag.version)
        .bind(dag.version_id.to_string())
        .bind(format_datetime(&dag.updated_at))
        .bind(dag.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_dag(&self, id: &Uuid) -> Result<Option<Dag>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dags WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(dag_from_row).transpose()
    }

    async fn list_dags(&self, filter: &DagFilter) -> Result<Vec<Dag>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM dags");
        let mut conditions: Vec<String> = Vec::new();

        // Enum-derived values only, never caller text.
        if let Some(status) = filter.status {
            conditions.push(format!("status = '{status}'"));
        }
        if let Some(trigger) = filter.trigger {
            conditions.push(format!("trigger = '{}'", trigger.as_str()));
        }
        if let Some(removed) = filter.removed {
            conditions.push(format!("removed = {}", i32::from(removed)));
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let order = match filter.sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        sql.push_str(&format!(" ORDER BY created_at {order}, id {order}"));

        // SQLite only accepts OFFSET after LIMIT.
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {}", offset.unwrap_or(0)));
            }
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter().map(dag_from_row).collect()
    }

    async fn list_dags_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Dag>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT * FROM dags WHERE id IN ({})", placeholders(ids.len()));
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;
        rows.iter().map(dag_from_row).collect()
    }

    async fn delete_dag(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        // Versions, instances, tasks, events and cursors cascade.
        let result = sqlx::query("DELETE FROM dags WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_version(&self, version: &DagVersion) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO dag_versions (id, dag_id, version, steps, tasks, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(version.id.to_string())
        .bind(version.dag_id.to_string())
        .bind(version.version)
        .bind(to_json(&version.steps)?)
        .bind(to_json(&version.tasks)?)
        .bind(format_datetime(&version.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_version(&self, version_id: &Uuid) -> Result<Option<DagVersion>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dag_versions WHERE id = ?")
            .bind(version_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self, dag_id: &Uuid) -> Result<Vec<DagVersion>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM dag_versions WHERE dag_id = ? ORDER BY version DESC")
            .bind(dag_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        rows.iter().map(version_from_row).collect()
    }
}
