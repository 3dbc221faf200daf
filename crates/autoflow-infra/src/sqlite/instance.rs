//! SQLite instance repository implementation.
//!
//! Implements `InstanceRepository` from `autoflow-core`. Transitions that
//! touch an instance and its tasks together run in one transaction.

use autoflow_core::repository::{InstanceFilter, InstanceRepository, SortOrder, TaskFilter};
use autoflow_types::error::RepositoryError;
use autoflow_types::instance::{DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus};
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite};
use uuid::Uuid;

use super::codec::{
    format_datetime, from_json, parse_datetime, parse_enum, parse_uuid, placeholders, query_err,
    to_json,
};
use super::store::SqliteStore;

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn instance_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DagInstance, RepositoryError> {
    let get = |col: &str| -> Result<String, RepositoryError> { row.try_get(col).map_err(query_err) };
    let get_opt =
        |col: &str| -> Result<Option<String>, RepositoryError> { row.try_get(col).map_err(query_err) };

    Ok(DagInstance {
        id: parse_uuid(&get("id")?)?,
        dag_id: parse_uuid(&get("dag_id")?)?,
        version_id: parse_uuid(&get("version_id")?)?,
        trigger: parse_enum(&get("trigger")?)?,
        status: parse_enum(&get("status")?)?,
        mode: parse_enum(&get("mode")?)?,
        event_persistence: parse_enum(&get("event_persistence")?)?,
        dag_type: parse_enum(&get("dag_type")?)?,
        share_data: from_json(&get("share_data")?, "share_data")?,
        vars: from_json(&get("vars")?, "vars")?,
        reason: get_opt("reason")?,
        call_chain: from_json(&get("call_chain")?, "call_chain")?,
        resume_status: get_opt("resume_status")?
            .as_deref()
            .map(parse_enum)
            .transpose()?,
        resume_data: get_opt("resume_data")?,
        created_at: parse_datetime(&get("created_at")?)?,
        updated_at: parse_datetime(&get("updated_at")?)?,
        ended_at: get_opt("ended_at")?
            .as_deref()
            .map(parse_datetime)
            .transpose()?,
    })
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskInstance, RepositoryError> {
    let get = |col: &str| -> Result<String, RepositoryError> { row.try_get(col).map_err(query_err) };
    let get_opt =
        |col: &str| -> Result<Option<String>, RepositoryError> { row.try_get(col).map_err(query_err) };
    let timeout_secs: i64 = row.try_get("timeout_secs").map_err(query_err)?;

    Ok(TaskInstance {
        id: parse_uuid(&get("id")?)?,
        task_id: get("task_id")?,
        dag_ins_id: parse_uuid(&get("dag_ins_id")?)?,
        name: get("name")?,
        action_name: get("action_name")?,
        depend_on: from_json(&get("depend_on")?, "depend_on")?,
        timeout_secs: timeout_secs.max(0) as u64,
        params: from_json(&get("params")?, "params")?,
        status: parse_enum(&get("status")?)?,
        reason: get_opt("reason")?
            .as_deref()
            .map(|s| from_json(s, "reason"))
            .transpose()?,
        pre_checks: from_json(&get("pre_checks")?, "pre_checks")?,
        results: get_opt("results")?
            .as_deref()
            .map(|s| from_json(s, "results"))
            .transpose()?,
        steps: from_json(&get("steps")?, "steps")?,
        last_modified_at: row.try_get("last_modified_at").map_err(query_err)?,
        metadata: from_json(&get("metadata")?, "metadata")?,
        created_at: parse_datetime(&get("created_at")?)?,
        updated_at: parse_datetime(&get("updated_at")?)?,
    })
}

/// Insert a new instance row on any executor, so transactions can share it.
pub(crate) async fn insert_instance<'e, E>(exec: E, instance: &DagInstance) -> Result<(), RepositoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO dag_instances (id, dag_id, version_id, trigger, status, mode, event_persistence, dag_type, share_data, vars, reason, call_chain, resume_status, resume_data, created_at, updated_at, ended_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(instance.id.to_string())
    .bind(instance.dag_id.to_string())
    .bind(instance.version_id.to_string())
    .bind(instance.trigger.as_str())
    .bind(instance.status.as_str())
    .bind(instance.mode.as_str())
    .bind(instance.event_persistence.as_str())
    .bind(instance.dag_type.as_str())
    .bind(to_json(&instance.share_data)?)
    .bind(to_json(&instance.vars)?)
    .bind(&instance.reason)
    .bind(to_json(&instance.call_chain)?)
    .bind(instance.resume_status.map(|s| s.as_str()))
    .bind(&instance.resume_data)
    .bind(format_datetime(&instance.created_at))
    .bind(format_datetime(&instance.updated_at))
    .bind(instance.ended_at.as_ref().map(format_datetime))
    .execute(exec)
    .await
    .map_err(query_err)?;
    Ok(())
}

/// `WHERE` clause and bind values for an instance filter.
fn instance_conditions(filter: &InstanceFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();
    if let Some(dag_id) = filter.dag_id {
        conditions.push("dag_id = ?");
        binds.push(dag_id.to_string());
    }
    if let Some(status) = filter.status {
        conditions.push("status = ?");
        binds.push(status.as_str().to_string());
    }
    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), binds)
    }
}

fn now_nanos(now: &DateTime<Utc>) -> i64 {
    now.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

impl InstanceRepository for SqliteStore {
    // -----------------------------------------------------------------------
    // DagInstances
    // -----------------------------------------------------------------------

    async fn create_instance(&self, instance: &DagInstance) -> Result<(), RepositoryError> {
        insert_instance(&self.pool.writer, instance).await
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<DagInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM dag_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn update_instance(&self, instance: &DagInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE dag_instances SET status = ?, mode = ?, event_persistence = ?, share_data = ?, vars = ?, reason = ?, call_chain = ?, resume_status = ?, resume_data = ?, updated_at = ?, ended_at = ?
             WHERE id = ?",
        )
        .bind(instance.status.as_str())
        .bind(instance.mode.as_str())
        .bind(instance.event_persistence.as_str())
        .bind(to_json(&instance.share_data)?)
        .bind(to_json(&instance.vars)?)
        .bind(&instance.reason)
        .bind(to_json(&instance.call_chain)?)
        .bind(instance.resume_status.map(|s| s.as_str()))
        .bind(&instance.resume_data)
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.ended_at.as_ref().map(format_datetime))
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<DagInstance>, RepositoryError> {
        let (conditions, binds) = instance_conditions(filter);
        let order = match filter.sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let mut sql = format!(
            "SELECT * FROM dag_instances{conditions} ORDER BY created_at {order}, id {order}"
        );
        match (filter.limit, filter.offset) {
            (Some(limit), offset) => {
                sql.push_str(&format!(" LIMIT {limit} OFFSET {}", offset.unwrap_or(0)));
            }
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, RepositoryError> {
        let (conditions, binds) = instance_conditions(filter);
        let sql = format!("SELECT COUNT(*) FROM dag_instances{conditions}");
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        let (count,) = query.fetch_one(&self.pool.reader).await.map_err(query_err)?;
        Ok(count.max(0) as u64)
    }

    // -----------------------------------------------------------------------
    // TaskInstances
    // -----------------------------------------------------------------------

    async fn save_tasks(&self, tasks: &[TaskInstance]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        for task in tasks {
            sqlx::query(
                "INSERT INTO task_instances (id, task_id, dag_ins_id, name, action_name, depend_on, timeout_secs, params, status, reason, pre_checks, results, steps, last_modified_at, metadata, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO UPDATE SET
                    params = excluded.params, status = excluded.status, reason = excluded.reason,
                    pre_checks = excluded.pre_checks, results = excluded.results,
                    last_modified_at = excluded.last_modified_at, metadata = excluded.metadata,
                    updated_at = excluded.updated_at",
            )
            .bind(task.id.to_string())
            .bind(&task.task_id)
            .bind(task.dag_ins_id.to_string())
            .bind(&task.name)
            .bind(&task.action_name)
            .bind(to_json(&task.depend_on)?)
            .bind(task.timeout_secs.min(i64::MAX as u64) as i64)
            .bind(to_json(&task.params)?)
            .bind(task.status.as_str())
            .bind(task.reason.as_ref().map(to_json).transpose()?)
            .bind(to_json(&task.pre_checks)?)
            .bind(task.results.as_ref().map(to_json).transpose()?)
            .bind(to_json(&task.steps)?)
            .bind(task.last_modified_at)
            .bind(to_json(&task.metadata)?)
            .bind(format_datetime(&task.created_at))
            .bind(format_datetime(&task.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<TaskInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM task_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskInstance>, RepositoryError> {
        let mut conditions = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(dag_ins_id) = filter.dag_ins_id {
            conditions.push("dag_ins_id = ?".to_string());
            binds.push(dag_ins_id.to_string());
        }
        if !filter.ids.is_empty() {
            conditions.push(format!("id IN ({})", placeholders(filter.ids.len())));
            binds.extend(filter.ids.iter().map(Uuid::to_string));
        }
        if !filter.statuses.is_empty() {
            conditions.push(format!("status IN ({})", placeholders(filter.statuses.len())));
            binds.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));
        }

        let mut sql = String::from("SELECT * FROM task_instances");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update_task(&self, task: &TaskInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE task_instances SET params = ?, status = ?, reason = ?, pre_checks = ?, results = ?, last_modified_at = ?, metadata = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(to_json(&task.params)?)
        .bind(task.status.as_str())
        .bind(task.reason.as_ref().map(to_json).transpose()?)
        .bind(to_json(&task.pre_checks)?)
        .bind(task.results.as_ref().map(to_json).transpose()?)
        .bind(task.last_modified_at)
        .bind(to_json(&task.metadata)?)
        .bind(format_datetime(&task.updated_at))
        .bind(task.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transitions spanning both
    // -----------------------------------------------------------------------

    async fn cancel_instance(
        &self,
        id: &Uuid,
        task_ids: &[Uuid],
        ended_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let result = sqlx::query(
            "UPDATE dag_instances SET status = ?, ended_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(DagInstanceStatus::Canceled.as_str())
        .bind(format_datetime(&ended_at))
        .bind(format_datetime(&ended_at))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        if !task_ids.is_empty() {
            let now = Utc::now();
            let sql = format!(
                "UPDATE task_instances SET status = ?, updated_at = ?, last_modified_at = ? WHERE id IN ({})",
                placeholders(task_ids.len())
            );
            let mut query = sqlx::query(&sql)
                .bind(TaskInstanceStatus::Canceled.as_str())
                .bind(format_datetime(&now))
                .bind(now_nanos(&now));
            for task_id in task_ids {
                query = query.bind(task_id.to_string());
            }
            query.execute(&mut *tx).await.map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn reset_for_retry(&self, id: &Uuid) -> Result<Vec<Uuid>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE dag_instances SET status = ?, reason = NULL, ended_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(DagInstanceStatus::Init.as_str())
        .bind(format_datetime(&now))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        let rows = sqlx::query(
            "SELECT id FROM task_instances WHERE dag_ins_id = ? AND status IN (?, ?) ORDER BY seq ASC",
        )
        .bind(id.to_string())
        .bind(TaskInstanceStatus::Failed.as_str())
        .bind(TaskInstanceStatus::Canceled.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;
        let reset = rows
            .iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(query_err)?;
                parse_uuid(&id)
            })
            .collect::<Result<Vec<Uuid>, RepositoryError>>()?;

        sqlx::query(
            "UPDATE task_instances SET status = ?, reason = NULL, updated_at = ?, last_modified_at = ?
             WHERE dag_ins_id = ? AND status IN (?, ?)",
        )
        .bind(TaskInstanceStatus::Init.as_str())
        .bind(format_datetime(&now))
        .bind(now_nanos(&now))
        .bind(id.to_string())
        .bind(TaskInstanceStatus::Failed.as_str())
        .bind(TaskInstanceStatus::Canceled.as_str())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(reset)
    }
}
