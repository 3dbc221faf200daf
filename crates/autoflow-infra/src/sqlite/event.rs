//! SQLite event log implementation.
//!
//! Implements `EventRepository` from `autoflow-core`. The autoincrement id
//! assigned on append is the replay order.

use autoflow_core::repository::EventRepository;
use autoflow_types::error::RepositoryError;
use autoflow_types::event::{DagInstanceEvent, EventType};
use sqlx::Row;
use uuid::Uuid;

use super::codec::{from_json, parse_enum, parse_uuid, placeholders, query_err, to_json};
use super::store::SqliteStore;

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DagInstanceEvent, RepositoryError> {
    let get = |col: &str| -> Result<String, RepositoryError> { row.try_get(col).map_err(query_err) };
    Ok(DagInstanceEvent {
        id: row.try_get("id").map_err(query_err)?,
        event_type: parse_enum(&get("event_type")?)?,
        instance_id: parse_uuid(&get("instance_id")?)?,
        operator: get("operator")?,
        task_id: get("task_id")?,
        status: get("status")?,
        name: get("name")?,
        data: from_json(&get("data")?, "data")?,
        visibility: parse_enum(&get("visibility")?)?,
        timestamp: row.try_get("timestamp").map_err(query_err)?,
    })
}

impl EventRepository for SqliteStore {
    async fn append_events(&self, events: &[DagInstanceEvent]) -> Result<(), RepositoryError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        for event in events {
            sqlx::query(
                "INSERT INTO dag_instance_events (event_type, instance_id, operator, task_id, status, name, data, visibility, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.event_type.as_str())
            .bind(event.instance_id.to_string())
            .bind(&event.operator)
            .bind(&event.task_id)
            .bind(&event.status)
            .bind(&event.name)
            .bind(to_json(&event.data)?)
            .bind(event.visibility.as_str())
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }
        tx.commit().await.map_err(query_err)?;
        tracing::trace!(count = events.len(), "events appended");
        Ok(())
    }

    async fn list_events(
        &self,
        instance_id: &Uuid,
        types: &[EventType],
    ) -> Result<Vec<DagInstanceEvent>, RepositoryError> {
        let mut sql = String::from("SELECT * FROM dag_instance_events WHERE instance_id = ?");
        if !types.is_empty() {
            sql.push_str(&format!(" AND event_type IN ({})", placeholders(types.len())));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut query = sqlx::query(&sql).bind(instance_id.to_string());
        for event_type in types {
            query = query.bind(event_type.as_str());
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;
        rows.iter().map(event_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_pool;
    use autoflow_core::repository::{DagRepository, InstanceRepository};
    use autoflow_types::dag::Dag;
    use autoflow_types::event::Visibility;
    use autoflow_types::instance::DagInstance;
    use serde_json::json;

    async fn store_with_instance() -> (SqliteStore, Uuid) {
        let store = SqliteStore::new(test_pool().await);
        let dag = Dag::new("events", Vec::new(), Vec::new());
        store.create_dag(&dag).await.unwrap();
        let ins = DagInstance::for_dag(&dag);
        store.create_instance(&ins).await.unwrap();
        (store, ins.id)
    }

    #[tokio::test]
    async fn test_events_keep_append_order() {
        let (store, id) = store_with_instance().await;
        store
            .append_events(&[
                DagInstanceEvent::task_status(id, "@trigger/manual", "0", "success", json!({}), 10),
                DagInstanceEvent::variable(id, "__0", json!({"a": 1}), 11),
            ])
            .await
            .unwrap();
        store
            .append_events(&[DagInstanceEvent::trace(id, "__1_trace", json!({"ms": 4}), 12)])
            .await
            .unwrap();

        let events = store.list_events(&id, &[]).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events[0].event_type, EventType::TaskStatus);
        assert_eq!(events[0].operator, "@trigger/manual");
        assert_eq!(events[1].data, json!({"a": 1}));
        assert_eq!(events[2].visibility, Visibility::Public);
    }

    #[tokio::test]
    async fn test_list_events_by_type() {
        let (store, id) = store_with_instance().await;
        store
            .append_events(&[
                DagInstanceEvent::task_status(id, "@test/a", "1", "running", json!(null), 1),
                DagInstanceEvent::variable(id, "__1", json!(2), 2),
                DagInstanceEvent::trace(id, "__1_trace", json!({}), 3),
            ])
            .await
            .unwrap();

        let vars = store.list_events(&id, &[EventType::Variable]).await.unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "__1");

        let other = store.list_events(&Uuid::now_v7(), &[]).await.unwrap();
        assert!(other.is_empty());
    }
}
