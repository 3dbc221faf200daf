//! In-process store implementing every repository trait.
//!
//! All tables sit behind one `RwLock`, so multi-row operations are atomic in
//! the same way the SQLite adapter's transactions are.

use std::collections::HashMap;
use std::sync::Arc;

use autoflow_types::cursor::IncrementalCursor;
use autoflow_types::dag::{Dag, DagVersion};
use autoflow_types::error::RepositoryError;
use autoflow_types::event::{DagInstanceEvent, EventType};
use autoflow_types::instance::{DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    CursorRepository, DagFilter, DagRepository, EventRepository, InstanceFilter,
    InstanceRepository, SortOrder, TaskFilter,
};

#[derive(Default)]
struct Tables {
    dags: HashMap<Uuid, Dag>,
    versions: HashMap<Uuid, DagVersion>,
    instances: HashMap<Uuid, DagInstance>,
    /// Insertion order is creation order.
    tasks: Vec<TaskInstance>,
    events: Vec<DagInstanceEvent>,
    cursors: HashMap<Uuid, IncrementalCursor>,
    next_event_id: i64,
}

/// Cloneable handle to a shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(mut items: Vec<T>, offset: Option<u32>, limit: Option<u32>) -> Vec<T> {
    let offset = offset.unwrap_or(0) as usize;
    if offset >= items.len() {
        return Vec::new();
    }
    items.drain(..offset);
    if let Some(limit) = limit {
        items.truncate(limit as usize);
    }
    items
}

fn instance_matches(filter: &InstanceFilter, ins: &DagInstance) -> bool {
    filter.dag_id.is_none_or(|id| ins.dag_id == id)
        && filter.status.is_none_or(|s| ins.status == s)
}

impl DagRepository for MemoryStore {
    async fn create_dag(&self, dag: &Dag) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        if t.dags.contains_key(&dag.id) {
            return Err(RepositoryError::Conflict(format!("dag {} exists", dag.id)));
        }
        t.dags.insert(dag.id, dag.clone());
        Ok(())
    }

    async fn update_dag(&self, dag: &Dag) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        match t.dags.get_mut(&dag.id) {
            Some(existing) => {
                *existing = dag.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_dag(&self, id: &Uuid) -> Result<Option<Dag>, RepositoryError> {
        Ok(self.tables.read().await.dags.get(id).cloned())
    }

    async fn list_dags(&self, filter: &DagFilter) -> Result<Vec<Dag>, RepositoryError> {
        let t = self.tables.read().await;
        let mut dags: Vec<Dag> = t
            .dags
            .values()
            .filter(|d| filter.status.is_none_or(|s| d.status == s))
            .filter(|d| filter.trigger.is_none_or(|k| d.trigger == k))
            .filter(|d| filter.removed.is_none_or(|r| d.removed == r))
            .cloned()
            .collect();
        dags.sort_by(|a, b| match filter.sort {
            SortOrder::Asc => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
            SortOrder::Desc => b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)),
        });
        Ok(page(dags, filter.offset, filter.limit))
    }

    async fn list_dags_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Dag>, RepositoryError> {
        let t = self.tables.read().await;
        Ok(ids.iter().filter_map(|id| t.dags.get(id).cloned()).collect())
    }

    async fn delete_dag(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut t = self.tables.write().await;
        let existed = t.dags.remove(id).is_some();
        t.versions.retain(|_, v| v.dag_id != *id);
        let doomed: Vec<Uuid> = t
            .instances
            .values()
            .filter(|i| i.dag_id == *id)
            .map(|i| i.id)
            .collect();
        t.instances.retain(|_, i| i.dag_id != *id);
        t.tasks.retain(|task| !doomed.contains(&task.dag_ins_id));
        t.events.retain(|e| !doomed.contains(&e.instance_id));
        t.cursors.remove(id);
        Ok(existed)
    }

    async fn create_version(&self, version: &DagVersion) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        if !t.dags.contains_key(&version.dag_id) {
            return Err(RepositoryError::NotFound);
        }
        t.versions.insert(version.id, version.clone());
        Ok(())
    }

    async fn get_version(&self, version_id: &Uuid) -> Result<Option<DagVersion>, RepositoryError> {
        Ok(self.tables.read().await.versions.get(version_id).cloned())
    }

    async fn list_versions(&self, dag_id: &Uuid) -> Result<Vec<DagVersion>, RepositoryError> {
        let t = self.tables.read().await;
        let mut versions: Vec<DagVersion> = t
            .versions
            .values()
            .filter(|v| v.dag_id == *dag_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }
}

impl InstanceRepository for MemoryStore {
    async fn create_instance(&self, instance: &DagInstance) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        if t.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!("instance {} exists", instance.id)));
        }
        t.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<DagInstance>, RepositoryError> {
        Ok(self.tables.read().await.instances.get(id).cloned())
    }

    async fn update_instance(&self, instance: &DagInstance) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        match t.instances.get_mut(&instance.id) {
            Some(existing) => {
                *existing = instance.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<DagInstance>, RepositoryError> {
        let t = self.tables.read().await;
        let mut items: Vec<DagInstance> = t
            .instances
            .values()
            .filter(|i| instance_matches(filter, i))
            .cloned()
            .collect();
        items.sort_by(|a, b| match filter.sort {
            SortOrder::Asc => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
            SortOrder::Desc => b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)),
        });
        Ok(page(items, filter.offset, filter.limit))
    }

    async fn count_instances(&self, filter: &InstanceFilter) -> Result<u64, RepositoryError> {
        let t = self.tables.read().await;
        Ok(t.instances
            .values()
            .filter(|i| instance_matches(filter, i))
            .count() as u64)
    }

    async fn save_tasks(&self, tasks: &[TaskInstance]) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        for task in tasks {
            match t.tasks.iter().position(|existing| existing.id == task.id) {
                Some(pos) => t.tasks[pos] = task.clone(),
                None => t.tasks.push(task.clone()),
            }
        }
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<TaskInstance>, RepositoryError> {
        let t = self.tables.read().await;
        Ok(t.tasks.iter().find(|task| task.id == *id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskInstance>, RepositoryError> {
        let t = self.tables.read().await;
        Ok(t.tasks.iter().filter(|task| filter.matches(task)).cloned().collect())
    }

    async fn update_task(&self, task: &TaskInstance) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        match t.tasks.iter_mut().find(|existing| existing.id == task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn cancel_instance(
        &self,
        id: &Uuid,
        task_ids: &[Uuid],
        ended_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut guard = self.tables.write().await;
        let t = &mut *guard;
        let instance = t.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        instance.status = DagInstanceStatus::Canceled;
        instance.ended_at = Some(ended_at);
        instance.updated_at = ended_at;
        for task in t.tasks.iter_mut().filter(|task| task_ids.contains(&task.id)) {
            task.transition(TaskInstanceStatus::Canceled);
        }
        Ok(())
    }

    async fn reset_for_retry(&self, id: &Uuid) -> Result<Vec<Uuid>, RepositoryError> {
        let mut guard = self.tables.write().await;
        let t = &mut *guard;
        let instance = t.instances.get_mut(id).ok_or(RepositoryError::NotFound)?;
        instance.status = DagInstanceStatus::Init;
        instance.reason = None;
        instance.ended_at = None;
        instance.updated_at = Utc::now();

        let mut reset = Vec::new();
        for task in t.tasks.iter_mut().filter(|task| {
            task.dag_ins_id == *id
                && matches!(task.status, TaskInstanceStatus::Failed | TaskInstanceStatus::Canceled)
        }) {
            task.transition(TaskInstanceStatus::Init);
            task.reason = None;
            reset.push(task.id);
        }
        Ok(reset)
    }
}

impl EventRepository for MemoryStore {
    async fn append_events(&self, events: &[DagInstanceEvent]) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        for event in events {
            t.next_event_id += 1;
            let mut event = event.clone();
            event.id = t.next_event_id;
            t.events.push(event);
        }
        Ok(())
    }

    async fn list_events(
        &self,
        instance_id: &Uuid,
        types: &[EventType],
    ) -> Result<Vec<DagInstanceEvent>, RepositoryError> {
        let t = self.tables.read().await;
        Ok(t.events
            .iter()
            .filter(|e| e.instance_id == *instance_id)
            .filter(|e| types.is_empty() || types.contains(&e.event_type))
            .cloned()
            .collect())
    }
}

impl CursorRepository for MemoryStore {
    async fn get_cursor(&self, dag_id: &Uuid) -> Result<Option<IncrementalCursor>, RepositoryError> {
        Ok(self.tables.read().await.cursors.get(dag_id).cloned())
    }

    async fn create_instance_with_cursor(
        &self,
        instance: &DagInstance,
        cursor: &IncrementalCursor,
    ) -> Result<(), RepositoryError> {
        let mut t = self.tables.write().await;
        if t.instances.contains_key(&instance.id) {
            return Err(RepositoryError::Conflict(format!("instance {} exists", instance.id)));
        }
        t.instances.insert(instance.id, instance.clone());
        t.cursors.insert(cursor.dag_id, cursor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::task::Task;
    use serde_json::{json, Map};

    fn task(id: &str) -> Task {
        Task {
            id: id.into(),
            name: String::new(),
            depend_on: vec![],
            action_name: "@test/noop".into(),
            timeout_secs: 60,
            params: Map::new(),
            pre_checks: Default::default(),
            steps: vec![],
            settings: None,
        }
    }

    fn instance(dag_id: Uuid) -> DagInstance {
        serde_json::from_value(json!({
            "id": Uuid::now_v7(),
            "dag_id": dag_id,
            "version_id": Uuid::now_v7(),
            "trigger": "manually",
            "status": "failed",
            "reason": "boom",
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
            "ended_at": Utc::now(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_reset_for_retry_resets_failed_and_canceled() {
        let store = MemoryStore::new();
        let ins = instance(Uuid::now_v7());
        store.create_instance(&ins).await.unwrap();

        let mut ok = TaskInstance::from_task(ins.id, &task("1"));
        ok.transition(TaskInstanceStatus::Success);
        let mut failed = TaskInstance::from_task(ins.id, &task("2"));
        failed.transition(TaskInstanceStatus::Failed);
        failed.reason = Some(json!("bad"));
        let mut canceled = TaskInstance::from_task(ins.id, &task("3"));
        canceled.transition(TaskInstanceStatus::Canceled);
        store
            .save_tasks(&[ok.clone(), failed.clone(), canceled.clone()])
            .await
            .unwrap();

        let reset = store.reset_for_retry(&ins.id).await.unwrap();
        assert_eq!(reset, vec![failed.id, canceled.id]);

        let reloaded = store.get_instance(&ins.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DagInstanceStatus::Init);
        assert!(reloaded.reason.is_none());
        assert!(reloaded.ended_at.is_none());

        let failed = store.get_task(&failed.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskInstanceStatus::Init);
        assert!(failed.reason.is_none());
        let ok = store.get_task(&ok.id).await.unwrap().unwrap();
        assert_eq!(ok.status, TaskInstanceStatus::Success);
    }

    #[tokio::test]
    async fn test_events_get_increasing_ids() {
        let store = MemoryStore::new();
        let id = Uuid::now_v7();
        store
            .append_events(&[
                DagInstanceEvent::variable(id, "__1", json!(1), 1),
                DagInstanceEvent::task_status(id, "@a", "1", "success", json!(null), 2),
            ])
            .await
            .unwrap();
        let events = store.list_events(&id, &[]).await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        let only_vars = store.list_events(&id, &[EventType::Variable]).await.unwrap();
        assert_eq!(only_vars.len(), 1);
    }

    #[tokio::test]
    async fn test_task_filter_by_status() {
        let store = MemoryStore::new();
        let ins_id = Uuid::now_v7();
        let mut blocked = TaskInstance::from_task(ins_id, &task("1"));
        blocked.transition(TaskInstanceStatus::Blocked);
        let pending = TaskInstance::from_task(ins_id, &task("2"));
        store.save_tasks(&[blocked.clone(), pending]).await.unwrap();

        let filter = TaskFilter {
            ids: vec![blocked.id],
            statuses: vec![TaskInstanceStatus::Blocked],
            ..TaskFilter::for_instance(ins_id)
        };
        let found = store.list_tasks(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_id, "1");
    }
}
