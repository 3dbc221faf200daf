//! Short-lived cache of materialized task views, keyed by instance id.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use autoflow_types::instance::TaskInstance;

struct Entry {
    tasks: Vec<TaskInstance>,
    stored_at: Instant,
}

pub struct ViewCache {
    entries: DashMap<Uuid, Entry>,
    ttl: Duration,
}

impl ViewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Cached views of `dag_ins_id`, if present and not expired.
    pub fn get(&self, dag_ins_id: &Uuid) -> Option<Vec<TaskInstance>> {
        if let Some(entry) = self.entries.get(dag_ins_id) {
            if entry.stored_at.elapsed() < self.ttl {
                return Some(entry.tasks.clone());
            }
        }
        self.entries
            .remove_if(dag_ins_id, |_, entry| entry.stored_at.elapsed() >= self.ttl);
        None
    }

    pub fn insert(&self, dag_ins_id: Uuid, tasks: Vec<TaskInstance>) {
        self.entries.insert(
            dag_ins_id,
            Entry {
                tasks,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the cached views of an instance whose tasks changed.
    pub fn invalidate(&self, dag_ins_id: &Uuid) {
        self.entries.remove(dag_ins_id);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_types::task::Task;

    fn task(id: &str) -> TaskInstance {
        let task = Task {
            id: id.into(),
            name: String::new(),
            depend_on: vec![],
            action_name: "@test/a".into(),
            timeout_secs: 0,
            params: Default::default(),
            pre_checks: Default::default(),
            steps: vec![],
            settings: None,
        };
        TaskInstance::from_task(Uuid::nil(), &task)
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let id = Uuid::now_v7();
        cache.insert(id, vec![task("1"), task("2")]);
        let hit = cache.get(&id).unwrap();
        assert_eq!(hit.len(), 2);
        assert_eq!(hit[1].task_id, "2");
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = ViewCache::new(Duration::ZERO);
        let id = Uuid::now_v7();
        cache.insert(id, vec![task("1")]);
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());

        cache.insert(id, vec![task("1")]);
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let id = Uuid::now_v7();
        cache.insert(id, vec![task("1")]);
        cache.invalidate(&id);
        assert!(cache.get(&id).is_none());
    }
}
