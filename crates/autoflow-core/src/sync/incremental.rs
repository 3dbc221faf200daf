//! Cursor-guarded instance creation for incremental ingestion.
//!
//! Every scheduled run of one Dag shares a cursor `{dag_id, field, value}`.
//! A run only produces an instance when the observed value moves the cursor,
//! and the instance and the advanced cursor are written together while the
//! Dag's lease is held.

use std::sync::Arc;
use std::time::Duration;

use autoflow_types::config::LockConfig;
use autoflow_types::cursor::IncrementalCursor;
use autoflow_types::instance::DagInstance;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::FlowError;
use crate::repository::CursorRepository;

use super::{spawn_lease_renewal, DistributedLock};

pub struct IncrementalSync<R, L> {
    repo: Arc<R>,
    lock: Arc<L>,
    owner: String,
    ttl: Duration,
    renew_interval: Duration,
}

impl<R, L> IncrementalSync<R, L>
where
    R: CursorRepository + 'static,
    L: DistributedLock + 'static,
{
    pub fn new(repo: Arc<R>, lock: Arc<L>, config: &LockConfig) -> Self {
        Self {
            repo,
            lock,
            owner: format!("autoflow-{}", Uuid::now_v7()),
            ttl: Duration::from_secs(config.ttl_secs),
            renew_interval: Duration::from_secs(config.renew_interval_secs),
        }
    }

    pub fn lock_key(dag_id: &Uuid) -> String {
        format!("incremental:{dag_id}")
    }

    /// Create `instance` if `value` advances the cursor of its Dag.
    ///
    /// Returns `None` when the cursor already holds `value`.
    pub async fn start(
        &self,
        instance: DagInstance,
        field: &str,
        value: &str,
    ) -> Result<Option<DagInstance>, FlowError> {
        let key = Self::lock_key(&instance.dag_id);
        self.lock.try_lock(&key, &self.owner, self.ttl).await?;

        let token = CancellationToken::new();
        let renewal = spawn_lease_renewal(
            self.lock.clone(),
            key.clone(),
            self.owner.clone(),
            self.ttl,
            self.renew_interval,
            token.clone(),
        );

        let result = self.advance(instance, field, value).await;

        token.cancel();
        if let Err(e) = renewal.await {
            tracing::warn!(%key, error = %e, "lease renewal task panicked");
        }
        if let Err(e) = self.lock.unlock(&key, &self.owner).await {
            tracing::warn!(%key, error = %e, "failed to release incremental lock");
        }
        result
    }

    async fn advance(
        &self,
        instance: DagInstance,
        field: &str,
        value: &str,
    ) -> Result<Option<DagInstance>, FlowError> {
        let current = self.repo.get_cursor(&instance.dag_id).await?;
        if current
            .as_ref()
            .is_some_and(|cursor| !cursor.advances_to(field, value))
        {
            tracing::debug!(dag_id = %instance.dag_id, field, value, "cursor unchanged, nothing to run");
            return Ok(None);
        }

        let cursor = IncrementalCursor::new(instance.dag_id, field, value);
        self.repo.create_instance_with_cursor(&instance, &cursor).await?;
        tracing::info!(
            dag_id = %instance.dag_id,
            dag_ins_id = %instance.id,
            field,
            value,
            "incremental instance created"
        );
        Ok(Some(instance))
    }
}
