//! Cross-instance coordination.
//!
//! - `DistributedLock`: named lease with TTL (port, adapters in
//!   [`memory`] and autoflow-infra)
//! - [`spawn_lease_renewal`]: background renewal bound to a cancellation token
//! - [`incremental::IncrementalSync`]: cursor-guarded instance creation

pub mod incremental;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors raised by lock adapters.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock '{key}' is held by '{owner}'")]
    Held { key: String, owner: String },

    #[error("lock '{key}' is not held by this owner")]
    NotOwner { key: String },

    #[error("lock backend: {0}")]
    Backend(String),
}

/// Named lease. An expired lease may be taken by any owner.
pub trait DistributedLock: Send + Sync {
    fn try_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), LockError>> + Send;

    /// Extend a lease this owner still holds.
    fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), LockError>> + Send;

    fn unlock(
        &self,
        key: &str,
        owner: &str,
    ) -> impl std::future::Future<Output = Result<(), LockError>> + Send;
}

/// Renew `key` every `interval` until `token` is cancelled or a renewal fails.
pub fn spawn_lease_renewal<L>(
    lock: Arc<L>,
    key: String,
    owner: String,
    ttl: Duration,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    L: DistributedLock + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(%key, "lease renewal stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = lock.renew(&key, &owner, ttl).await {
                tracing::warn!(%key, %owner, error = %e, "lease renewal failed");
                break;
            }
            tracing::debug!(%key, "lease renewed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryLock;
    use super::*;

    #[tokio::test]
    async fn test_renewal_keeps_lease_alive() {
        let lock = Arc::new(MemoryLock::new());
        lock.try_lock("k", "a", Duration::from_millis(60)).await.unwrap();

        let token = CancellationToken::new();
        let handle = spawn_lease_renewal(
            lock.clone(),
            "k".into(),
            "a".into(),
            Duration::from_millis(60),
            Duration::from_millis(20),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            lock.try_lock("k", "b", Duration::from_secs(1)).await,
            Err(LockError::Held { .. })
        ));

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        lock.try_lock("k", "b", Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_stops_when_lease_lost() {
        let lock = Arc::new(MemoryLock::new());
        lock.try_lock("k", "a", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.try_lock("k", "b", Duration::from_secs(5)).await.unwrap();

        let handle = spawn_lease_renewal(
            lock,
            "k".into(),
            "a".into(),
            Duration::from_secs(1),
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
