//! In-process lock table.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{DistributedLock, LockError};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Leases held in a `DashMap`, for a single process.
#[derive(Debug, Default)]
pub struct MemoryLock {
    leases: DashMap<String, Lease>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistributedLock for MemoryLock {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now && held.get().owner != owner {
                    return Err(LockError::Held {
                        key: key.to_string(),
                        owner: held.get().owner.clone(),
                    });
                }
                held.insert(lease);
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
            }
        }
        Ok(())
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.owner == owner && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LockError::NotOwner {
                key: key.to_string(),
            }),
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError> {
        match self.leases.remove_if(key, |_, lease| lease.owner == owner) {
            Some(_) => Ok(()),
            None => Err(LockError::NotOwner {
                key: key.to_string(),
            }),
        }
    }
}
