//! Lease-based scheduling locks
//!
//! Scheduling for a scaling group `G` is serialized through the lock key
//! `schedule.G`. The contract is lease-based: a holder that dies stops
//! renewing and the lease expires, so no lock is held forever. The shipped
//! implementation is in-process; a deployment spanning multiple manager
//! processes plugs a distributed backend into the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock key for a scaling group's scheduling loop
pub fn schedule_key(scaling_group: &str) -> String {
    format!("schedule.{}", scaling_group)
}

/// Lease-based lock contract
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Try to take the lock; `None` when another holder's lease is live
    async fn try_acquire(&self, key: &str, lease: Duration) -> Option<LeaseGuard>;
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: Uuid,
    expires_at: Instant,
}

/// In-process lease lock table
#[derive(Debug, Default)]
pub struct LockService {
    table: Arc<DashMap<String, LeaseEntry>>,
}

impl LockService {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every lease held by the given guard owner (shutdown path)
    pub fn release_all(&self) {
        self.table.clear();
    }
}

#[async_trait]
impl LeaseLock for LockService {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Option<LeaseGuard> {
        let holder = Uuid::new_v4();
        let now = Instant::now();
        let mut acquired = false;
        self.table
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now {
                    // Previous holder's lease expired without release
                    warn!("lock {} lease expired; taking over", key);
                    entry.holder = holder;
                    entry.expires_at = now + lease;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LeaseEntry { holder, expires_at: now + lease }
            });
        if acquired {
            debug!("acquired lock {} for {:?}", key, lease);
            Some(LeaseGuard {
                key: key.to_string(),
                holder,
                table: Arc::clone(&self.table),
            })
        } else {
            None
        }
    }
}

/// Held lease; releases on drop when still the holder
#[derive(Debug)]
pub struct LeaseGuard {
    key: String,
    holder: Uuid,
    table: Arc<DashMap<String, LeaseEntry>>,
}

impl LeaseGuard {
    /// The lock key this guard holds
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // Only remove the entry if the lease was not taken over after expiry
        self.table
            .remove_if(&self.key, |_, entry| entry.holder == self.holder);
    }
}
