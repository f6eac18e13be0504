//! Cluster-wide mutual exclusion for jobs.

use super::key::JobKey;
use crate::store::JobStore;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// At most one holder per `(domain, job name)`. Acquisition never blocks:
/// callers that do not get the lock skip their work.
pub trait JobLock: Send + Sync {
    fn try_lock(&self, key: &JobKey) -> Result<bool>;

    /// Releasing a lock nobody holds is a no-op.
    fn unlock(&self, key: &JobKey) -> Result<()>;

    /// Probes by taking and releasing the lock. Storage errors read as
    /// "not locked" so that a flaky store never stalls the scheduler.
    fn is_locked(&self, key: &JobKey) -> bool {
        match self.try_lock(key) {
            Ok(true) => {
                if let Err(e) = self.unlock(key) {
                    debug!("Could not release probe lock on {}: {:#}", key, e);
                }
                false
            }
            Ok(false) => true,
            Err(e) => {
                debug!("Could not check lock on {}, assuming free: {:#}", key, e);
                false
            }
        }
    }
}

/// Lock rows in the shared job store, owned by this node.
pub struct StoreJobLock {
    store: Arc<dyn JobStore>,
    owner: String,
}

impl StoreJobLock {
    pub fn new(store: Arc<dyn JobStore>, owner: &str) -> Self {
        Self {
            store,
            owner: owner.to_string(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Drops locks this node still holds from a previous run.
    pub fn release_stale(&self) -> Result<usize> {
        let released = self.store.release_locks_owned_by(&self.owner)?;
        if released > 0 {
            info!("Released {} stale job locks owned by {}", released, self.owner);
        }
        Ok(released)
    }
}

impl JobLock for StoreJobLock {
    fn try_lock(&self, key: &JobKey) -> Result<bool> {
        self.store
            .try_acquire_lock(&key.domain, &key.name, &self.owner)
    }

    fn unlock(&self, key: &JobKey) -> Result<()> {
        self.store.release_lock(&key.domain, &key.name)
    }
}

/// Process-local lock, for single-node setups and tests.
#[derive(Default)]
pub struct InMemoryJobLock {
    held: DashMap<JobKey, ()>,
}

impl InMemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobLock for InMemoryJobLock {
    fn try_lock(&self, key: &JobKey) -> Result<bool> {
        Ok(self.held.insert(key.clone(), ()).is_none())
    }

    fn unlock(&self, key: &JobKey) -> Result<()> {
        self.held.remove(key);
        Ok(())
    }
}
