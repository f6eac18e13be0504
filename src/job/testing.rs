//! Wiring shared by the job layer's unit tests.

use super::delegate::{DelegateRegistry, JobDependencies};
use super::lock::{JobLock, StoreJobLock};
use super::scheduler::{SchedulerSettings, TaskScheduler};
use crate::security::SecurityContext;
use crate::store::{JobStore, SqliteJobStore};
use crate::sync::connector::ConnectorRegistry;
use crate::sync::identity::MemoryIdentityRepository;
use crate::sync::provisioning::InMemoryProvisioningManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Store, lock, scheduler and in-memory collaborators. Must be built inside
/// a tokio runtime.
pub(crate) struct TestHarness {
    temp_dir: TempDir,
    store: Arc<dyn JobStore>,
    lock: Arc<dyn JobLock>,
    identities: Arc<MemoryIdentityRepository>,
    provisioning: Arc<InMemoryProvisioningManager>,
    connectors: Arc<ConnectorRegistry>,
    scheduler: Arc<TaskScheduler>,
    deps: Arc<JobDependencies>,
    delegates: Arc<DelegateRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let lock: Arc<dyn JobLock> = Arc::new(StoreJobLock::new(store.clone(), "node-test"));
        let scheduler = Arc::new(TaskScheduler::new(
            lock.clone(),
            SecurityContext::new("admin"),
            Handle::current(),
            SchedulerSettings {
                interrupt_poll: Duration::from_millis(10),
                shutdown: CancellationToken::new(),
            },
        ));
        let identities = Arc::new(MemoryIdentityRepository::new());
        let provisioning = Arc::new(InMemoryProvisioningManager::new(identities.clone()));
        let connectors = Arc::new(ConnectorRegistry::new());
        let deps = Arc::new(JobDependencies::new(
            store.clone(),
            identities.clone(),
            provisioning.clone(),
            connectors.clone(),
            scheduler.clone(),
        ));

        Self {
            temp_dir,
            store,
            lock,
            identities,
            provisioning,
            connectors,
            scheduler,
            deps,
            delegates: Arc::new(DelegateRegistry::with_standard_delegates()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("jobs.db")
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn lock(&self) -> Arc<dyn JobLock> {
        self.lock.clone()
    }

    pub fn identities(&self) -> Arc<MemoryIdentityRepository> {
        self.identities.clone()
    }

    pub fn provisioning(&self) -> Arc<InMemoryProvisioningManager> {
        self.provisioning.clone()
    }

    pub fn connectors(&self) -> Arc<ConnectorRegistry> {
        self.connectors.clone()
    }

    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.scheduler.clone()
    }

    pub fn deps(&self) -> Arc<JobDependencies> {
        self.deps.clone()
    }

    pub fn delegates(&self) -> Arc<DelegateRegistry> {
        self.delegates.clone()
    }

    /// Only valid before `deps()` was handed out.
    pub fn deps_mut(&mut self) -> &mut JobDependencies {
        Arc::get_mut(&mut self.deps).expect("dependencies already shared")
    }

    /// Only valid before `delegates()` was handed out.
    pub fn delegates_mut(&mut self) -> &mut DelegateRegistry {
        Arc::get_mut(&mut self.delegates).expect("delegates already shared")
    }

    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }
}
