use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use syncope_scheduler::job::{
    DelegateRegistry, JobDependencies, JobKey, JobLock, JobManager, JobManagerSettings,
    SchedulerSettings, StoreJobLock, TaskScheduler,
};
use syncope_scheduler::security::SecurityContext;
use syncope_scheduler::store::{JobStore, SqliteJobStore, Task, TaskExec};
use syncope_scheduler::sync::connector::{ConnectorRegistry, InMemoryConnector};
use syncope_scheduler::sync::identity::MemoryIdentityRepository;
use syncope_scheduler::sync::provisioning::InMemoryProvisioningManager;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub const DOMAIN: &str = "Master";
pub const ADMIN: &str = "admin";

/// One scheduler node. Must be built inside a multi-threaded tokio runtime.
pub struct TestEnv {
    temp_dir: TempDir,
    pub store: Arc<dyn JobStore>,
    pub identities: Arc<MemoryIdentityRepository>,
    pub provisioning: Arc<InMemoryProvisioningManager>,
    pub connectors: Arc<ConnectorRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub manager: JobManager,
}

fn scheduler_over(store: &Arc<dyn JobStore>, node: &str) -> Arc<TaskScheduler> {
    let lock: Arc<dyn JobLock> = Arc::new(StoreJobLock::new(store.clone(), node));
    Arc::new(TaskScheduler::new(
        lock,
        SecurityContext::new(ADMIN),
        Handle::current(),
        SchedulerSettings {
            interrupt_poll: Duration::from_millis(20),
            shutdown: CancellationToken::new(),
        },
    ))
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let scheduler = scheduler_over(&store, "node-a");
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
        let manager = JobManager::new(
            deps,
            Arc::new(DelegateRegistry::with_standard_delegates()),
            JobManagerSettings::default(),
        );

        Self {
            temp_dir,
            store,
            identities,
            provisioning,
            connectors,
            scheduler,
            manager,
        }
    }

    /// Another node's scheduler over the same job database.
    pub fn second_node(&self) -> Arc<TaskScheduler> {
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(self.temp_dir.path().join("jobs.db")).unwrap());
        scheduler_over(&store, "node-b")
    }

    pub fn register_connector(&self, resource: &str) -> Arc<InMemoryConnector> {
        let connector = Arc::new(InMemoryConnector::new());
        self.connectors.register(resource, connector.clone());
        connector
    }

    pub fn save_task(&self, task: &Task) {
        self.store.save_task(DOMAIN, task).unwrap();
    }

    pub fn task(&self, key: &str) -> Task {
        self.store.find_task(DOMAIN, key).unwrap().unwrap()
    }

    pub fn execs(&self, task_key: &str) -> Vec<TaskExec> {
        self.store.find_execs(DOMAIN, task_key, 100).unwrap()
    }

    /// Runs the task now and waits until its job is no longer running.
    pub async fn run_task(&self, task_key: &str, dry_run: bool) {
        let before = self.task(task_key).last_exec;
        let key = self
            .manager
            .execute_task(DOMAIN, task_key, None, ADMIN, dry_run, Map::new())
            .unwrap();
        // Probing the lock before the body took it could make the fire skip,
        // so only look at it once the task's last execution was stamped.
        self.wait_until(|| self.task(task_key).last_exec != before).await;
        self.wait_until(|| !self.manager.is_running(&key)).await;
    }

    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    pub fn job_key(&self, name: &str) -> JobKey {
        JobKey::new(DOMAIN, name)
    }
}
