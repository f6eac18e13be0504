use super::context::JobContext;
use super::delegates::{
    self, CertificationRequester, Command, LogCertificationRequester, LogNotificationSender,
    NotificationSender, ReportDelegate,
};
use super::error::JobError;
use super::scheduler::TaskScheduler;
use crate::audit::SideEffects;
use crate::store::{JobStore, Task, TaskExec, TaskType};
use crate::sync::actions::{PullActions, PushActions};
use crate::sync::connector::ConnectorManager;
use crate::sync::correlation::CorrelationRule;
use crate::sync::identity::IdentityRepository;
use crate::sync::provisioning::ProvisioningManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Body of a task job.
pub trait TaskJobDelegate: Send + Sync {
    /// Runs the task. The returned string becomes the execution message.
    /// `task` may be mutated; it is saved after the run either way.
    fn execute(&self, task: &mut Task, ctx: &JobContext) -> Result<String, JobError>;

    /// Whether the execution record is persisted.
    fn has_to_be_registered(&self, task: &Task, _exec: &TaskExec) -> bool {
        task.save_execs
    }
}

/// Named implementations of a pluggable capability.
pub struct ImplementationRegistry<T: ?Sized> {
    implementations: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Default for ImplementationRegistry<T> {
    fn default() -> Self {
        Self {
            implementations: HashMap::new(),
        }
    }
}

impl<T: ?Sized> ImplementationRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, implementation: Arc<T>) {
        self.implementations.insert(key.to_string(), implementation);
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.implementations.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.implementations.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.implementations.keys().map(String::as_str).collect();
        keys.sort();
        keys
    }

    /// Resolves every key, failing on the first unknown one.
    pub fn resolve_all(&self, keys: &[String]) -> Result<Vec<Arc<T>>, JobError> {
        keys.iter()
            .map(|key| {
                self.get(key)
                    .ok_or_else(|| JobError::NotFound(format!("implementation {}", key)))
            })
            .collect()
    }
}

/// Collaborators available to every job body.
pub struct JobDependencies {
    pub store: Arc<dyn JobStore>,
    pub identities: Arc<dyn IdentityRepository>,
    pub provisioning: Arc<dyn ProvisioningManager>,
    pub connectors: Arc<dyn ConnectorManager>,
    pub side_effects: SideEffects,
    pub scheduler: Arc<TaskScheduler>,
    pub pull_actions: ImplementationRegistry<dyn PullActions>,
    pub push_actions: ImplementationRegistry<dyn PushActions>,
    pub correlation_rules: ImplementationRegistry<dyn CorrelationRule>,
    pub commands: ImplementationRegistry<dyn Command>,
    pub report_delegates: ImplementationRegistry<dyn ReportDelegate>,
    pub certification: Arc<dyn CertificationRequester>,
    pub notification_sender: Arc<dyn NotificationSender>,
}

impl JobDependencies {
    /// Dependencies with the built-in commands and report delegates, and
    /// logging implementations of the outbound capabilities.
    pub fn new(
        store: Arc<dyn JobStore>,
        identities: Arc<dyn IdentityRepository>,
        provisioning: Arc<dyn ProvisioningManager>,
        connectors: Arc<dyn ConnectorManager>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        let mut commands = ImplementationRegistry::new();
        delegates::register_builtin_commands(&mut commands);
        let mut report_delegates = ImplementationRegistry::new();
        delegates::register_builtin_reportlets(&mut report_delegates);

        Self {
            side_effects: SideEffects::from_store(store.clone()),
            store,
            identities,
            provisioning,
            connectors,
            scheduler,
            pull_actions: ImplementationRegistry::new(),
            push_actions: ImplementationRegistry::new(),
            correlation_rules: ImplementationRegistry::new(),
            commands,
            report_delegates,
            certification: Arc::new(LogCertificationRequester),
            notification_sender: Arc::new(LogNotificationSender),
        }
    }
}

pub type DelegateFactory =
    Box<dyn Fn(&Arc<JobDependencies>) -> Arc<dyn TaskJobDelegate> + Send + Sync>;

/// Delegate constructors by key. Each delegate is built on first use and
/// reused afterwards, so state it caches survives across runs.
pub struct DelegateRegistry {
    factories: HashMap<String, DelegateFactory>,
    instances: Mutex<HashMap<String, Arc<dyn TaskJobDelegate>>>,
}

impl Default for DelegateRegistry {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every delegate shipped with the crate.
    pub fn with_standard_delegates() -> Self {
        let mut registry = Self::new();
        delegates::register_standard_delegates(&mut registry);
        registry
    }

    pub fn register(&mut self, key: &str, factory: DelegateFactory) {
        self.factories.insert(key.to_string(), factory);
        self.instances.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn get(
        &self,
        key: &str,
        deps: &Arc<JobDependencies>,
    ) -> Option<Arc<dyn TaskJobDelegate>> {
        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.get(key) {
            return Some(instance.clone());
        }
        let factory = self.factories.get(key)?;
        debug!("Instantiating task delegate {}", key);
        let instance = factory(deps);
        instances.insert(key.to_string(), instance.clone());
        Some(instance)
    }

    /// Delegate used when a task does not name one.
    pub fn default_delegate_for(task_type: TaskType) -> Option<&'static str> {
        match task_type {
            TaskType::Pull => Some(delegates::PULL_JOB_DELEGATE),
            TaskType::Push => Some(delegates::PUSH_JOB_DELEGATE),
            TaskType::LiveSync => Some(delegates::LIVE_SYNC_JOB_DELEGATE),
            TaskType::Macro => Some(delegates::MACRO_JOB_DELEGATE),
            TaskType::Scheduled => None,
        }
    }

    /// Key of the delegate that runs `task`.
    pub fn delegate_key_for(task: &Task) -> Option<String> {
        task.job_delegate
            .clone()
            .or_else(|| Self::default_delegate_for(task.task_type()).map(str::to_string))
    }
}
