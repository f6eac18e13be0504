use super::actions::{PullActions, PushActions};
use super::connector::Connector;
use super::model::{ConflictResolutionAction, SyncResult};
use super::resource::ProvisioningSpec;
use std::sync::Arc;

/// State of one reconciliation run, shared with action hooks.
///
/// Owned by the single thread driving the run; `results` grows in the
/// order entities are handled.
pub struct SyncProfile<A: ?Sized> {
    pub domain: String,
    pub executor: String,
    pub task_key: String,
    pub task_name: String,
    pub spec: ProvisioningSpec,
    pub connector: Arc<dyn Connector>,
    pub actions: Vec<Arc<A>>,
    pub dry_run: bool,
    pub conflict_resolution: ConflictResolutionAction,
    pub results: Vec<SyncResult>,
}

pub type PullProfile = SyncProfile<dyn PullActions>;
pub type PushProfile = SyncProfile<dyn PushActions>;

impl<A: ?Sized> SyncProfile<A> {
    pub fn new(
        domain: &str,
        executor: &str,
        task_key: &str,
        task_name: &str,
        spec: ProvisioningSpec,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let conflict_resolution = spec.resource.conflict_resolution();
        Self {
            domain: domain.to_string(),
            executor: executor.to_string(),
            task_key: task_key.to_string(),
            task_name: task_name.to_string(),
            spec,
            connector,
            actions: Vec::new(),
            dry_run: false,
            conflict_resolution,
            results: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<Arc<A>>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn resource_key(&self) -> &str {
        &self.spec.resource.key
    }
}
