use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncope_scheduler::job::{JobBody, JobContext, JobError, JobKind};
use syncope_scheduler::store::{Task, TaskSpec};
use syncope_scheduler::sync::identity::Subject;
use syncope_scheduler::sync::resource::{
    ExternalResource, IntAttr, MappingItem, Provision, ProvisioningSpec, PullMode, PullSpec,
    PushSpec,
};
use syncope_scheduler::sync::{SubjectType, TraceLevel, UnmatchingRule};

use super::TestEnv;

pub const RESOURCE: &str = "ldap";
pub const ACCOUNT: &str = "__ACCOUNT__";

/// A resource provisioning users, keyed on `__NAME__` mapped to the username.
pub fn ldap_resource(trace_level: TraceLevel) -> ExternalResource {
    let mut resource = ExternalResource::new(RESOURCE);
    resource.trace_level = trace_level;
    resource.provisions.push(Provision::new(
        SubjectType::User,
        ACCOUNT,
        MappingItem::new("__NAME__", IntAttr::Username),
    ));
    resource
}

pub fn push_task(key: &str, provisioning: ProvisioningSpec) -> Task {
    Task::new(key, &format!("push {key}"), TaskSpec::Push(PushSpec { provisioning }))
}

pub fn pull_task(key: &str, provisioning: ProvisioningSpec) -> Task {
    Task::new(
        key,
        &format!("pull {key}"),
        TaskSpec::Pull(PullSpec {
            provisioning,
            pull_mode: PullMode::FullReconciliation,
            reconciliation_filter: None,
        }),
    )
}

pub fn push_spec(rule: UnmatchingRule, trace_level: TraceLevel) -> ProvisioningSpec {
    let mut spec = ProvisioningSpec::new(ldap_resource(trace_level));
    spec.unmatching_rule = rule;
    spec
}

/// Inserts users `u1..=count` named `user1..=count`.
pub fn seed_users(env: &TestEnv, count: usize) {
    for i in 1..=count {
        env.identities
            .insert(Subject::new(SubjectType::User, &format!("u{i}"), &format!("user{i}")));
    }
}

/// Body counting its runs. Holds the job for `hold` and then fails when
/// `fail` is set.
pub struct CountingBody {
    pub runs: Arc<AtomicUsize>,
    pub hold: Duration,
    pub fail: bool,
}

impl CountingBody {
    pub fn new(hold: Duration) -> Self {
        Self {
            runs: Arc::new(AtomicUsize::new(0)),
            hold,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl JobBody for CountingBody {
    fn kind(&self) -> JobKind {
        JobKind::Task
    }

    fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.hold);
        if self.fail {
            return Err(JobError::ExecutionFailed("boom".to_string()));
        }
        Ok(())
    }
}
