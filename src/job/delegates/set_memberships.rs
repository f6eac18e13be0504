//! Group memberships discovered during a pull, applied once the pull ends
//! so that every referenced group exists by then.

use crate::job::context::{JobContext, JobExecutionContext, MEMBERSHIPS};
use crate::job::delegate::JobDependencies;
use crate::job::envelope::{JobBody, JobKind};
use crate::job::error::JobError;
use crate::job::key::JobKey;
use crate::sync::identity::SubjectPatch;
use crate::sync::model::SubjectType;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resource the memberships came from; it gets no propagation.
pub const SOURCE_RESOURCE: &str = "sourceResource";

pub fn set_memberships_job_name(task_key: &str) -> String {
    format!("setMembershipsJob{}", task_key)
}

pub struct SetMembershipsJob {
    deps: Arc<JobDependencies>,
}

impl SetMembershipsJob {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self { deps }
    }

    /// Schedules a one-shot run applying `memberships` (user key → group
    /// keys). A later pull of the same task replaces a run still pending.
    pub fn schedule(
        deps: &Arc<JobDependencies>,
        domain: &str,
        task_key: &str,
        executor: &str,
        resource: &str,
        memberships: &BTreeMap<String, BTreeSet<String>>,
    ) -> JobKey {
        let key = JobKey::new(domain, &set_memberships_job_name(task_key));
        let execution = JobExecutionContext::new(key.clone(), executor)
            .with_data(MEMBERSHIPS, json!(memberships))
            .with_data(SOURCE_RESOURCE, json!(resource));
        let envelope = deps
            .scheduler
            .envelope(Arc::new(SetMembershipsJob::new(deps.clone())), execution);
        deps.scheduler.schedule_at(envelope, Utc::now());
        debug!("Scheduled memberships of {} users", memberships.len());
        key
    }
}

impl JobBody for SetMembershipsJob {
    fn kind(&self) -> JobKind {
        JobKind::SetMemberships
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let memberships: BTreeMap<String, BTreeSet<String>> = ctx
            .execution
            .data
            .get(MEMBERSHIPS)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| JobError::Validation(format!("invalid memberships: {}", e)))?
            .unwrap_or_default();
        let excluded: Vec<String> = ctx
            .execution
            .data_str(SOURCE_RESOURCE)
            .map(|r| vec![r.to_string()])
            .unwrap_or_default();

        let mut applied = 0;
        for (user_key, groups) in memberships {
            ctx.check_cancelled()?;
            let mut patch = SubjectPatch::new(SubjectType::User, &user_key);
            patch.memberships_to_add = groups;
            match self.deps.provisioning.update(&patch, &excluded) {
                Ok(_) => applied += 1,
                Err(e) => warn!("Could not set memberships of user {}: {}", user_key, e),
            }
        }
        info!("Memberships set for {} users", applied);
        Ok(())
    }
}

/// Reads back the memberships payload, for introspection.
pub fn memberships_of(execution: &JobExecutionContext) -> Option<&Value> {
    execution.data.get(MEMBERSHIPS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::TestHarness;
    use crate::sync::identity::{IdentityRepository, Subject};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_run_adds_memberships() {
        let harness = TestHarness::new();
        let identities = harness.identities();
        identities.insert(Subject::new(SubjectType::User, "u1", "alice").with_resource("ldap"));
        identities.insert(Subject::new(SubjectType::Group, "g1", "staff"));

        let memberships = BTreeMap::from([("u1".to_string(), BTreeSet::from(["g1".to_string()]))]);
        let deps = harness.deps();
        let key = SetMembershipsJob::schedule(&deps, "Master", "pull1", "admin", "ldap", &memberships);
        assert_eq!(key.name, "setMembershipsJobpull1");
        let envelope = harness.scheduler().envelope_of(&key).unwrap();
        assert!(memberships_of(envelope.execution()).is_some());

        harness
            .wait_until(|| {
                identities
                    .find(SubjectType::User, "u1")
                    .unwrap()
                    .is_some_and(|u| u.memberships.contains("g1"))
            })
            .await;
        let update = &harness.provisioning().calls_of("update")[0];
        assert_eq!(update.subject, "u1");
    }
}
