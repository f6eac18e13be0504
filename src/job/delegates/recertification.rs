//! Periodic identity recertification sweep.
//!
//! Users whose last recertification is older than the configured number of
//! days are handed to a [`CertificationRequester`].

use crate::job::context::JobContext;
use crate::job::delegate::{JobDependencies, TaskJobDelegate};
use crate::job::error::JobError;
use crate::store::{Task, TaskExec};
use crate::sync::identity::{page_count, Subject};
use crate::sync::model::SubjectType;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RECERTIFICATION_INTERVAL_CONF: &str = "identity.recertification.day.interval";
pub const DISABLED_MESSAGE: &str = "Recertification disabled";
const PAGE_SIZE: usize = 10;

/// Starts the recertification of one user.
pub trait CertificationRequester: Send + Sync {
    fn request_certify(&self, domain: &str, user: &Subject) -> anyhow::Result<()>;
}

pub struct LogCertificationRequester;

impl CertificationRequester for LogCertificationRequester {
    fn request_certify(&self, domain: &str, user: &Subject) -> anyhow::Result<()> {
        info!("Recertification requested for {} in {}", user.name, domain);
        Ok(())
    }
}

pub struct IdentityRecertification {
    deps: Arc<JobDependencies>,
    /// Interval in days per domain, read on first run. `None` means disabled.
    intervals: DashMap<String, Option<i64>>,
}

impl IdentityRecertification {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self {
            deps,
            intervals: DashMap::new(),
        }
    }

    fn interval(&self, domain: &str) -> Result<Option<i64>, JobError> {
        if let Some(cached) = self.intervals.get(domain) {
            return Ok(*cached);
        }
        let raw = self
            .deps
            .store
            .get_conf_param(domain, RECERTIFICATION_INTERVAL_CONF)?;
        let interval = match raw {
            Some(value) => match value.trim().parse::<i64>() {
                Ok(days) => Some(days),
                Err(_) => {
                    warn!("Invalid {} '{}', recertification disabled", RECERTIFICATION_INTERVAL_CONF, value);
                    None
                }
            },
            None => None,
        };
        self.intervals.insert(domain.to_string(), interval);
        Ok(interval)
    }

    fn is_due(user: &Subject, days: i64) -> bool {
        match user.last_recertification {
            None => true,
            Some(last) => last + Duration::days(days) < Utc::now(),
        }
    }
}

impl TaskJobDelegate for IdentityRecertification {
    fn execute(&self, _task: &mut Task, ctx: &JobContext) -> Result<String, JobError> {
        let domain = ctx.domain();
        let Some(days) = self.interval(domain)? else {
            debug!("No recertification interval for {}", domain);
            return Ok(DISABLED_MESSAGE.to_string());
        };

        let identities = &self.deps.identities;
        let total = identities.count(SubjectType::User)?;
        let mut requested = 0;
        for page in 1..=page_count(total, PAGE_SIZE) {
            ctx.check_cancelled()?;
            for user in identities.page(SubjectType::User, page, PAGE_SIZE)? {
                if !Self::is_due(&user, days) {
                    continue;
                }
                if !ctx.execution.dry_run {
                    if let Err(e) = self.deps.certification.request_certify(domain, &user) {
                        warn!("Could not request recertification of {}: {:#}", user.name, e);
                        continue;
                    }
                }
                requested += 1;
            }
        }

        Ok(format!(
            "{} of {} users due for recertification{}",
            requested,
            total,
            if ctx.execution.dry_run { " (dry run)" } else { "" }
        ))
    }

    fn has_to_be_registered(&self, _task: &Task, _exec: &TaskExec) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::context::JobExecutionContext;
    use crate::job::key::JobKey;
    use crate::job::testing::TestHarness;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRequester {
        requested: Mutex<Vec<String>>,
    }

    impl CertificationRequester for RecordingRequester {
        fn request_certify(&self, _domain: &str, user: &Subject) -> anyhow::Result<()> {
            self.requested.lock().unwrap().push(user.name.clone());
            Ok(())
        }
    }

    fn context() -> JobContext {
        JobContext::detached(JobExecutionContext::new(JobKey::for_task("Master", "t1"), "admin"))
    }

    fn setup() -> (TestHarness, Arc<RecordingRequester>) {
        let mut harness = TestHarness::new();
        let requester = Arc::new(RecordingRequester::default());
        harness.deps_mut().certification = requester.clone();

        let identities = harness.identities();
        let mut recent = Subject::new(SubjectType::User, "u1", "recent");
        recent.last_recertification = Some(Utc::now() - Duration::days(1));
        let mut stale = Subject::new(SubjectType::User, "u2", "stale");
        stale.last_recertification = Some(Utc::now() - Duration::days(40));
        identities.insert(recent);
        identities.insert(stale);
        identities.insert(Subject::new(SubjectType::User, "u3", "never"));
        (harness, requester)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests_only_due_users() {
        let (harness, requester) = setup();
        harness
            .store()
            .set_conf_param("Master", RECERTIFICATION_INTERVAL_CONF, "30")
            .unwrap();

        let delegate = IdentityRecertification::new(harness.deps());
        let mut task = Task::scheduled("t1", "recert", "IdentityRecertification");
        let message = delegate.execute(&mut task, &context()).unwrap();

        assert_eq!(message, "2 of 3 users due for recertification");
        assert_eq!(*requester.requested.lock().unwrap(), vec!["stale", "never"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_interval_disables_and_is_cached() {
        let (harness, requester) = setup();
        let delegate = IdentityRecertification::new(harness.deps());
        let mut task = Task::scheduled("t1", "recert", "IdentityRecertification");

        assert_eq!(delegate.execute(&mut task, &context()).unwrap(), DISABLED_MESSAGE);

        // read once: setting it later has no effect on this instance
        harness
            .store()
            .set_conf_param("Master", RECERTIFICATION_INTERVAL_CONF, "30")
            .unwrap();
        assert_eq!(delegate.execute(&mut task, &context()).unwrap(), DISABLED_MESSAGE);
        assert!(requester.requested.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_always_registers_executions() {
        let harness = TestHarness::new();
        let delegate = IdentityRecertification::new(harness.deps());
        let mut task = Task::scheduled("t1", "recert", "IdentityRecertification");
        task.save_execs = false;
        let exec = TaskExec::start(crate::store::ExecKind::Task, "t1", "admin");
        assert!(delegate.has_to_be_registered(&task, &exec));
    }
}
