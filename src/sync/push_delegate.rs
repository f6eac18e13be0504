//! Task delegate pushing internal subjects to an external resource.

use super::identity::page_count;
use super::profile::PushProfile;
use super::push::PushResultHandler;
use super::report;
use super::resource::Provision;
use crate::job::context::JobContext;
use crate::job::delegate::{JobDependencies, TaskJobDelegate};
use crate::job::error::JobError;
use crate::store::{ExecStatus, Task, TaskExec, TaskSpec};
use std::sync::Arc;
use tracing::{debug, info};

const PAGE_SIZE: usize = 1000;

pub struct PushJobDelegate {
    deps: Arc<JobDependencies>,
}

impl PushJobDelegate {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self { deps }
    }

    /// Pushes every subject of the provision's type, page by page.
    /// Returns `false` once the run was interrupted.
    fn push_provision(
        &self,
        handler: &PushResultHandler<'_>,
        profile: &mut PushProfile,
        provision: &Provision,
        page_size: usize,
    ) -> Result<bool, JobError> {
        let identities = &self.deps.identities;
        let total = identities.count(provision.subject_type)?;
        info!(
            "Pushing {} {} subjects to {}",
            total,
            provision.subject_type,
            profile.resource_key()
        );
        for page in 1..=page_count(total, page_size) {
            for subject in identities.page(provision.subject_type, page, page_size)? {
                if !handler.handle(profile, provision, &subject) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

impl TaskJobDelegate for PushJobDelegate {
    fn execute(&self, task: &mut Task, ctx: &JobContext) -> Result<String, JobError> {
        let TaskSpec::Push(spec) = &task.spec else {
            return Err(JobError::Validation(format!("task {} is not a push task", task.key)));
        };
        let dry_run = ctx.execution.dry_run;
        let resource = &spec.provisioning.resource;

        let connector = self
            .deps
            .connectors
            .connector(resource)
            .ok_or_else(|| JobError::NotFound(format!("connector for {}", resource.key)))?;
        let actions = self.deps.push_actions.resolve_all(&spec.provisioning.actions)?;
        let mut profile = PushProfile::new(
            ctx.domain(),
            &ctx.execution.executor,
            &task.key,
            &task.name,
            spec.provisioning.clone(),
            connector,
        )
        .with_actions(actions)
        .with_dry_run(dry_run);

        if !dry_run {
            for action in &profile.actions {
                action.before_all(&profile)?;
            }
        }

        let provisions: Vec<Provision> = profile
            .spec
            .resource
            .sorted_provisions()
            .into_iter()
            .cloned()
            .collect();
        let handler = PushResultHandler::new(&self.deps, ctx);
        let mut interrupted = false;
        for provision in &provisions {
            if ctx.is_cancelled() || !self.push_provision(&handler, &mut profile, provision, PAGE_SIZE)? {
                interrupted = true;
                break;
            }
        }

        if !dry_run {
            for action in &profile.actions {
                action.after_all(&profile)?;
            }
        }

        let report = report::create_report(&profile.results, &profile.spec.resource, dry_run, interrupted)
            .unwrap_or_default();
        debug!("Push result: {}", report);
        Ok(report)
    }

    fn has_to_be_registered(&self, task: &Task, exec: &TaskExec) -> bool {
        task.spec.provisioning().is_some_and(|spec| {
            report::has_to_be_registered(
                exec.status == ExecStatus::Failure,
                spec.resource.trace_level,
            )
        })
    }
}
