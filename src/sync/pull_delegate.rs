//! Task delegate running a pull from an external resource.

use super::connector::{Connector, OperationOptions, SyncDelta};
use super::profile::PullProfile;
use super::pull::PullResultHandler;
use super::report;
use super::resource::{PullMode, PullSpec, Provision};
use crate::job::context::JobContext;
use crate::job::delegate::{JobDependencies, TaskJobDelegate};
use crate::job::delegates::SetMembershipsJob;
use crate::job::error::JobError;
use crate::store::{ExecStatus, Task, TaskExec, TaskSpec};
use std::sync::Arc;
use tracing::{debug, info};

pub struct PullJobDelegate {
    deps: Arc<JobDependencies>,
    /// Always pulls incrementally, whatever the task's mode.
    live_sync: bool,
}

impl PullJobDelegate {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self {
            deps,
            live_sync: false,
        }
    }

    pub fn live_sync(deps: Arc<JobDependencies>) -> Self {
        Self {
            deps,
            live_sync: true,
        }
    }

    fn pull_spec(task: &Task) -> Result<&PullSpec, JobError> {
        match &task.spec {
            TaskSpec::Pull(spec) | TaskSpec::LiveSync(spec) => Ok(spec),
            _ => Err(JobError::Validation(format!(
                "task {} is not a pull task",
                task.key
            ))),
        }
    }

    fn pull_provision(
        handler: &mut PullResultHandler<'_>,
        profile: &mut PullProfile,
        connector: &dyn Connector,
        spec: &PullSpec,
        provision: &Provision,
        incremental: bool,
    ) -> Result<(), JobError> {
        let class = provision.object_class.as_str();
        let options = OperationOptions {
            attributes_to_get: provision.all_items().map(|i| i.ext_attr_name.clone()).collect(),
            page_size: None,
        };
        let outcome = if incremental {
            debug!("Incremental pull of {} from {:?}", class, provision.sync_token);
            connector.sync(
                class,
                provision.sync_token.as_ref(),
                &mut |delta| handler.handle(profile, delta),
                &options,
            )
        } else {
            match spec.pull_mode {
                PullMode::FilteredReconciliation => {
                    let filter = spec.reconciliation_filter.as_ref().ok_or_else(|| {
                        JobError::Validation(
                            "filtered reconciliation requires a reconciliation filter".to_string(),
                        )
                    })?;
                    connector.search(class, filter, &options).map(|objects| {
                        for object in objects {
                            if !handler.handle(profile, SyncDelta::create_or_update(object)) {
                                break;
                            }
                        }
                    })
                }
                _ => connector.get_all_objects(
                    class,
                    &mut |object| handler.handle(profile, SyncDelta::create_or_update(object)),
                    &options,
                ),
            }
        };
        outcome.map_err(|e| JobError::ExecutionFailed(format!("while pulling from connector: {}", e)))
    }
}

impl TaskJobDelegate for PullJobDelegate {
    fn execute(&self, task: &mut Task, ctx: &JobContext) -> Result<String, JobError> {
        let spec = Self::pull_spec(task)?.clone();
        let incremental = self.live_sync || spec.pull_mode == PullMode::Incremental;
        let dry_run = ctx.execution.dry_run;
        let resource_key = spec.provisioning.resource.key.clone();

        let connector = self
            .deps
            .connectors
            .connector(&spec.provisioning.resource)
            .ok_or_else(|| JobError::NotFound(format!("connector for {}", resource_key)))?;
        let actions = self.deps.pull_actions.resolve_all(&spec.provisioning.actions)?;
        let mut profile = PullProfile::new(
            ctx.domain(),
            &ctx.execution.executor,
            &task.key,
            &task.name,
            spec.provisioning.clone(),
            connector.clone(),
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
        let mut handler = PullResultHandler::new(&self.deps, ctx, incremental);
        let mut outcome = Ok(());
        for provision in &provisions {
            if handler.was_interrupted() || ctx.is_cancelled() {
                break;
            }
            info!("Pulling {} from {}", provision.object_class, resource_key);
            outcome = Self::pull_provision(
                &mut handler,
                &mut profile,
                connector.as_ref(),
                &spec,
                provision,
                incremental,
            );
            if outcome.is_err() {
                break;
            }
        }

        // Tokens reached so far are kept even when the pull failed midway.
        if incremental && !dry_run {
            if let TaskSpec::Pull(spec) | TaskSpec::LiveSync(spec) = &mut task.spec {
                for provision in spec.provisioning.resource.provisions.iter_mut() {
                    if let Some(token) = handler.latest_token(&provision.object_class) {
                        provision.sync_token = Some(token.clone());
                    }
                }
            }
        }
        outcome?;

        if !dry_run && !handler.pending_memberships().is_empty() {
            SetMembershipsJob::schedule(
                &self.deps,
                ctx.domain(),
                &task.key,
                &ctx.execution.executor,
                &resource_key,
                handler.pending_memberships(),
            );
        }
        let interrupted = handler.was_interrupted() || ctx.is_cancelled();

        if !dry_run {
            for action in &profile.actions {
                action.after_all(&profile)?;
            }
        }

        let report = report::create_report(&profile.results, &profile.spec.resource, dry_run, interrupted)
            .unwrap_or_default();
        debug!("Pull result: {}", report);
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
