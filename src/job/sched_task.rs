//! Job body running a persisted task through its delegate.

use super::context::{JobContext, DELEGATE_IMPLEMENTATION, TASK_KEY};
use super::delegate::{DelegateRegistry, JobDependencies};
use super::envelope::{panic_message, JobBody, JobKind};
use super::error::JobError;
use crate::audit::{AuditEvent, AuditResult, EventCategory};
use crate::store::{ExecKind, ExecStatus, TaskExec};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct TaskJob {
    deps: Arc<JobDependencies>,
    delegates: Arc<DelegateRegistry>,
}

impl TaskJob {
    pub fn new(deps: Arc<JobDependencies>, delegates: Arc<DelegateRegistry>) -> Self {
        Self { deps, delegates }
    }
}

impl JobBody for TaskJob {
    fn kind(&self) -> JobKind {
        JobKind::Task
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let execution = &ctx.execution;
        let domain = execution.domain();
        let task_key = execution.require_str(TASK_KEY)?;
        let delegate_key = execution.require_str(DELEGATE_IMPLEMENTATION)?;

        let delegate = self
            .delegates
            .get(delegate_key, &self.deps)
            .ok_or_else(|| JobError::NotFound(format!("delegate {}", delegate_key)))?;

        let mut task = self
            .deps
            .store
            .find_task(domain, task_key)?
            .ok_or_else(|| JobError::NotFound(format!("task {}", task_key)))?;
        if !task.active {
            warn!("Task {} is not active, running it anyway", task_key);
        }
        let before = serde_json::to_value(&task).ok();

        let mut exec = TaskExec::start(ExecKind::Task, task_key, &execution.executor);
        info!(
            "Running task {} ({}) with {}{}",
            task.name,
            task_key,
            delegate_key,
            if execution.dry_run { " in dry run" } else { "" }
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| delegate.execute(&mut task, ctx)));
        let failure = match result {
            Ok(Ok(message)) => {
                exec.finish(ExecStatus::Success, Some(message));
                None
            }
            Ok(Err(e)) => {
                error!("Task {} failed: {}", task_key, e);
                exec.finish(ExecStatus::Failure, Some(e.to_string()));
                Some(e)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Task {} panicked: {}", task_key, reason);
                let e = JobError::ExecutionFailed(format!("task {} panicked: {}", task_key, reason));
                exec.finish(ExecStatus::Failure, Some(e.to_string()));
                Some(e)
            }
        };

        if delegate.has_to_be_registered(&task, &exec) {
            if let Err(e) = self.deps.store.save_exec(domain, &exec) {
                error!("Could not save execution of task {}: {:#}", task_key, e);
            }
        } else {
            debug!("Execution of task {} not registered", task_key);
        }

        task.last_exec = Some(exec.start);
        if let Err(e) = self.deps.store.save_task(domain, &task) {
            error!("Could not update task {}: {:#}", task_key, e);
        }

        let event = AuditEvent::new(
            EventCategory::Task,
            delegate_key,
            delegate_key,
            AuditResult::from_success(failure.is_none()),
            &execution.executor,
        )
        .with_before(before)
        .with_output(serde_json::to_value(&exec).ok());
        self.deps.side_effects.fire(domain, &event);

        match failure {
            None => Ok(()),
            Some(JobError::Cancelled) => Err(JobError::Cancelled),
            Some(e) => Err(JobError::ExecutionFailed(e.to_string())),
        }
    }
}
