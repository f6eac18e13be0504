//! Scheduled reports.

use crate::audit::{AuditEvent, AuditResult, EventCategory};
use crate::job::context::{JobContext, REPORT_KEY};
use crate::job::delegate::JobDependencies;
use crate::job::envelope::{JobBody, JobKind};
use crate::job::error::JobError;
use crate::store::{ExecKind, ExecStatus, Report, TaskExec};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Produces the content of a report.
pub trait ReportDelegate: Send + Sync {
    fn generate(
        &self,
        deps: &JobDependencies,
        ctx: &JobContext,
        report: &Report,
    ) -> Result<String, JobError>;
}

const SUMMARY_WINDOW: usize = 500;

/// Success and failure counts of the most recent task executions.
pub struct TaskExecSummaryReportlet;

impl ReportDelegate for TaskExecSummaryReportlet {
    fn generate(
        &self,
        deps: &JobDependencies,
        ctx: &JobContext,
        _report: &Report,
    ) -> Result<String, JobError> {
        let execs = deps.store.recent_execs(ctx.domain(), SUMMARY_WINDOW)?;

        let mut per_task: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for exec in execs.iter().filter(|e| e.kind == ExecKind::Task) {
            let counts = per_task.entry(exec.task.as_str()).or_default();
            match exec.status {
                ExecStatus::Success => counts.0 += 1,
                ExecStatus::Failure => counts.1 += 1,
            }
        }

        let mut out = String::new();
        for (task, (success, failure)) in per_task {
            let _ = writeln!(out, "{} [success/failure]: {}/{}", task, success, failure);
        }
        Ok(out)
    }
}

pub struct ReportJob {
    deps: Arc<JobDependencies>,
}

impl ReportJob {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self { deps }
    }
}

impl JobBody for ReportJob {
    fn kind(&self) -> JobKind {
        JobKind::Report
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let execution = &ctx.execution;
        let domain = execution.domain();
        let report_key = execution.require_str(REPORT_KEY)?;

        let mut report = self
            .deps
            .store
            .find_report(domain, report_key)?
            .ok_or_else(|| JobError::NotFound(format!("report {}", report_key)))?;
        if !report.active {
            warn!("Report {} is not active, running it anyway", report_key);
        }
        let delegate = self
            .deps
            .report_delegates
            .get(&report.delegate)
            .ok_or_else(|| JobError::NotFound(format!("report delegate {}", report.delegate)))?;

        let mut exec = TaskExec::start(ExecKind::Report, report_key, &execution.executor);
        let result = delegate.generate(&self.deps, ctx, &report);
        match &result {
            Ok(content) => {
                info!("Report {} generated, {} bytes", report.name, content.len());
                exec.finish(ExecStatus::Success, Some(content.clone()));
            }
            Err(e) => {
                error!("Report {} failed: {}", report.name, e);
                exec.finish(ExecStatus::Failure, Some(e.to_string()));
            }
        }

        if let Err(e) = self.deps.store.save_exec(domain, &exec) {
            error!("Could not save execution of report {}: {:#}", report_key, e);
        }
        report.last_exec = Some(exec.start);
        if let Err(e) = self.deps.store.save_report(domain, &report) {
            error!("Could not update report {}: {:#}", report_key, e);
        }

        let event = AuditEvent::new(
            EventCategory::Report,
            &report.delegate,
            "execute",
            AuditResult::from_success(result.is_ok()),
            &execution.executor,
        )
        .with_output(serde_json::to_value(&exec).ok());
        self.deps.side_effects.fire(domain, &event);

        result.map(|_| ())
    }
}
