use super::error::JobError;
use super::interrupt::InterruptCell;
use super::key::JobKey;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Keys of the free-form execution data.
pub const TASK_KEY: &str = "task";
pub const REPORT_KEY: &str = "report";
pub const DELEGATE_IMPLEMENTATION: &str = "delegateImplementation";
pub const MEMBERSHIPS: &str = "memberships";
pub const MACRO_FORM: &str = "macroForm";

/// Identifies one execution of a job and carries its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JobExecutionContext {
    pub key: JobKey,
    pub executor: String,
    pub dry_run: bool,
    pub data: Map<String, Value>,
}

impl JobExecutionContext {
    pub fn new(key: JobKey, executor: &str) -> Self {
        Self {
            key,
            executor: executor.to_string(),
            dry_run: false,
            data: Map::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn domain(&self) -> &str {
        &self.key.domain
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// String parameter that must be present.
    pub fn require_str(&self, key: &str) -> Result<&str, JobError> {
        self.data_str(key)
            .ok_or_else(|| JobError::NotFound(format!("'{}' in job data of {}", key, self.key)))
    }
}

/// What a job body sees while it runs.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for interruption or shutdown.
    pub cancellation_token: CancellationToken,
    pub execution: JobExecutionContext,
    interrupt: Arc<InterruptCell>,
}

impl JobContext {
    pub(crate) fn new(
        cancellation_token: CancellationToken,
        execution: JobExecutionContext,
        interrupt: Arc<InterruptCell>,
    ) -> Self {
        Self {
            cancellation_token,
            execution,
            interrupt,
        }
    }

    /// Context detached from any scheduler, for running a body directly.
    pub fn detached(execution: JobExecutionContext) -> Self {
        let (token, cell) = super::interrupt::Interrupter::new(1, std::time::Duration::ZERO)
            .begin(&CancellationToken::new());
        Self::new(token, execution, cell)
    }

    pub fn domain(&self) -> &str {
        self.execution.domain()
    }

    /// Check if a stop was requested. Observing it acknowledges the request.
    ///
    /// Long loops check this at every iteration and before each blocking call.
    pub fn is_cancelled(&self) -> bool {
        if self.cancellation_token.is_cancelled() {
            self.interrupt.acknowledge();
            true
        } else {
            false
        }
    }

    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}
