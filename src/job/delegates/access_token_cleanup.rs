//! Removes access tokens past their expiry.

use crate::job::context::JobContext;
use crate::job::delegate::{JobDependencies, TaskJobDelegate};
use crate::job::error::JobError;
use crate::store::Task;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct ExpiredAccessTokenCleanup {
    deps: Arc<JobDependencies>,
}

impl ExpiredAccessTokenCleanup {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self { deps }
    }
}

impl TaskJobDelegate for ExpiredAccessTokenCleanup {
    fn execute(&self, _task: &mut Task, ctx: &JobContext) -> Result<String, JobError> {
        ctx.check_cancelled()?;
        let domain = ctx.domain();

        if ctx.execution.dry_run {
            let total = self.deps.store.count_access_tokens(domain)?;
            return Ok(format!("Dry run: {} access tokens, none deleted", total));
        }

        let deleted = self
            .deps
            .store
            .delete_expired_access_tokens(domain, Utc::now())?;
        if deleted > 0 {
            info!("Deleted {} expired access tokens in {}", deleted, domain);
        }
        Ok(format!("Deleted {} expired access tokens", deleted))
    }
}
