use crate::job::context::JobContext;
use crate::job::envelope::{JobBody, JobKind};
use crate::job::error::JobError;
use crate::metrics;
use tracing::debug;

/// Samples load average and process memory into the metrics registry.
pub struct SystemLoadReporterJob;

impl JobBody for SystemLoadReporterJob {
    fn kind(&self) -> JobKind {
        JobKind::SystemLoadReporter
    }

    fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
        let load = metrics::update_system_load();
        let memory = metrics::update_memory_usage();
        debug!("System load {:?}, resident memory {:?} bytes", load, memory);
        Ok(())
    }
}
