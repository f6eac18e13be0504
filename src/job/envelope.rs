use super::context::{JobContext, JobExecutionContext};
use super::error::JobError;
use super::interrupt::{InterruptState, Interrupter};
use super::key::JobKey;
use super::lock::JobLock;
use crate::metrics;
use crate::security::SecurityContext;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a scheduled unit of work is, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Task,
    Report,
    Notification,
    SystemLoadReporter,
    SetMemberships,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Task => "TaskJob",
            JobKind::Report => "ReportJob",
            JobKind::Notification => "NotificationJob",
            JobKind::SystemLoadReporter => "SystemLoadReporterJob",
            JobKind::SetMemberships => "SetMembershipsJob",
        }
    }
}

/// The work a job performs. Bodies are synchronous and run on a blocking
/// worker; long ones check `ctx.is_cancelled()` between steps.
pub trait JobBody: Send + Sync {
    fn kind(&self) -> JobKind;

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(String),
    /// The lock was held elsewhere; the body did not run.
    Skipped,
}

/// Releases the job lock when the execution ends, however it ends.
struct UnlockGuard<'a> {
    lock: &'a dyn JobLock,
    key: &'a JobKey,
}

impl Drop for UnlockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock(self.key) {
            error!("Failed to release lock of {}: {:#}", self.key, e);
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Wraps a body with locking, domain security context, error containment
/// and interruption.
pub struct JobEnvelope {
    body: Arc<dyn JobBody>,
    execution: JobExecutionContext,
    lock: Arc<dyn JobLock>,
    security: SecurityContext,
    interrupter: Interrupter,
    shutdown: CancellationToken,
}

impl JobEnvelope {
    pub fn new(
        body: Arc<dyn JobBody>,
        execution: JobExecutionContext,
        lock: Arc<dyn JobLock>,
        security: SecurityContext,
        shutdown: CancellationToken,
        interrupt_poll: Duration,
    ) -> Self {
        Self {
            body,
            execution,
            lock,
            security,
            interrupter: Interrupter::new(1, interrupt_poll),
            shutdown,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.execution.key
    }

    pub fn kind(&self) -> JobKind {
        self.body.kind()
    }

    pub fn execution(&self) -> &JobExecutionContext {
        &self.execution
    }

    pub fn set_max_interrupt_retries(&self, max_retries: u32) {
        self.interrupter.set_max_retries(max_retries);
    }

    /// Whether this node is executing the body right now.
    pub fn is_running_here(&self) -> bool {
        self.interrupter.is_running()
    }

    /// Runs the body once. Never panics and never returns the body's error:
    /// failures are logged and reported as the outcome.
    pub fn execute(&self) -> ExecutionOutcome {
        let key = self.key();
        match self.lock.try_lock(key) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job {} already running, skipping this fire", key);
                metrics::record_lock_contention(&key.domain);
                return ExecutionOutcome::Skipped;
            }
            Err(e) => {
                warn!("Could not acquire lock for {}, skipping: {:#}", key, e);
                return ExecutionOutcome::Skipped;
            }
        }
        let _unlock = UnlockGuard {
            lock: self.lock.as_ref(),
            key,
        };

        let label = key.to_string();
        let (token, cell) = self.interrupter.begin(&self.shutdown);
        let ctx = JobContext::new(token, self.execution.clone(), cell.clone());

        info!("Starting job {} ({})", key, self.kind().as_str());
        metrics::set_job_running(&label, true);
        let start = Instant::now();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.security
                .call_as_admin(&key.domain, || self.body.execute(&ctx))
        }));

        let elapsed = start.elapsed();
        self.interrupter.end(&cell);

        let (outcome, status_label) = match result {
            Ok(Ok(())) => {
                info!("Job {} completed in {:?}", key, elapsed);
                (ExecutionOutcome::Completed, "success")
            }
            Ok(Err(JobError::Cancelled)) => {
                info!("Job {} was cancelled after {:?}", key, elapsed);
                (
                    ExecutionOutcome::Failed(JobError::Cancelled.to_string()),
                    "cancelled",
                )
            }
            Ok(Err(e)) => {
                error!("Job {} failed after {:?}: {}", key, elapsed, e);
                (ExecutionOutcome::Failed(e.to_string()), "failed")
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("Job {} panicked after {:?}: {}", key, elapsed, msg);
                (ExecutionOutcome::Failed(format!("Job panic: {}", msg)), "panic")
            }
        };

        metrics::record_job_execution(&label, status_label, elapsed);
        metrics::set_job_running(&label, false);
        outcome
    }

    /// Asks the current run to stop and waits for it, within the retry budget.
    pub fn interrupt(&self) -> InterruptState {
        self.interrupter.interrupt()
    }

    /// Asks the current run to stop without waiting.
    pub fn request_cancel(&self) -> bool {
        self.interrupter.request_cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::lock::InMemoryJobLock;
    use crate::security;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    struct CountingBody {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl JobBody for CountingBody {
        fn kind(&self) -> JobKind {
            JobKind::Task
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobError::ExecutionFailed("Test failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct PanickingBody;

    impl JobBody for PanickingBody {
        fn kind(&self) -> JobKind {
            JobKind::Task
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            panic!("delegate blew up")
        }
    }

    /// Holds the lock until released by the test.
    struct BlockingBody {
        started: Arc<Barrier>,
        release: Arc<Barrier>,
        runs: Arc<AtomicUsize>,
    }

    impl JobBody for BlockingBody {
        fn kind(&self) -> JobKind {
            JobKind::Report
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.wait();
            self.release.wait();
            Ok(())
        }
    }

    struct DomainProbe;

    impl JobBody for DomainProbe {
        fn kind(&self) -> JobKind {
            JobKind::Task
        }

        fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
            let current = security::current().ok_or(JobError::ExecutionFailed("no context".into()))?;
            if current.domain == ctx.domain() && current.admin {
                Ok(())
            } else {
                Err(JobError::ExecutionFailed("wrong context".into()))
            }
        }
    }

    fn envelope(body: Arc<dyn JobBody>, lock: Arc<InMemoryJobLock>) -> JobEnvelope {
        JobEnvelope::new(
            body,
            JobExecutionContext::new(JobKey::for_task("Master", "1"), "admin"),
            lock,
            SecurityContext::new("admin"),
            CancellationToken::new(),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_unlock_after_success_failure_and_panic() {
        let lock = Arc::new(InMemoryJobLock::new());
        let key = JobKey::for_task("Master", "1");
        let runs = Arc::new(AtomicUsize::new(0));

        let ok = envelope(
            Arc::new(CountingBody {
                runs: runs.clone(),
                fail: false,
            }),
            lock.clone(),
        );
        assert_eq!(ok.execute(), ExecutionOutcome::Completed);
        assert!(!lock.is_locked(&key));

        let failing = envelope(
            Arc::new(CountingBody {
                runs: runs.clone(),
                fail: true,
            }),
            lock.clone(),
        );
        assert!(matches!(failing.execute(), ExecutionOutcome::Failed(_)));
        assert!(!lock.is_locked(&key));

        let panicking = envelope(Arc::new(PanickingBody), lock.clone());
        match panicking.execute() {
            ExecutionOutcome::Failed(msg) => assert!(msg.contains("delegate blew up")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!lock.is_locked(&key));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_fires_run_body_once() {
        let lock = Arc::new(InMemoryJobLock::new());
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let runs = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(envelope(
            Arc::new(BlockingBody {
                started: started.clone(),
                release: release.clone(),
                runs: runs.clone(),
            }),
            lock.clone(),
        ));

        let first = {
            let job = job.clone();
            thread::spawn(move || job.execute())
        };
        started.wait();

        assert!(job.is_running_here());
        assert_eq!(job.execute(), ExecutionOutcome::Skipped);

        release.wait();
        assert_eq!(first.join().unwrap(), ExecutionOutcome::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked(&JobKey::for_task("Master", "1")));
    }

    #[test]
    fn test_body_runs_as_domain_admin() {
        let job = envelope(Arc::new(DomainProbe), Arc::new(InMemoryJobLock::new()));
        assert_eq!(job.execute(), ExecutionOutcome::Completed);
        assert!(security::current().is_none());
    }
}
