use super::context::JobExecutionContext;
use super::envelope::{JobBody, JobEnvelope, JobKind};
use super::error::JobError;
use super::key::JobKey;
use super::lock::JobLock;
use crate::security::SecurityContext;
use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Quartz expressions use `?` for "no specific value"; the cron crate wants `*`.
pub fn normalize_cron(expression: &str) -> String {
    expression.trim().replace('?', "*")
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Cron {
        expression: String,
        schedule: Box<Schedule>,
        start_at: Option<DateTime<Utc>>,
    },
    Once(DateTime<Utc>),
}

impl Trigger {
    pub fn cron(expression: &str, start_at: Option<DateTime<Utc>>) -> Result<Self, JobError> {
        let schedule = Schedule::from_str(&normalize_cron(expression))
            .map_err(|e| JobError::InvalidSchedule(format!("{}: {}", expression, e)))?;
        Ok(Trigger::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
            start_at,
        })
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Trigger::Once(at)
    }

    /// First fire strictly after `after`. A one-shot in the past fires now.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron {
                schedule, start_at, ..
            } => {
                let from = match start_at {
                    Some(start) if *start > after => *start - chrono::Duration::seconds(1),
                    _ => after,
                };
                schedule.after(&from).next()
            }
            Trigger::Once(at) => Some((*at).max(after)),
        }
    }

    fn is_once(&self) -> bool {
        matches!(self, Trigger::Once(_))
    }
}

struct ScheduledJobEntry {
    envelope: Arc<JobEnvelope>,
    trigger: Option<Trigger>,
    /// Fire loop of the trigger, if any.
    handle: Option<JoinHandle<()>>,
}

impl ScheduledJobEntry {
    fn stop_trigger(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Settings shared by every job this scheduler builds.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long one interrupt attempt waits for the body to return.
    pub interrupt_poll: Duration,
    /// Parent of every run's cancellation token.
    pub shutdown: CancellationToken,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interrupt_poll: Duration::from_secs(1),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Registry of scheduled units of work, one live entry per `(domain, name)`.
///
/// Triggers fire on the tokio runtime and bodies run on its blocking pool, so
/// scheduling calls return before any body starts.
pub struct TaskScheduler {
    entries: DashMap<JobKey, ScheduledJobEntry>,
    lock: Arc<dyn JobLock>,
    security: SecurityContext,
    runtime: Handle,
    settings: SchedulerSettings,
}

impl TaskScheduler {
    pub fn new(
        lock: Arc<dyn JobLock>,
        security: SecurityContext,
        runtime: Handle,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            lock,
            security,
            runtime,
            settings,
        }
    }

    pub fn lock(&self) -> &Arc<dyn JobLock> {
        &self.lock
    }

    pub fn security(&self) -> &SecurityContext {
        &self.security
    }

    /// Wraps a body in an envelope guarded by this scheduler's lock.
    pub fn envelope(
        &self,
        body: Arc<dyn JobBody>,
        execution: JobExecutionContext,
    ) -> Arc<JobEnvelope> {
        Arc::new(JobEnvelope::new(
            body,
            execution,
            self.lock.clone(),
            self.security.clone(),
            self.settings.shutdown.clone(),
            self.settings.interrupt_poll,
        ))
    }

    /// Places the job in the registry without a trigger. Replaces any entry
    /// under the same key.
    pub fn register(&self, envelope: Arc<JobEnvelope>) {
        debug!("Registering job {}", envelope.key());
        self.insert(envelope, None);
    }

    /// Attaches a recurring trigger, optionally not firing before `start_at`.
    pub fn schedule_cron(
        &self,
        envelope: Arc<JobEnvelope>,
        expression: &str,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobError> {
        let trigger = Trigger::cron(expression, start_at)?;
        info!("Scheduling job {} with cron '{}'", envelope.key(), expression);
        self.insert(envelope, Some(trigger));
        Ok(())
    }

    /// Attaches a one-shot trigger.
    pub fn schedule_at(&self, envelope: Arc<JobEnvelope>, at: DateTime<Utc>) {
        info!("Scheduling job {} once at {}", envelope.key(), at);
        self.insert(envelope, Some(Trigger::once(at)));
    }

    fn insert(&self, envelope: Arc<JobEnvelope>, trigger: Option<Trigger>) {
        let key = envelope.key().clone();
        let handle = trigger
            .clone()
            .map(|trigger| self.spawn_trigger(envelope.clone(), trigger));
        let entry = ScheduledJobEntry {
            envelope,
            trigger,
            handle,
        };
        if let Some(mut previous) = self.entries.insert(key, entry) {
            previous.stop_trigger();
        }
    }

    fn spawn_trigger(&self, envelope: Arc<JobEnvelope>, trigger: Trigger) -> JoinHandle<()> {
        let shutdown = self.settings.shutdown.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let mut cursor = Utc::now();
            while let Some(next) = trigger.next_after(cursor) {
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.cancelled() => break,
                }

                // Not awaited: a fire that overlaps a running body is dropped
                // by the job lock instead of queueing behind it.
                let job = envelope.clone();
                runtime.spawn_blocking(move || job.execute());

                if trigger.is_once() {
                    break;
                }
                cursor = next;
            }
            debug!("Trigger of {} exhausted", envelope.key());
        })
    }

    /// Fires a registered job now.
    pub fn start(&self, key: &JobKey) -> Result<(), JobError> {
        let envelope = self
            .envelope_of(key)
            .ok_or_else(|| JobError::NotFound(format!("job {}", key)))?;
        info!("Starting job {} on demand", key);
        self.runtime.spawn_blocking(move || envelope.execute());
        Ok(())
    }

    /// Stops the trigger and asks a running body to stop. The entry stays.
    pub fn cancel(&self, key: &JobKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.stop_trigger();
                entry.trigger = None;
                entry.envelope.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the entry and force-releases the job lock, so that a
    /// cancelled run cannot leak it.
    pub fn delete(&self, key: &JobKey) -> bool {
        let existed = match self.entries.remove(key) {
            Some((_, mut entry)) => {
                entry.stop_trigger();
                entry.envelope.request_cancel();
                true
            }
            None => false,
        };
        if let Err(e) = self.lock.unlock(key) {
            error!("Failed to force-release lock of {}: {:#}", key, e);
        }
        existed
    }

    pub fn next_trigger(&self, key: &JobKey) -> Option<DateTime<Utc>> {
        let entry = self.entries.get(key)?;
        entry.handle.as_ref().filter(|h| !h.is_finished())?;
        entry.trigger.as_ref()?.next_after(Utc::now())
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn job_kind(&self, key: &JobKey) -> Option<JobKind> {
        self.entries.get(key).map(|entry| entry.envelope.kind())
    }

    pub fn envelope_of(&self, key: &JobKey) -> Option<Arc<JobEnvelope>> {
        self.entries.get(key).map(|entry| entry.envelope.clone())
    }

    /// Names of the jobs registered for a domain, sorted.
    pub fn job_names(&self, domain: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().domain == domain)
            .map(|entry| entry.key().name.clone())
            .collect();
        names.sort();
        names
    }

    /// Stops every trigger and cancels running bodies.
    pub fn shutdown(&self) {
        let count = self.entries.len();
        self.settings.shutdown.cancel();
        for mut entry in self.entries.iter_mut() {
            entry.stop_trigger();
        }
        if count > 0 {
            warn!("Scheduler stopped with {} registered jobs", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::context::JobContext;
    use crate::job::lock::InMemoryJobLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestJob {
        runs: Arc<AtomicUsize>,
    }

    impl JobBody for TestJob {
        fn kind(&self) -> JobKind {
            JobKind::Task
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn create_test_scheduler() -> (TaskScheduler, Arc<InMemoryJobLock>) {
        let lock = Arc::new(InMemoryJobLock::new());
        let scheduler = TaskScheduler::new(
            lock.clone(),
            SecurityContext::new("admin"),
            Handle::current(),
            SchedulerSettings {
                interrupt_poll: Duration::from_millis(10),
                shutdown: CancellationToken::new(),
            },
        );
        (scheduler, lock)
    }

    fn test_envelope(scheduler: &TaskScheduler, name: &str, runs: &Arc<AtomicUsize>) -> Arc<JobEnvelope> {
        scheduler.envelope(
            Arc::new(TestJob { runs: runs.clone() }),
            JobExecutionContext::new(JobKey::new("Master", name), "admin"),
        )
    }

    async fn wait_for_runs(runs: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..400 {
            if runs.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_quartz_expressions_parse() {
        assert!(Trigger::cron("0 0/5 * * * ?", None).is_ok());
        assert!(Trigger::cron("0 * * * * ?", None).is_ok());
        assert!(matches!(
            Trigger::cron("not a cron", None),
            Err(JobError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_cron_trigger_respects_start_at() {
        let start = Utc::now() + chrono::Duration::days(2);
        let trigger = Trigger::cron("0 * * * * ?", Some(start)).unwrap();
        let next = trigger.next_after(Utc::now()).unwrap();
        assert!(next >= start - chrono::Duration::seconds(1));
        assert!(next <= start + chrono::Duration::minutes(1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_is_inert_and_start_fires() {
        let (scheduler, _lock) = create_test_scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(test_envelope(&scheduler, "taskJob1", &runs));

        let key = JobKey::new("Master", "taskJob1");
        assert!(scheduler.contains(&key));
        assert_eq!(scheduler.next_trigger(&key), None);
        assert_eq!(scheduler.job_kind(&key), Some(JobKind::Task));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        scheduler.start(&key).unwrap();
        wait_for_runs(&runs, 1).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_unknown_job_is_not_found() {
        let (scheduler, _lock) = create_test_scheduler();
        assert!(matches!(
            scheduler.start(&JobKey::new("Master", "missing")),
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_shot_fires_once() {
        let (scheduler, _lock) = create_test_scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at(
            test_envelope(&scheduler, "taskJob2", &runs),
            Utc::now() + chrono::Duration::milliseconds(50),
        );
        wait_for_runs(&runs, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.next_trigger(&JobKey::new("Master", "taskJob2")), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cron_fires_repeatedly_until_cancelled() {
        let (scheduler, _lock) = create_test_scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule_cron(test_envelope(&scheduler, "taskJob3", &runs), "* * * * * ?", None)
            .unwrap();
        let key = JobKey::new("Master", "taskJob3");
        assert!(scheduler.next_trigger(&key).is_some());

        wait_for_runs(&runs, 2).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        assert!(scheduler.cancel(&key));
        assert!(scheduler.contains(&key));
        assert_eq!(scheduler.next_trigger(&key), None);
        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // at most one fire that was already handed to the blocking pool
        assert!(runs.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_twice_keeps_second() {
        let (scheduler, _lock) = create_test_scheduler();
        let first_runs = Arc::new(AtomicUsize::new(0));
        let second_runs = Arc::new(AtomicUsize::new(0));

        scheduler.register(test_envelope(&scheduler, "taskJob4", &first_runs));
        scheduler.register(test_envelope(&scheduler, "taskJob4", &second_runs));
        assert_eq!(scheduler.job_names("Master"), vec!["taskJob4".to_string()]);

        scheduler.start(&JobKey::new("Master", "taskJob4")).unwrap();
        wait_for_runs(&second_runs, 1).await;
        assert_eq!(first_runs.load(Ordering::SeqCst), 0);
        assert_eq!(second_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_removes_entry_and_releases_lock() {
        let (scheduler, lock) = create_test_scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(test_envelope(&scheduler, "taskJob5", &runs));
        let key = JobKey::new("Master", "taskJob5");

        // simulate a lock leaked by a cancelled run
        assert!(lock.try_lock(&key).unwrap());
        assert!(scheduler.delete(&key));
        assert!(!scheduler.contains(&key));
        assert!(!lock.is_locked(&key));
        assert!(!scheduler.delete(&key));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_job_names_are_per_domain() {
        let (scheduler, _lock) = create_test_scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(test_envelope(&scheduler, "taskJobB", &runs));
        scheduler.register(test_envelope(&scheduler, "taskJobA", &runs));
        scheduler.register(scheduler.envelope(
            Arc::new(TestJob { runs: runs.clone() }),
            JobExecutionContext::new(JobKey::new("Two", "taskJobC"), "admin"),
        ));

        assert_eq!(
            scheduler.job_names("Master"),
            vec!["taskJobA".to_string(), "taskJobB".to_string()]
        );
        assert_eq!(scheduler.job_names("Two"), vec!["taskJobC".to_string()]);
        assert!(scheduler.job_names("Three").is_empty());
    }
}
