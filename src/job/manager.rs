//! Registration of tasks, reports and system jobs with the scheduler.

use super::context::{JobExecutionContext, DELEGATE_IMPLEMENTATION, REPORT_KEY, TASK_KEY};
use super::delegate::{DelegateRegistry, JobDependencies};
use super::delegates::{NotificationJob, ReportJob, SystemLoadReporterJob};
use super::envelope::{JobBody, JobKind};
use super::error::JobError;
use super::interrupt::InterruptState;
use super::key::{JobKey, NOTIFICATION_JOB, SYSTEM_LOAD_REPORTER_JOB};
use super::sched_task::TaskJob;
use super::scheduler::TaskScheduler;
use crate::store::{Report, Task, TaskType};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Cron of the notification job; blank disables it.
pub const NOTIFICATION_CRON_CONF: &str = "notificationjob.cronExpression";
pub const DEFAULT_NOTIFICATION_CRON: &str = "0 0/5 * * * ?";
pub const INTERRUPT_MAX_RETRIES_CONF: &str = "tasks.interruptMaxRetries";
pub const SYSTEM_LOAD_REPORTER_CRON: &str = "0 * * * * ?";

#[derive(Debug, Clone)]
pub struct JobManagerSettings {
    /// Domain holding global configuration and running the system jobs.
    pub master_domain: String,
    /// Every domain served, for jobs that sweep all of them.
    pub domains: Vec<String>,
    /// A standby node keeps its scheduler empty.
    pub standby: bool,
}

impl Default for JobManagerSettings {
    fn default() -> Self {
        Self {
            master_domain: "Master".to_string(),
            domains: vec!["Master".to_string()],
            standby: false,
        }
    }
}

/// What `load` registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub tasks: usize,
    pub reports: usize,
    pub system_jobs: usize,
    /// Task or report loading stopped at the first failure.
    pub aborted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub name: String,
    pub kind: Option<JobKind>,
    pub running: bool,
    pub next_trigger: Option<DateTime<Utc>>,
}

pub struct JobManager {
    deps: Arc<JobDependencies>,
    delegates: Arc<DelegateRegistry>,
    scheduler: Arc<TaskScheduler>,
    settings: JobManagerSettings,
    interrupt_max_retries: AtomicU32,
}

impl JobManager {
    pub fn new(
        deps: Arc<JobDependencies>,
        delegates: Arc<DelegateRegistry>,
        settings: JobManagerSettings,
    ) -> Self {
        Self {
            scheduler: deps.scheduler.clone(),
            deps,
            delegates,
            settings,
            interrupt_max_retries: AtomicU32::new(1),
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    fn admin_user(&self) -> &str {
        self.scheduler.security().admin_user()
    }

    /// Whether the job runs on this node or holds the lock anywhere.
    pub fn is_running(&self, key: &JobKey) -> bool {
        let here = self
            .scheduler
            .envelope_of(key)
            .is_some_and(|envelope| envelope.is_running_here());
        here || self.scheduler.lock().is_locked(key)
    }

    /// Schedules `body` under the execution's key. Returns `false` when the
    /// job is running and the registration was skipped.
    pub fn register_job(
        &self,
        execution: JobExecutionContext,
        body: Arc<dyn JobBody>,
        cron_expression: Option<&str>,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<bool, JobError> {
        let key = execution.key.clone();
        if self.is_running(&key) {
            debug!("Job {} already running, not registering it again", key);
            return Ok(false);
        }

        self.scheduler.delete(&key);

        let envelope = self.scheduler.envelope(body, execution);
        envelope.set_max_interrupt_retries(self.interrupt_max_retries.load(Ordering::Relaxed));

        let cron_expression = cron_expression.map(str::trim).filter(|c| !c.is_empty());
        match (cron_expression, start_at) {
            (None, None) => self.scheduler.register(envelope),
            (None, Some(at)) => self.scheduler.schedule_at(envelope, at),
            (Some(expression), start_at) => {
                self.scheduler.schedule_cron(envelope, expression, start_at)?
            }
        }
        Ok(true)
    }

    /// Resolves the task delegate and registers the task job.
    pub fn register_task(
        &self,
        domain: &str,
        task: &Task,
        start_at: Option<DateTime<Utc>>,
        executor: &str,
        dry_run: bool,
        job_data: Map<String, Value>,
    ) -> Result<JobExecutionContext, JobError> {
        let delegate = DelegateRegistry::delegate_key_for(task).ok_or_else(|| {
            JobError::Validation(format!(
                "task {} of type {} does not name a job delegate",
                task.key,
                task.task_type().as_str()
            ))
        })?;
        if !self.delegates.contains(&delegate) {
            return Err(JobError::NotFound(format!("delegate {}", delegate)));
        }

        let mut execution = JobExecutionContext::new(JobKey::for_task(domain, &task.key), executor)
            .with_dry_run(dry_run);
        execution.data.extend(job_data);
        execution.data.insert(TASK_KEY.to_string(), json!(task.key));
        execution
            .data
            .insert(DELEGATE_IMPLEMENTATION.to_string(), json!(delegate));

        let body = Arc::new(TaskJob::new(self.deps.clone(), self.delegates.clone()));
        self.register_job(
            execution.clone(),
            body,
            task.cron_expression.as_deref(),
            start_at,
        )?;
        Ok(execution)
    }

    pub fn register_report(
        &self,
        domain: &str,
        report: &Report,
        start_at: Option<DateTime<Utc>>,
        executor: &str,
    ) -> Result<bool, JobError> {
        let execution =
            JobExecutionContext::new(JobKey::for_report(domain, &report.key), executor)
                .with_data(REPORT_KEY, json!(report.key));
        let body = Arc::new(ReportJob::new(self.deps.clone()));
        self.register_job(execution, body, report.cron_expression.as_deref(), start_at)
    }

    pub fn unregister_task(&self, domain: &str, task_key: &str) -> bool {
        self.scheduler.delete(&JobKey::for_task(domain, task_key))
    }

    pub fn unregister_report(&self, domain: &str, report_key: &str) -> bool {
        self.scheduler.delete(&JobKey::for_report(domain, report_key))
    }

    /// Registers every persisted task and report of the domain, plus the
    /// system jobs on the master domain.
    ///
    /// Task loading stops at the first failure and reports are only loaded
    /// when every task was. System jobs are registered either way.
    pub fn load(&self, domain: &str) -> LoadSummary {
        let mut summary = LoadSummary::default();
        if self.settings.standby {
            info!("Node in standby, not loading jobs for domain {}", domain);
            return summary;
        }

        let master = self.settings.master_domain.as_str();
        let notification_cron = self.notification_cron(master);
        let retries = self.conf_u32(master, INTERRUPT_MAX_RETRIES_CONF, 1);
        self.interrupt_max_retries.store(retries, Ordering::Relaxed);

        let admin = self.admin_user().to_string();
        'types: for task_type in TaskType::ALL {
            let tasks = match self.deps.store.find_tasks(domain, task_type) {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!("While reading {} tasks of {}: {:#}", task_type.as_str(), domain, e);
                    summary.aborted = true;
                    break;
                }
            };
            for task in tasks {
                match self.register_task(domain, &task, task.start_at, &admin, false, Map::new()) {
                    Ok(_) => summary.tasks += 1,
                    Err(e) => {
                        error!("While loading job instance for task {}: {}", task.key, e);
                        summary.aborted = true;
                        break 'types;
                    }
                }
            }
        }

        if summary.aborted {
            debug!("Errors while loading job instances for tasks, aborting");
        } else {
            match self.deps.store.find_reports(domain) {
                Ok(reports) => {
                    for report in reports {
                        if let Err(e) = self.register_report(domain, &report, None, &admin) {
                            error!("While loading job instance for report {}: {}", report.name, e);
                            summary.aborted = true;
                            break;
                        }
                        summary.reports += 1;
                    }
                }
                Err(e) => {
                    error!("While reading reports of {}: {:#}", domain, e);
                    summary.aborted = true;
                }
            }
            if summary.aborted {
                debug!("Errors while loading job instances for reports, aborting");
            }
        }

        if domain == master {
            summary.system_jobs = self.register_system_jobs(domain, &admin, notification_cron);
        }

        info!(
            "Loaded {} tasks, {} reports and {} system jobs for domain {}",
            summary.tasks, summary.reports, summary.system_jobs, domain
        );
        summary
    }

    fn register_system_jobs(
        &self,
        domain: &str,
        admin: &str,
        notification_cron: Option<String>,
    ) -> usize {
        let mut registered = 0;

        match notification_cron {
            None => debug!("Empty cron for {}, not registering it", NOTIFICATION_JOB),
            Some(cron) => {
                debug!("{} cron expression: {}", NOTIFICATION_JOB, cron);
                let execution = JobExecutionContext::new(JobKey::new(domain, NOTIFICATION_JOB), admin);
                let body = Arc::new(NotificationJob::new(
                    self.deps.clone(),
                    self.settings.domains.clone(),
                ));
                match self.register_job(execution, body, Some(&cron), None) {
                    Ok(_) => registered += 1,
                    Err(e) => error!("While loading {} instance: {}", NOTIFICATION_JOB, e),
                }
            }
        }

        let execution =
            JobExecutionContext::new(JobKey::new(domain, SYSTEM_LOAD_REPORTER_JOB), admin);
        match self.register_job(
            execution,
            Arc::new(SystemLoadReporterJob),
            Some(SYSTEM_LOAD_REPORTER_CRON),
            None,
        ) {
            Ok(_) => registered += 1,
            Err(e) => error!("While loading {} instance: {}", SYSTEM_LOAD_REPORTER_JOB, e),
        }

        registered
    }

    /// Missing parameter means the default cron; a blank one disables the job.
    fn notification_cron(&self, master: &str) -> Option<String> {
        match self.deps.store.get_conf_param(master, NOTIFICATION_CRON_CONF) {
            Ok(None) => Some(DEFAULT_NOTIFICATION_CRON.to_string()),
            Ok(Some(cron)) if cron.trim().is_empty() => None,
            Ok(Some(cron)) => Some(cron),
            Err(e) => {
                warn!("Could not read {}, using default: {:#}", NOTIFICATION_CRON_CONF, e);
                Some(DEFAULT_NOTIFICATION_CRON.to_string())
            }
        }
    }

    fn conf_u32(&self, domain: &str, key: &str, default: u32) -> u32 {
        match self.deps.store.get_conf_param(domain, key) {
            Ok(Some(value)) => value.trim().parse().unwrap_or_else(|_| {
                warn!("Invalid value '{}' for {}, using {}", value, key, default);
                default
            }),
            Ok(None) => default,
            Err(e) => {
                warn!("Could not read {}, using {}: {:#}", key, default, e);
                default
            }
        }
    }

    /// Unregisters every task and report of the domain. Failures are logged
    /// and do not stop the sweep. Returns how many entries were removed.
    pub fn unload(&self, domain: &str) -> usize {
        let mut removed = 0;
        for task_type in TaskType::ALL {
            match self.deps.store.find_tasks(domain, task_type) {
                Ok(tasks) => {
                    for task in tasks {
                        if self.unregister_task(domain, &task.key) {
                            removed += 1;
                        }
                    }
                }
                Err(e) => error!(
                    "While unloading {} tasks of {}: {:#}",
                    task_type.as_str(),
                    domain,
                    e
                ),
            }
        }
        match self.deps.store.find_reports(domain) {
            Ok(reports) => {
                for report in reports {
                    if self.unregister_report(domain, &report.key) {
                        removed += 1;
                    }
                }
            }
            Err(e) => error!("While unloading reports of {}: {:#}", domain, e),
        }
        info!("Unloaded {} jobs for domain {}", removed, domain);
        removed
    }

    /// Registers the task and runs it now, or at `start_at` when given.
    pub fn execute_task(
        &self,
        domain: &str,
        task_key: &str,
        start_at: Option<DateTime<Utc>>,
        executor: &str,
        dry_run: bool,
        job_data: Map<String, Value>,
    ) -> Result<JobKey, JobError> {
        let task = self
            .deps
            .store
            .find_task(domain, task_key)?
            .ok_or_else(|| JobError::NotFound(format!("task {}", task_key)))?;
        let key = JobKey::for_task(domain, task_key);
        if self.is_running(&key) {
            return Err(JobError::AlreadyRunning);
        }

        self.register_task(domain, &task, start_at, executor, dry_run, job_data)?;
        if start_at.is_none() {
            self.scheduler.start(&key)?;
        }
        Ok(key)
    }

    pub fn execute_report(
        &self,
        domain: &str,
        report_key: &str,
        start_at: Option<DateTime<Utc>>,
        executor: &str,
    ) -> Result<JobKey, JobError> {
        let report = self
            .deps
            .store
            .find_report(domain, report_key)?
            .ok_or_else(|| JobError::NotFound(format!("report {}", report_key)))?;
        let key = JobKey::for_report(domain, report_key);
        if self.is_running(&key) {
            return Err(JobError::AlreadyRunning);
        }

        self.register_report(domain, &report, start_at, executor)?;
        if start_at.is_none() {
            self.scheduler.start(&key)?;
        }
        Ok(key)
    }

    /// Asks a running job to stop, retrying up to the configured budget.
    pub fn interrupt(&self, domain: &str, job_name: &str) -> Result<InterruptState, JobError> {
        let key = JobKey::new(domain, job_name);
        let envelope = self
            .scheduler
            .envelope_of(&key)
            .ok_or_else(|| JobError::NotFound(format!("job {}", key)))?;
        let state = envelope.interrupt();
        info!("Interrupt of {} ended in {:?}", key, state);
        Ok(state)
    }

    pub fn job_statuses(&self, domain: &str) -> Vec<JobStatus> {
        self.scheduler
            .job_names(domain)
            .into_iter()
            .map(|name| {
                let key = JobKey::new(domain, &name);
                JobStatus {
                    kind: self.scheduler.job_kind(&key),
                    running: self.is_running(&key),
                    next_trigger: self.scheduler.next_trigger(&key),
                    name,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::delegates::EXPIRED_ACCESS_TOKEN_CLEANUP;
    use crate::job::key::task_job_name;
    use crate::job::testing::TestHarness;

    fn manager(harness: &TestHarness) -> JobManager {
        JobManager::new(harness.deps(), harness.delegates(), JobManagerSettings::default())
    }

    fn cron_task(key: &str) -> Task {
        let mut task = Task::scheduled(key, key, EXPIRED_ACCESS_TOKEN_CLEANUP);
        task.cron_expression = Some("0 0 3 * * ?".to_string());
        task
    }

    fn report(key: &str) -> Report {
        Report {
            key: key.to_string(),
            name: key.to_string(),
            active: true,
            cron_expression: Some("0 0 4 * * ?".to_string()),
            delegate: "TaskExecSummaryReportlet".to_string(),
            last_exec: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_registers_tasks_reports_and_system_jobs() {
        let harness = TestHarness::new();
        let store = harness.store();
        store.save_task("Master", &cron_task("t1")).unwrap();
        store.save_task("Master", &cron_task("t2")).unwrap();
        store.save_report("Master", &report("r1")).unwrap();

        let manager = manager(&harness);
        let summary = manager.load("Master");
        assert_eq!(
            summary,
            LoadSummary {
                tasks: 2,
                reports: 1,
                system_jobs: 2,
                aborted: false
            }
        );

        let names = harness.scheduler().job_names("Master");
        assert_eq!(
            names,
            vec![
                "notificationJob",
                "reportJobr1",
                "systemLoadReporterJob",
                "taskJobt1",
                "taskJobt2"
            ]
        );
        assert!(harness
            .scheduler()
            .next_trigger(&JobKey::for_task("Master", "t1"))
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_load_is_fail_fast_but_system_jobs_still_register() {
        let harness = TestHarness::new();
        let store = harness.store();
        let mut broken = cron_task("t1");
        broken.job_delegate = Some("NoSuchDelegate".to_string());
        store.save_task("Master", &broken).unwrap();
        store.save_report("Master", &report("r1")).unwrap();

        let summary = manager(&harness).load("Master");
        assert!(summary.aborted);
        assert_eq!(summary.reports, 0);
        assert_eq!(summary.system_jobs, 2);
        assert!(!harness.scheduler().contains(&JobKey::for_report("Master", "r1")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreadable_task_aborts_load() {
        let harness = TestHarness::new();
        let store = harness.store();
        store.save_task("Master", &cron_task("t1")).unwrap();
        store.save_task("Master", &cron_task("t2")).unwrap();
        store.save_report("Master", &report("r1")).unwrap();
        rusqlite::Connection::open(harness.db_path())
            .unwrap()
            .execute("UPDATE tasks SET body = '{broken' WHERE key = 't1'", [])
            .unwrap();

        let summary = manager(&harness).load("Master");
        assert!(summary.aborted);
        assert_eq!(summary.tasks, 0);
        assert_eq!(summary.reports, 0);
        assert_eq!(summary.system_jobs, 2);
        assert!(!harness.scheduler().contains(&JobKey::for_task("Master", "t2")));
        assert!(!harness.scheduler().contains(&JobKey::for_report("Master", "r1")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_master_domain_gets_no_system_jobs() {
        let harness = TestHarness::new();
        harness.store().save_task("Two", &cron_task("t1")).unwrap();

        let summary = manager(&harness).load("Two");
        assert_eq!(summary.tasks, 1);
        assert_eq!(summary.system_jobs, 0);
        assert_eq!(harness.scheduler().job_names("Two"), vec![task_job_name("t1")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blank_notification_cron_disables_job() {
        let harness = TestHarness::new();
        harness
            .store()
            .set_conf_param("Master", NOTIFICATION_CRON_CONF, " ")
            .unwrap();

        let summary = manager(&harness).load("Master");
        assert_eq!(summary.system_jobs, 1);
        assert!(!harness
            .scheduler()
            .contains(&JobKey::new("Master", NOTIFICATION_JOB)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_standby_loads_nothing() {
        let harness = TestHarness::new();
        harness.store().save_task("Master", &cron_task("t1")).unwrap();
        let manager = JobManager::new(
            harness.deps(),
            harness.delegates(),
            JobManagerSettings {
                standby: true,
                ..JobManagerSettings::default()
            },
        );
        assert_eq!(manager.load("Master"), LoadSummary::default());
        assert!(harness.scheduler().job_names("Master").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_task_without_delegate_is_rejected() {
        let harness = TestHarness::new();
        let mut task = cron_task("t1");
        task.job_delegate = None;
        let result = manager(&harness).register_task("Master", &task, None, "admin", false, Map::new());
        assert!(matches!(result, Err(JobError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_job_skips_running_job() {
        let harness = TestHarness::new();
        let manager = manager(&harness);
        let task = cron_task("t1");
        let key = JobKey::for_task("Master", "t1");

        manager
            .register_task("Master", &task, None, "admin", false, Map::new())
            .unwrap();
        let first = harness.scheduler().envelope_of(&key).unwrap();

        // lock held elsewhere: the registration is skipped
        assert!(harness.lock().try_lock(&key).unwrap());
        manager
            .register_task("Master", &task, None, "admin", true, Map::new())
            .unwrap();
        assert!(Arc::ptr_eq(&first, &harness.scheduler().envelope_of(&key).unwrap()));
        harness.lock().unlock(&key).unwrap();

        // lock free: the second registration replaces the first
        manager
            .register_task("Master", &task, None, "admin", true, Map::new())
            .unwrap();
        let second = harness.scheduler().envelope_of(&key).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.execution().dry_run);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_register_job_trigger_shapes() {
        let harness = TestHarness::new();
        let manager = manager(&harness);

        let mut inert = cron_task("inert");
        inert.cron_expression = None;
        manager
            .register_task("Master", &inert, None, "admin", false, Map::new())
            .unwrap();
        let inert_key = JobKey::for_task("Master", "inert");
        assert!(harness.scheduler().contains(&inert_key));
        assert!(harness.scheduler().next_trigger(&inert_key).is_none());

        let later = Utc::now() + chrono::Duration::hours(1);
        manager
            .register_task("Master", &inert, Some(later), "admin", false, Map::new())
            .unwrap();
        assert_eq!(harness.scheduler().next_trigger(&inert_key), Some(later));

        let mut invalid = cron_task("invalid");
        invalid.cron_expression = Some("not a cron".to_string());
        let result = manager.register_task("Master", &invalid, None, "admin", false, Map::new());
        assert!(matches!(result, Err(JobError::InvalidSchedule(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unload_removes_every_task_and_report() {
        let harness = TestHarness::new();
        let store = harness.store();
        store.save_task("Master", &cron_task("t1")).unwrap();
        store.save_report("Master", &report("r1")).unwrap();
        let manager = manager(&harness);
        manager.load("Master");

        assert_eq!(manager.unload("Master"), 2);
        assert_eq!(
            harness.scheduler().job_names("Master"),
            vec!["notificationJob", "systemLoadReporterJob"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_task_runs_now() {
        let harness = TestHarness::new();
        harness
            .store()
            .save_task("Master", &Task::scheduled("t1", "cleanup", EXPIRED_ACCESS_TOKEN_CLEANUP))
            .unwrap();
        let manager = manager(&harness);
        manager
            .execute_task("Master", "t1", None, "admin", false, Map::new())
            .unwrap();

        let store = harness.store();
        harness
            .wait_until(|| !store.find_execs("Master", "t1", 10).unwrap().is_empty())
            .await;
        assert!(matches!(
            manager.execute_task("Master", "missing", None, "admin", false, Map::new()),
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interrupt_unknown_job() {
        let harness = TestHarness::new();
        assert!(matches!(
            manager(&harness).interrupt("Master", "taskJobnope"),
            Err(JobError::NotFound(_))
        ));
    }
}
