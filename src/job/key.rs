use std::fmt;

/// Name of the notification dispatcher job, registered on the master domain.
pub const NOTIFICATION_JOB: &str = "notificationJob";
/// Name of the per-minute load reporter job, registered on the master domain.
pub const SYSTEM_LOAD_REPORTER_JOB: &str = "systemLoadReporterJob";

const TASK_JOB_PREFIX: &str = "taskJob";
const REPORT_JOB_PREFIX: &str = "reportJob";

/// Identity of a scheduled unit of work. Unique per domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub domain: String,
    pub name: String,
}

impl JobKey {
    pub fn new(domain: &str, name: &str) -> Self {
        Self {
            domain: domain.to_string(),
            name: name.to_string(),
        }
    }

    pub fn for_task(domain: &str, task_key: &str) -> Self {
        Self::new(domain, &task_job_name(task_key))
    }

    pub fn for_report(domain: &str, report_key: &str) -> Self {
        Self::new(domain, &report_job_name(report_key))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.name)
    }
}

pub fn task_job_name(task_key: &str) -> String {
    format!("{TASK_JOB_PREFIX}{task_key}")
}

pub fn report_job_name(report_key: &str) -> String {
    format!("{REPORT_JOB_PREFIX}{report_key}")
}

/// Task key encoded in a job name, if it is a task job.
pub fn task_key_from_job_name(job_name: &str) -> Option<&str> {
    job_name
        .strip_prefix(TASK_JOB_PREFIX)
        .filter(|key| !key.is_empty())
}

pub fn report_key_from_job_name(job_name: &str) -> Option<&str> {
    job_name
        .strip_prefix(REPORT_JOB_PREFIX)
        .filter(|key| !key.is_empty())
}
