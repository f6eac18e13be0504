mod models;
mod schema;
mod sqlite_job_store;

pub use models::*;
pub use schema::JOB_STORE_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Durable state behind the scheduler: locks, definitions, executions,
/// domain configuration, audit trail and notification queue.
pub trait JobStore: Send + Sync {
    // Job locks
    /// Inserts the lock row if absent. Returns whether this call took it.
    fn try_acquire_lock(&self, domain: &str, job_name: &str, owner: &str) -> Result<bool>;
    /// Deletes the lock row; deleting a missing row is not an error.
    fn release_lock(&self, domain: &str, job_name: &str) -> Result<()>;
    fn lock_owner(&self, domain: &str, job_name: &str) -> Result<Option<String>>;
    fn release_locks_owned_by(&self, owner: &str) -> Result<usize>;

    // Tasks
    fn find_tasks(&self, domain: &str, task_type: TaskType) -> Result<Vec<Task>>;
    fn find_task(&self, domain: &str, key: &str) -> Result<Option<Task>>;
    fn save_task(&self, domain: &str, task: &Task) -> Result<()>;
    fn delete_task(&self, domain: &str, key: &str) -> Result<bool>;

    // Reports
    fn find_reports(&self, domain: &str) -> Result<Vec<Report>>;
    fn find_report(&self, domain: &str, key: &str) -> Result<Option<Report>>;
    fn save_report(&self, domain: &str, report: &Report) -> Result<()>;

    // Executions
    fn save_exec(&self, domain: &str, exec: &TaskExec) -> Result<()>;
    fn find_execs(&self, domain: &str, task: &str, limit: usize) -> Result<Vec<TaskExec>>;
    fn recent_execs(&self, domain: &str, limit: usize) -> Result<Vec<TaskExec>>;

    // Domain configuration parameters
    fn get_conf_param(&self, domain: &str, key: &str) -> Result<Option<String>>;
    fn set_conf_param(&self, domain: &str, key: &str, value: &str) -> Result<()>;

    // Audit
    fn append_audit(&self, domain: &str, entry: &AuditEntry) -> Result<i64>;
    fn audit_entries(&self, domain: &str, limit: usize) -> Result<Vec<AuditEntry>>;

    // Notifications
    fn save_notification(&self, domain: &str, notification: &Notification) -> Result<()>;
    fn find_notifications(&self, domain: &str) -> Result<Vec<Notification>>;
    fn insert_notification_task(&self, domain: &str, task: &NotificationTask) -> Result<i64>;
    fn pending_notification_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<NotificationTask>>;
    fn mark_notification_task_executed(&self, id: i64, error: Option<&str>) -> Result<()>;

    // Access tokens
    fn save_access_token(&self, domain: &str, token: &AccessToken) -> Result<()>;
    fn count_access_tokens(&self, domain: &str) -> Result<usize>;
    /// Deletes tokens that expired before `now`. Returns how many were removed.
    fn delete_expired_access_tokens(&self, domain: &str, now: DateTime<Utc>) -> Result<usize>;
}
