use super::models::{
    AccessToken, AuditEntry, ExecKind, ExecStatus, Notification, NotificationTask, Report, Task,
    TaskExec, TaskType,
};
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open job database")?;
        // Several nodes may share the file; wait for writers instead of failing.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let latest = JOB_STORE_VERSIONED_SCHEMAS
            .last()
            .context("No job store schema defined")?;

        if is_new_db {
            info!("Creating new job database at {:?}", path);
            latest.create(&conn)?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;
            if db_version < 1 {
                anyhow::bail!("Job database version {} is invalid (expected >= 1)", db_version);
            }

            let version_index = JOB_STORE_VERSIONED_SCHEMAS
                .iter()
                .position(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown job database version {}", db_version))?;
            JOB_STORE_VERSIONED_SCHEMAS[version_index]
                .validate(&conn)
                .with_context(|| {
                    format!("Job database schema validation failed for version {}", db_version)
                })?;

            if (db_version as usize) < latest.version {
                info!(
                    "Migrating job database from version {} to {}",
                    db_version, latest.version
                );
                Self::migrate(&mut conn, db_version as usize)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &mut Connection, from_version: usize) -> Result<()> {
        let tx = conn.transaction()?;
        let mut reached = from_version;
        for schema in JOB_STORE_VERSIONED_SCHEMAS
            .iter()
            .filter(|s| s.version > from_version)
        {
            if let Some(migration) = schema.migration {
                migration(&tx)
                    .with_context(|| format!("Failed to migrate to version {}", schema.version))?;
            }
            reached = schema.version;
        }
        tx.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + reached),
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fixed-width UTC timestamps so that text comparison orders them.
    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }

    fn decode<T: serde::de::DeserializeOwned>(what: &str, key: &str, body: &str) -> Result<T> {
        serde_json::from_str(body).with_context(|| format!("{} {} is unreadable", what, key))
    }

    fn row_to_exec(row: &rusqlite::Row) -> rusqlite::Result<TaskExec> {
        let kind: String = row.get("kind")?;
        let status: String = row.get("status")?;
        let start_at: String = row.get("start_at")?;
        let end_at: Option<String> = row.get("end_at")?;
        Ok(TaskExec {
            key: row.get("key")?,
            kind: ExecKind::parse(&kind).unwrap_or(ExecKind::Task),
            task: row.get("task")?,
            start: Self::parse_datetime(&start_at).unwrap_or_else(Utc::now),
            end: end_at.as_deref().and_then(Self::parse_datetime),
            status: ExecStatus::parse(&status).unwrap_or(ExecStatus::Failure),
            message: row.get("message")?,
            executor: row.get("executor")?,
        })
    }

    fn row_to_audit_entry(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
        let created_at: String = row.get("created_at")?;
        Ok(AuditEntry {
            id: row.get("id")?,
            event: row.get("event")?,
            who: row.get("who")?,
            before: row.get("before_json")?,
            output: row.get("output_json")?,
            input: row.get("input_json")?,
            created_at: Self::parse_datetime(&created_at).unwrap_or_else(Utc::now),
        })
    }

    fn row_to_notification_task(row: &rusqlite::Row) -> rusqlite::Result<NotificationTask> {
        let recipients: String = row.get("recipients")?;
        let created_at: String = row.get("created_at")?;
        let executed: i64 = row.get("executed")?;
        Ok(NotificationTask {
            id: row.get("id")?,
            notification_key: row.get("notification_key")?,
            event: row.get("event")?,
            recipients: serde_json::from_str(&recipients).unwrap_or_default(),
            subject: row.get("subject")?,
            payload: row.get("payload")?,
            executed: executed != 0,
            error: row.get("error")?,
            created_at: Self::parse_datetime(&created_at).unwrap_or_else(Utc::now),
        })
    }

    fn query_bodies(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(rows)
    }
}

impl JobStore for SqliteJobStore {
    fn try_acquire_lock(&self, domain: &str, job_name: &str, owner: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO job_locks (domain, job_name, owner, acquired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![domain, job_name, owner, Self::format_datetime(&Utc::now())],
        )?;
        Ok(inserted == 1)
    }

    fn release_lock(&self, domain: &str, job_name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM job_locks WHERE domain = ?1 AND job_name = ?2",
            params![domain, job_name],
        )?;
        Ok(())
    }

    fn lock_owner(&self, domain: &str, job_name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT owner FROM job_locks WHERE domain = ?1 AND job_name = ?2",
                params![domain, job_name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn release_locks_owned_by(&self, owner: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM job_locks WHERE owner = ?1", params![owner])?)
    }

    fn find_tasks(&self, domain: &str, task_type: TaskType) -> Result<Vec<Task>> {
        let rows = self.query_bodies(
            "SELECT key, body FROM tasks WHERE domain = ?1 AND task_type = ?2 ORDER BY key",
            &[&domain, &task_type.as_str()],
        )?;
        Ok(rows
            .into_iter()
            .map(|(key, body)| Self::decode("Task", &key, &body))
            .collect::<Result<Vec<_>>>()?)
    }

    fn find_task(&self, domain: &str, key: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM tasks WHERE domain = ?1 AND key = ?2",
                params![domain, key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| Self::decode("Task", key, &body)).transpose()
    }

    fn save_task(&self, domain: &str, task: &Task) -> Result<()> {
        let body = serde_json::to_string(task)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (domain, key, task_type, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(domain, key) DO UPDATE SET
                task_type = excluded.task_type,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                domain,
                task.key,
                task.task_type().as_str(),
                body,
                Self::format_datetime(&Utc::now())
            ],
        )?;
        Ok(())
    }

    fn delete_task(&self, domain: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM tasks WHERE domain = ?1 AND key = ?2",
            params![domain, key],
        )?;
        Ok(deleted > 0)
    }

    fn find_reports(&self, domain: &str) -> Result<Vec<Report>> {
        let rows = self.query_bodies(
            "SELECT key, body FROM reports WHERE domain = ?1 ORDER BY key",
            &[&domain],
        )?;
        Ok(rows
            .into_iter()
            .map(|(key, body)| Self::decode("Report", &key, &body))
            .collect::<Result<Vec<_>>>()?)
    }

    fn find_report(&self, domain: &str, key: &str) -> Result<Option<Report>> {
        let conn = self.conn.lock().unwrap();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM reports WHERE domain = ?1 AND key = ?2",
                params![domain, key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| Self::decode("Report", key, &body)).transpose()
    }

    fn save_report(&self, domain: &str, report: &Report) -> Result<()> {
        let body = serde_json::to_string(report)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO reports (domain, key, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(domain, key) DO UPDATE SET body = excluded.body",
            params![domain, report.key, body],
        )?;
        Ok(())
    }

    fn save_exec(&self, domain: &str, exec: &TaskExec) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO execs
                (key, domain, kind, task, start_at, end_at, status, message, executor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                exec.key,
                domain,
                exec.kind.as_str(),
                exec.task,
                Self::format_datetime(&exec.start),
                exec.end.as_ref().map(Self::format_datetime),
                exec.status.as_str(),
                exec.message,
                exec.executor,
            ],
        )?;
        Ok(())
    }

    fn find_execs(&self, domain: &str, task: &str, limit: usize) -> Result<Vec<TaskExec>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM execs WHERE domain = ?1 AND task = ?2
             ORDER BY start_at DESC LIMIT ?3",
        )?;
        let execs = stmt
            .query_map(params![domain, task, limit as i64], Self::row_to_exec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(execs)
    }

    fn recent_execs(&self, domain: &str, limit: usize) -> Result<Vec<TaskExec>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM execs WHERE domain = ?1 ORDER BY start_at DESC LIMIT ?2",
        )?;
        let execs = stmt
            .query_map(params![domain, limit as i64], Self::row_to_exec)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(execs)
    }

    fn get_conf_param(&self, domain: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT value FROM conf_params WHERE domain = ?1 AND key = ?2",
                params![domain, key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_conf_param(&self, domain: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conf_params (domain, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(domain, key) DO UPDATE SET value = excluded.value",
            params![domain, key, value],
        )?;
        Ok(())
    }

    fn append_audit(&self, domain: &str, entry: &AuditEntry) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log
                (domain, event, who, before_json, output_json, input_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                domain,
                entry.event,
                entry.who,
                entry.before,
                entry.output,
                entry.input,
                Self::format_datetime(&entry.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn audit_entries(&self, domain: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM audit_log WHERE domain = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![domain, limit as i64], Self::row_to_audit_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn save_notification(&self, domain: &str, notification: &Notification) -> Result<()> {
        let body = serde_json::to_string(notification)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notifications (domain, key, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(domain, key) DO UPDATE SET body = excluded.body",
            params![domain, notification.key, body],
        )?;
        Ok(())
    }

    fn find_notifications(&self, domain: &str) -> Result<Vec<Notification>> {
        let rows = self.query_bodies(
            "SELECT key, body FROM notifications WHERE domain = ?1 ORDER BY key",
            &[&domain],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, body)| Self::decode("notification", &key, &body).ok())
            .collect())
    }

    fn insert_notification_task(&self, domain: &str, task: &NotificationTask) -> Result<i64> {
        let recipients = serde_json::to_string(&task.recipients)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_tasks
                (domain, notification_key, event, recipients, subject, payload, executed, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                domain,
                task.notification_key,
                task.event,
                recipients,
                task.subject,
                task.payload,
                task.executed as i64,
                task.error,
                Self::format_datetime(&task.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn pending_notification_tasks(
        &self,
        domain: &str,
        limit: usize,
    ) -> Result<Vec<NotificationTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM notification_tasks WHERE domain = ?1 AND executed = 0
             ORDER BY id LIMIT ?2",
        )?;
        let tasks = stmt
            .query_map(params![domain, limit as i64], Self::row_to_notification_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn mark_notification_task_executed(&self, id: i64, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE notification_tasks SET executed = 1, error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    fn save_access_token(&self, domain: &str, token: &AccessToken) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO access_tokens (domain, key, owner, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                domain,
                token.key,
                token.owner,
                Self::format_datetime(&token.expires_at)
            ],
        )?;
        Ok(())
    }

    fn count_access_tokens(&self, domain: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM access_tokens WHERE domain = ?1",
            params![domain],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn delete_expired_access_tokens(&self, domain: &str, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "DELETE FROM access_tokens WHERE domain = ?1 AND expires_at < ?2",
            params![domain, Self::format_datetime(&now)],
        )?)
    }
}
