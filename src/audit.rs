//! Audit trail and notification side effects.
//!
//! Both sinks are best-effort: a failure to record is logged and never
//! changes the outcome of the operation being recorded.

use crate::store::{AuditEntry, JobStore, NotificationTask};
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Task,
    Report,
    Synchronization,
    Push,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Task => "TASK",
            EventCategory::Report => "REPORT",
            EventCategory::Synchronization => "SYNCHRONIZATION",
            EventCategory::Push => "PUSH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "SUCCESS",
            AuditResult::Failure => "FAILURE",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            AuditResult::Success
        } else {
            AuditResult::Failure
        }
    }
}

/// Something worth auditing, and the data notifications are built from.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub category: EventCategory,
    pub subcategory: String,
    pub resource: Option<String>,
    pub event: String,
    pub result: AuditResult,
    pub who: String,
    pub before: Option<Value>,
    pub output: Option<Value>,
    pub input: Vec<Value>,
}

impl AuditEvent {
    pub fn new(
        category: EventCategory,
        subcategory: &str,
        event: &str,
        result: AuditResult,
        who: &str,
    ) -> Self {
        Self {
            category,
            subcategory: subcategory.to_string(),
            resource: None,
            event: event.to_string(),
            result,
            who: who.to_string(),
            before: None,
            output: None,
            input: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn with_before(mut self, before: Option<Value>) -> Self {
        self.before = before;
        self
    }

    pub fn with_output(mut self, output: Option<Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input.push(input);
        self
    }

    /// `[CATEGORY]:[subcategory]:[resource]:[event]:[RESULT]`
    pub fn event_string(&self) -> String {
        format!(
            "[{}]:[{}]:[{}]:[{}]:[{}]",
            self.category.as_str(),
            self.subcategory,
            self.resource.as_deref().unwrap_or(""),
            self.event,
            self.result.as_str()
        )
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.event_string())
    }
}

pub trait AuditManager: Send + Sync {
    fn audit(&self, domain: &str, event: &AuditEvent);
}

pub trait NotificationManager: Send + Sync {
    /// Queues a notification task for every active notification listening to
    /// the event. Returns how many were queued.
    fn create_tasks(&self, domain: &str, event: &AuditEvent) -> usize;
}

/// Audit and notification sinks fired together.
#[derive(Clone)]
pub struct SideEffects {
    audit: Arc<dyn AuditManager>,
    notifications: Arc<dyn NotificationManager>,
}

impl SideEffects {
    pub fn new(audit: Arc<dyn AuditManager>, notifications: Arc<dyn NotificationManager>) -> Self {
        Self {
            audit,
            notifications,
        }
    }

    /// Both sinks backed by the job store.
    pub fn from_store(store: Arc<dyn JobStore>) -> Self {
        let auditor = Arc::new(StoreAuditor::new(store));
        Self::new(auditor.clone(), auditor)
    }

    pub fn fire(&self, domain: &str, event: &AuditEvent) {
        self.notifications.create_tasks(domain, event);
        self.audit.audit(domain, event);
    }
}

/// Writes audit entries and notification tasks to the job store.
pub struct StoreAuditor {
    store: Arc<dyn JobStore>,
}

impl StoreAuditor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

fn to_json_string(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

impl AuditManager for StoreAuditor {
    fn audit(&self, domain: &str, event: &AuditEvent) {
        let entry = AuditEntry {
            id: 0,
            event: event.event_string(),
            who: event.who.clone(),
            before: to_json_string(&event.before),
            output: to_json_string(&event.output),
            input: if event.input.is_empty() {
                None
            } else {
                Some(Value::Array(event.input.clone()).to_string())
            },
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_audit(domain, &entry) {
            warn!("Could not audit {} in {}: {:#}", entry.event, domain, e);
        }
    }
}

impl NotificationManager for StoreAuditor {
    fn create_tasks(&self, domain: &str, event: &AuditEvent) -> usize {
        let notifications = match self.store.find_notifications(domain) {
            Ok(notifications) => notifications,
            Err(e) => {
                warn!("Could not read notifications for {}: {:#}", domain, e);
                return 0;
            }
        };

        let event_string = event.event_string();
        let payload = event
            .output
            .as_ref()
            .or(event.before.as_ref())
            .map(Value::to_string);
        let mut created = 0;
        for notification in notifications
            .iter()
            .filter(|n| n.active && n.events.iter().any(|e| *e == event_string))
        {
            let task = NotificationTask {
                id: 0,
                notification_key: notification.key.clone(),
                event: event_string.clone(),
                recipients: notification.recipients.clone(),
                subject: notification.subject.clone(),
                payload: payload.clone(),
                executed: false,
                error: None,
                created_at: Utc::now(),
            };
            match self.store.insert_notification_task(domain, &task) {
                Ok(_) => created += 1,
                Err(e) => warn!(
                    "Could not queue notification {} for {}: {:#}",
                    notification.key, event_string, e
                ),
            }
        }
        if created > 0 {
            debug!("Queued {} notification tasks for {}", created, event_string);
        }
        created
    }
}
