use crate::sync::resource::{ProvisioningSpec, PullSpec, PushSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Tasks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Scheduled,
    Pull,
    Push,
    Macro,
    LiveSync,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::Scheduled,
        TaskType::Pull,
        TaskType::Push,
        TaskType::Macro,
        TaskType::LiveSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Scheduled => "SCHEDULED",
            TaskType::Pull => "PULL",
            TaskType::Push => "PUSH",
            TaskType::Macro => "MACRO",
            TaskType::LiveSync => "LIVE_SYNC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(TaskType::Scheduled),
            "PULL" => Some(TaskType::Pull),
            "PUSH" => Some(TaskType::Push),
            "MACRO" => Some(TaskType::Macro),
            "LIVE_SYNC" => Some(TaskType::LiveSync),
            _ => None,
        }
    }
}

/// One command of a macro task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Input expected from whoever starts a macro task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormProperty {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSpec {
    pub commands: Vec<CommandInvocation>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub form: Vec<FormProperty>,
}

/// Type-specific part of a task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskSpec {
    Scheduled {
        #[serde(default)]
        params: Map<String, Value>,
    },
    Pull(PullSpec),
    Push(PushSpec),
    Macro(MacroSpec),
    LiveSync(PullSpec),
}

impl TaskSpec {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskSpec::Scheduled { .. } => TaskType::Scheduled,
            TaskSpec::Pull(_) => TaskType::Pull,
            TaskSpec::Push(_) => TaskType::Push,
            TaskSpec::Macro(_) => TaskType::Macro,
            TaskSpec::LiveSync(_) => TaskType::LiveSync,
        }
    }

    pub fn provisioning(&self) -> Option<&ProvisioningSpec> {
        match self {
            TaskSpec::Pull(spec) | TaskSpec::LiveSync(spec) => Some(&spec.provisioning),
            TaskSpec::Push(spec) => Some(&spec.provisioning),
            TaskSpec::Scheduled { .. } | TaskSpec::Macro(_) => None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A persisted task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    /// Key of the delegate implementation; defaults by task type when absent.
    #[serde(default)]
    pub job_delegate: Option<String>,
    #[serde(default = "default_true")]
    pub save_execs: bool,
    #[serde(default)]
    pub last_exec: Option<DateTime<Utc>>,
    pub spec: TaskSpec,
}

impl Task {
    pub fn new(key: &str, name: &str, spec: TaskSpec) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            active: true,
            cron_expression: None,
            start_at: None,
            job_delegate: None,
            save_execs: true,
            last_exec: None,
            spec,
        }
    }

    pub fn scheduled(key: &str, name: &str, delegate: &str) -> Self {
        let mut task = Self::new(
            key,
            name,
            TaskSpec::Scheduled {
                params: Map::new(),
            },
        );
        task.job_delegate = Some(delegate.to_string());
        task
    }

    pub fn task_type(&self) -> TaskType {
        self.spec.task_type()
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub key: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Key of the report delegate implementation.
    pub delegate: String,
    #[serde(default)]
    pub last_exec: Option<DateTime<Utc>>,
}

// =============================================================================
// Executions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Success,
    Failure,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Success => "SUCCESS",
            ExecStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(ExecStatus::Success),
            "FAILURE" => Some(ExecStatus::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecKind {
    Task,
    Report,
}

impl ExecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecKind::Task => "task",
            ExecKind::Report => "report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task" => Some(ExecKind::Task),
            "report" => Some(ExecKind::Report),
            _ => None,
        }
    }
}

/// Record of one execution of a task or report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExec {
    pub key: String,
    pub kind: ExecKind,
    /// Key of the task or report that ran.
    pub task: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub status: ExecStatus,
    pub message: Option<String>,
    pub executor: String,
}

impl TaskExec {
    pub fn start(kind: ExecKind, task: &str, executor: &str) -> Self {
        Self {
            key: uuid::Uuid::new_v4().to_string(),
            kind,
            task: task.to_string(),
            start: Utc::now(),
            end: None,
            status: ExecStatus::Success,
            message: None,
            executor: executor.to_string(),
        }
    }

    pub fn finish(&mut self, status: ExecStatus, message: Option<String>) {
        self.status = status;
        self.message = message;
        self.end = Some(Utc::now());
    }
}

// =============================================================================
// Audit & notifications
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    /// Event string, e.g. `[TASK]:[SCHEDULED]:[]:[execute]:[SUCCESS]`.
    pub event: String,
    pub who: String,
    pub before: Option<String>,
    pub output: Option<String>,
    pub input: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Notification definition: which events produce mail to whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub key: String,
    pub events: Vec<String>,
    pub recipients: Vec<String>,
    pub subject: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: i64,
    pub notification_key: String,
    pub event: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub payload: Option<String>,
    pub executed: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Access tokens
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}
