/// Errors raised by the scheduling layer and by job bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Task, report, delegate or job missing by key.
    NotFound(String),
    AlreadyRunning,
    ExecutionFailed(String),
    /// Macro form or command arguments rejected.
    Validation(String),
    Cancelled,
    Timeout,
    InvalidSchedule(String),
    Storage(String),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::NotFound(what) => write!(f, "Not found: {}", what),
            JobError::AlreadyRunning => write!(f, "Job is already running"),
            JobError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            JobError::Validation(msg) => write!(f, "Validation failed: {}", msg),
            JobError::Cancelled => write!(f, "Job was cancelled"),
            JobError::Timeout => write!(f, "Job timed out"),
            JobError::InvalidSchedule(msg) => write!(f, "Invalid schedule: {}", msg),
            JobError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for JobError {}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::Storage(format!("{e:#}"))
    }
}
