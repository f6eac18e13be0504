use super::connector::ConnectorError;
use super::provisioning::ProvisioningError;
use crate::job::JobError;
use thiserror::Error;

/// Failure raised while reconciling one delta or entity.
///
/// Only `Fatal` stops a run. Everything else is settled per entity by the
/// handler: recorded as a result, logged, or both.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconciliationError {
    #[error("reconciliation aborted: {0}")]
    Fatal(String),
    #[error("{0}")]
    PerEntity(String),
    /// Raised by actions to skip an entity without marking it failed.
    #[error("ignored: {0}")]
    Ignore(String),
    #[error("connector timeout: {0}")]
    Timeout(String),
    #[error("more than one match found: {0:?}")]
    AmbiguousMatch(Vec<String>),
    #[error("invalid correlation: {0}")]
    InvalidCorrelation(String),
}

impl From<ConnectorError> for ReconciliationError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Timeout(msg) => ReconciliationError::Timeout(msg),
            other => ReconciliationError::PerEntity(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ReconciliationError {
    fn from(e: anyhow::Error) -> Self {
        ReconciliationError::PerEntity(format!("{e:#}"))
    }
}

impl From<ProvisioningError> for ReconciliationError {
    fn from(e: ProvisioningError) -> Self {
        ReconciliationError::PerEntity(e.to_string())
    }
}

impl From<ReconciliationError> for JobError {
    fn from(e: ReconciliationError) -> Self {
        JobError::ExecutionFailed(e.to_string())
    }
}
