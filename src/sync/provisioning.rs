//! Boundary to the component that applies identity changes and propagates
//! them to external resources.

use super::identity::{
    IdentityRepository, MemoryIdentityRepository, Subject, SubjectDraft, SubjectPatch,
};
use super::model::SubjectType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropagationStatusKind {
    Created,
    Success,
    Failure,
    NotAttempted,
}

/// Per-resource outcome of one propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationStatus {
    pub resource: String,
    pub status: PropagationStatusKind,
    pub failure_reason: Option<String>,
}

impl PropagationStatus {
    pub fn success(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            status: PropagationStatusKind::Success,
            failure_reason: None,
        }
    }

    pub fn failure(resource: &str, reason: &str) -> Self {
        Self {
            resource: resource.to_string(),
            status: PropagationStatusKind::Failure,
            failure_reason: Some(reason.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == PropagationStatusKind::Failure
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("propagation to {resource} failed: {reason}")]
    Propagation { resource: String, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub key: String,
    pub statuses: Vec<PropagationStatus>,
}

pub type Propagation = Result<Vec<PropagationStatus>, ProvisioningError>;

/// Mutating operations on internal identities.
///
/// `excluded` lists resources that must not receive propagation, typically the
/// resource a pull change came from. Per-resource failures come back as
/// statuses; an `Err` means the whole operation was rejected.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait ProvisioningManager: Send + Sync {
    fn create(&self, draft: &SubjectDraft, excluded: &[String]) -> Result<Created, ProvisioningError>;
    fn update(&self, patch: &SubjectPatch, excluded: &[String]) -> Propagation;
    fn delete(&self, subject_type: SubjectType, key: &str, excluded: &[String]) -> Propagation;

    /// Adds the resources to the subject and propagates a create.
    fn assign(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation;
    /// Removes the resources from the subject and propagates a delete.
    fn unassign(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation;
    /// Propagates a create without touching the subject's resources.
    fn provision(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation;
    /// Propagates a delete without touching the subject's resources.
    fn deprovision(&self, subject_type: SubjectType, key: &str, resources: &[String])
        -> Propagation;
    /// Adds the resources to the subject, no propagation.
    fn link(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation;
    /// Removes the resources from the subject, no propagation.
    fn unlink(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation;
}

/// One call received by [`InMemoryProvisioningManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningCall {
    pub operation: &'static str,
    pub subject_type: SubjectType,
    /// Subject key, or the requested name for creates.
    pub subject: String,
    pub resources: Vec<String>,
}

/// Applies changes to an in-memory repository and reports success on every
/// resource. Every call is recorded, including rejected ones.
pub struct InMemoryProvisioningManager {
    identities: Arc<MemoryIdentityRepository>,
    calls: Mutex<Vec<ProvisioningCall>>,
    failures: Mutex<HashMap<String, ProvisioningError>>,
}

impl InMemoryProvisioningManager {
    pub fn new(identities: Arc<MemoryIdentityRepository>) -> Self {
        Self {
            identities,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Rejects every later call on the subject with this key or name.
    pub fn fail_for(&self, subject: &str, error: ProvisioningError) {
        self.failures
            .lock()
            .unwrap()
            .insert(subject.to_string(), error);
    }

    pub fn calls(&self) -> Vec<ProvisioningCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<ProvisioningCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.operation == operation)
            .collect()
    }

    fn record(&self, operation: &'static str, subject_type: SubjectType, subject: &str, resources: &[String]) {
        self.calls.lock().unwrap().push(ProvisioningCall {
            operation,
            subject_type,
            subject: subject.to_string(),
            resources: resources.to_vec(),
        });
    }

    fn injected_failure(&self, names: &[&str]) -> Result<(), ProvisioningError> {
        let failures = self.failures.lock().unwrap();
        match names.iter().find_map(|name| failures.get(*name)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn find(&self, subject_type: SubjectType, key: &str) -> Result<Subject, ProvisioningError> {
        let subject = self
            .identities
            .find(subject_type, key)
            .map_err(|e| ProvisioningError::Other(format!("{e:#}")))?
            .ok_or_else(|| ProvisioningError::NotFound(format!("{} {}", subject_type, key)))?;
        self.injected_failure(&[&subject.key, &subject.name])?;
        Ok(subject)
    }

    fn modify(
        &self,
        subject_type: SubjectType,
        key: &str,
        change: impl FnOnce(&mut Subject),
    ) -> Result<Subject, ProvisioningError> {
        let mut subject = self.find(subject_type, key)?;
        change(&mut subject);
        self.identities.insert(subject.clone());
        Ok(subject)
    }
}

fn propagate<'a>(
    resources: impl IntoIterator<Item = &'a String>,
    excluded: &[String],
) -> Vec<PropagationStatus> {
    resources
        .into_iter()
        .filter(|resource| !excluded.contains(resource))
        .map(|resource| PropagationStatus::success(resource))
        .collect()
}

impl ProvisioningManager for InMemoryProvisioningManager {
    fn create(&self, draft: &SubjectDraft, excluded: &[String]) -> Result<Created, ProvisioningError> {
        let resources: Vec<String> = draft.resources.iter().cloned().collect();
        self.record("create", draft.subject_type, &draft.name, &resources);
        self.injected_failure(&[&draft.name])?;

        let key = uuid::Uuid::new_v4().to_string();
        let mut subject = Subject::new(draft.subject_type, &key, &draft.name);
        subject.attrs = draft.attrs.clone();
        subject.resources = draft.resources.clone();
        subject.suspended = draft.enabled == Some(false);
        self.identities.insert(subject);

        Ok(Created {
            key,
            statuses: propagate(&resources, excluded),
        })
    }

    fn update(&self, patch: &SubjectPatch, excluded: &[String]) -> Propagation {
        self.record("update", patch.subject_type, &patch.key, &[]);
        let subject = self.modify(patch.subject_type, &patch.key, |subject| {
            if let Some(name) = &patch.name {
                subject.name = name.clone();
            }
            subject.attrs.extend(patch.attrs.clone());
            subject.memberships.extend(patch.memberships_to_add.iter().cloned());
            if let Some(enabled) = patch.enabled {
                subject.suspended = !enabled;
            }
        })?;
        Ok(propagate(&subject.resources, excluded))
    }

    fn delete(&self, subject_type: SubjectType, key: &str, excluded: &[String]) -> Propagation {
        self.record("delete", subject_type, key, &[]);
        let subject = self.find(subject_type, key)?;
        self.identities.remove(subject_type, key);
        Ok(propagate(&subject.resources, excluded))
    }

    fn assign(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation {
        self.record("assign", subject_type, key, resources);
        self.modify(subject_type, key, |subject| {
            subject.resources.extend(resources.iter().cloned())
        })?;
        Ok(propagate(resources, &[]))
    }

    fn unassign(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation {
        self.record("unassign", subject_type, key, resources);
        self.modify(subject_type, key, |subject| {
            subject.resources.retain(|r| !resources.contains(r))
        })?;
        Ok(propagate(resources, &[]))
    }

    fn provision(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation {
        self.record("provision", subject_type, key, resources);
        self.find(subject_type, key)?;
        Ok(propagate(resources, &[]))
    }

    fn deprovision(
        &self,
        subject_type: SubjectType,
        key: &str,
        resources: &[String],
    ) -> Propagation {
        self.record("deprovision", subject_type, key, resources);
        self.find(subject_type, key)?;
        Ok(propagate(resources, &[]))
    }

    fn link(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation {
        self.record("link", subject_type, key, resources);
        self.modify(subject_type, key, |subject| {
            subject.resources.extend(resources.iter().cloned())
        })?;
        Ok(Vec::new())
    }

    fn unlink(&self, subject_type: SubjectType, key: &str, resources: &[String]) -> Propagation {
        self.record("unlink", subject_type, key, resources);
        self.modify(subject_type, key, |subject| {
            subject.resources.retain(|r| !resources.contains(r))
        })?;
        Ok(Vec::new())
    }
}
