use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of internal identity a provision maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectType {
    User,
    Group,
    AnyObject,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::User => "USER",
            SubjectType::Group => "GROUP",
            SubjectType::AnyObject => "ANY_OBJECT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(SubjectType::User),
            "GROUP" => Some(SubjectType::Group),
            "ANY_OBJECT" => Some(SubjectType::AnyObject),
            _ => None,
        }
    }

    /// Plural label used in reconciliation reports.
    pub fn report_label(&self) -> &'static str {
        match self {
            SubjectType::User => "Users",
            SubjectType::Group => "Groups",
            SubjectType::AnyObject => "Any objects",
        }
    }

    /// Processing order within a run: groups first so memberships resolve.
    pub fn processing_rank(&self) -> u8 {
        match self {
            SubjectType::Group => 0,
            SubjectType::User => 1,
            SubjectType::AnyObject => 2,
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Net effect of a reconciliation step on the external resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
    None,
}

impl ResourceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOperation::Create => "CREATE",
            ResourceOperation::Update => "UPDATE",
            ResourceOperation::Delete => "DELETE",
            ResourceOperation::None => "NONE",
        }
    }
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Failure,
    Ignore,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Failure => "FAILURE",
            SyncStatus::Ignore => "IGNORE",
        }
    }
}

/// Outcome of reconciling one entity for one delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub key: Option<String>,
    pub subject_type: SubjectType,
    pub name: String,
    /// Value of the connector object key attribute, when known.
    pub uid_value: Option<String>,
    pub operation: ResourceOperation,
    pub status: SyncStatus,
    pub message: Option<String>,
}

impl SyncResult {
    pub fn new(subject_type: SubjectType, operation: ResourceOperation, name: &str) -> Self {
        Self {
            key: None,
            subject_type,
            name: name.to_string(),
            uid_value: None,
            operation,
            status: SyncStatus::Success,
            message: None,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_uid_value(mut self, uid_value: Option<String>) -> Self {
        self.uid_value = uid_value;
        self
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = SyncStatus::Failure;
        self.message = Some(message.into());
    }

    pub fn ignore(&mut self, message: impl Into<String>) {
        self.status = SyncStatus::Ignore;
        self.message = Some(message.into());
    }

    pub fn is_failure(&self) -> bool {
        self.status == SyncStatus::Failure
    }
}

/// Transition applied when a delta correlates to an existing internal entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchingRule {
    #[default]
    Update,
    Deprovision,
    Unassign,
    Link,
    Unlink,
    Ignore,
}

impl MatchingRule {
    pub fn event_name(&self) -> &'static str {
        match self {
            MatchingRule::Update => "update",
            MatchingRule::Deprovision => "deprovision",
            MatchingRule::Unassign => "unassign",
            MatchingRule::Link => "link",
            MatchingRule::Unlink => "unlink",
            MatchingRule::Ignore => "ignore",
        }
    }

    pub fn operation(&self) -> ResourceOperation {
        match self {
            MatchingRule::Update => ResourceOperation::Update,
            MatchingRule::Deprovision | MatchingRule::Unassign => ResourceOperation::Delete,
            MatchingRule::Link | MatchingRule::Unlink | MatchingRule::Ignore => {
                ResourceOperation::None
            }
        }
    }
}

/// Transition applied when a delta does not correlate to any internal entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnmatchingRule {
    #[default]
    Provision,
    Assign,
    Unlink,
    Ignore,
}

impl UnmatchingRule {
    pub fn event_name(&self) -> &'static str {
        match self {
            UnmatchingRule::Provision => "provision",
            UnmatchingRule::Assign => "assign",
            UnmatchingRule::Unlink => "unlink",
            UnmatchingRule::Ignore => "ignore",
        }
    }

    pub fn operation(&self) -> ResourceOperation {
        match self {
            UnmatchingRule::Provision | UnmatchingRule::Assign => ResourceOperation::Create,
            UnmatchingRule::Unlink | UnmatchingRule::Ignore => ResourceOperation::None,
        }
    }
}

/// How to proceed when correlation yields more than one internal entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolutionAction {
    #[default]
    Ignore,
    FirstMatch,
    LastMatch,
}

/// Verbosity of the end-of-run report. Ordered from least to most verbose.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceLevel {
    None,
    Failures,
    Summary,
    #[default]
    All,
}
