//! Identity synchronization between the internal repository and external
//! resources: pull reconciliation, push propagation and their reports.

pub mod actions;
pub mod connector;
pub mod correlation;
pub mod error;
pub mod identity;
pub mod model;
pub mod profile;
pub mod provisioning;
pub mod pull;
pub mod pull_delegate;
pub mod push;
pub mod push_delegate;
pub mod report;
pub mod resource;

pub use error::ReconciliationError;
pub use model::{
    ConflictResolutionAction, MatchingRule, ResourceOperation, SubjectType, SyncResult, SyncStatus,
    TraceLevel, UnmatchingRule,
};
pub use pull::PullResultHandler;
pub use pull_delegate::PullJobDelegate;
pub use push::PushResultHandler;
pub use push_delegate::PushJobDelegate;
