//! Job bodies and task delegates shipped with the crate.
//!
//! Task delegates are registered by key in a [`DelegateRegistry`]; the
//! other bodies here (reports, notifications, load reporting, deferred
//! memberships) are scheduled directly by the job manager or by pull runs.

pub mod access_token_cleanup;
pub mod group_member_provision;
pub mod macro_run;
pub mod notification;
pub mod recertification;
pub mod report;
pub mod set_memberships;
pub mod system_load;

pub use access_token_cleanup::ExpiredAccessTokenCleanup;
pub use group_member_provision::{GroupMemberAction, GroupMemberProvisionDelegate};
pub use macro_run::{Command, LogCommand, MacroJobDelegate, SetConfParamCommand};
pub use notification::{LogNotificationSender, NotificationJob, NotificationSender};
pub use recertification::{CertificationRequester, IdentityRecertification, LogCertificationRequester};
pub use report::{ReportDelegate, ReportJob, TaskExecSummaryReportlet};
pub use set_memberships::SetMembershipsJob;
pub use system_load::SystemLoadReporterJob;

use super::delegate::{DelegateRegistry, ImplementationRegistry};
use crate::sync::pull_delegate::PullJobDelegate;
use crate::sync::push_delegate::PushJobDelegate;
use std::sync::Arc;

pub const EXPIRED_ACCESS_TOKEN_CLEANUP: &str = "ExpiredAccessTokenCleanup";
pub const IDENTITY_RECERTIFICATION: &str = "IdentityRecertification";
pub const MACRO_JOB_DELEGATE: &str = "MacroJobDelegate";
pub const GROUP_MEMBER_PROVISION: &str = "GroupMemberProvisionTaskJobDelegate";
pub const PULL_JOB_DELEGATE: &str = "PullJobDelegate";
pub const PUSH_JOB_DELEGATE: &str = "PushJobDelegate";
pub const LIVE_SYNC_JOB_DELEGATE: &str = "LiveSyncJobDelegate";

pub const TASK_EXEC_SUMMARY_REPORTLET: &str = "TaskExecSummaryReportlet";

pub fn register_standard_delegates(registry: &mut DelegateRegistry) {
    registry.register(
        EXPIRED_ACCESS_TOKEN_CLEANUP,
        Box::new(|deps| Arc::new(ExpiredAccessTokenCleanup::new(deps.clone()))),
    );
    registry.register(
        IDENTITY_RECERTIFICATION,
        Box::new(|deps| Arc::new(IdentityRecertification::new(deps.clone()))),
    );
    registry.register(
        MACRO_JOB_DELEGATE,
        Box::new(|deps| Arc::new(MacroJobDelegate::new(deps.clone()))),
    );
    registry.register(
        GROUP_MEMBER_PROVISION,
        Box::new(|deps| Arc::new(GroupMemberProvisionDelegate::new(deps.clone()))),
    );
    registry.register(
        PULL_JOB_DELEGATE,
        Box::new(|deps| Arc::new(PullJobDelegate::new(deps.clone()))),
    );
    registry.register(
        LIVE_SYNC_JOB_DELEGATE,
        Box::new(|deps| Arc::new(PullJobDelegate::live_sync(deps.clone()))),
    );
    registry.register(
        PUSH_JOB_DELEGATE,
        Box::new(|deps| Arc::new(PushJobDelegate::new(deps.clone()))),
    );
}

pub fn register_builtin_commands(registry: &mut ImplementationRegistry<dyn Command>) {
    registry.register(macro_run::LOG_COMMAND, Arc::new(LogCommand));
    registry.register(macro_run::SET_CONF_PARAM_COMMAND, Arc::new(SetConfParamCommand));
}

pub fn register_builtin_reportlets(registry: &mut ImplementationRegistry<dyn ReportDelegate>) {
    registry.register(TASK_EXEC_SUMMARY_REPORTLET, Arc::new(TaskExecSummaryReportlet));
}
