//! Bulk provision or deprovision of a group's members on the group's
//! resources.

use crate::job::context::JobContext;
use crate::job::delegate::{JobDependencies, TaskJobDelegate};
use crate::job::error::JobError;
use crate::store::{Task, TaskSpec};
use crate::sync::identity::page_count;
use crate::sync::model::SubjectType;
use serde_json::Value;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

pub const GROUP_KEY_PARAM: &str = "groupKey";
pub const ACTION_PARAM: &str = "action";
const PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMemberAction {
    Provision,
    Deprovision,
}

impl GroupMemberAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROVISION" => Some(GroupMemberAction::Provision),
            "DEPROVISION" => Some(GroupMemberAction::Deprovision),
            _ => None,
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            GroupMemberAction::Provision => "provision",
            GroupMemberAction::Deprovision => "deprovision",
        }
    }
}

pub struct GroupMemberProvisionDelegate {
    deps: Arc<JobDependencies>,
}

impl GroupMemberProvisionDelegate {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self { deps }
    }
}

impl TaskJobDelegate for GroupMemberProvisionDelegate {
    fn execute(&self, task: &mut Task, ctx: &JobContext) -> Result<String, JobError> {
        let TaskSpec::Scheduled { params } = &task.spec else {
            return Err(JobError::Validation(format!("task {} is not a scheduled task", task.key)));
        };
        let group_key = params
            .get(GROUP_KEY_PARAM)
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::Validation(format!("'{}' is required", GROUP_KEY_PARAM)))?;
        let action = params
            .get(ACTION_PARAM)
            .and_then(Value::as_str)
            .and_then(GroupMemberAction::parse)
            .ok_or_else(|| {
                JobError::Validation(format!("'{}' must be PROVISION or DEPROVISION", ACTION_PARAM))
            })?;

        let identities = &self.deps.identities;
        let group = identities
            .find(SubjectType::Group, group_key)?
            .ok_or_else(|| JobError::NotFound(format!("group {}", group_key)))?;
        let resources: Vec<String> = group.resources.iter().cloned().collect();

        let mut output = String::new();
        let _ = writeln!(
            output,
            "{} members of group {} on {:?}",
            action.verb(),
            group.name,
            resources
        );

        let total = identities.count_members(group_key)?;
        let mut failures = 0;
        for page in 1..=page_count(total, PAGE_SIZE) {
            ctx.check_cancelled()?;
            for member in identities.members_page(group_key, page, PAGE_SIZE)? {
                if ctx.execution.dry_run {
                    let _ = writeln!(output, "{}: not executed (dry run)", member.name);
                    continue;
                }
                let result = match action {
                    GroupMemberAction::Provision => {
                        self.deps
                            .provisioning
                            .provision(SubjectType::User, &member.key, &resources)
                    }
                    GroupMemberAction::Deprovision => {
                        self.deps
                            .provisioning
                            .deprovision(SubjectType::User, &member.key, &resources)
                    }
                };
                match result {
                    Ok(statuses) => {
                        for status in statuses {
                            if status.is_failure() {
                                failures += 1;
                            }
                            let _ = writeln!(
                                output,
                                "{} on {}: {:?}{}",
                                member.name,
                                status.resource,
                                status.status,
                                status
                                    .failure_reason
                                    .as_ref()
                                    .map(|r| format!(" ({})", r))
                                    .unwrap_or_default()
                            );
                        }
                    }
                    Err(e) => {
                        warn!("Could not {} {}: {}", action.verb(), member.name, e);
                        failures += 1;
                        let _ = writeln!(output, "{}: {}", member.name, e);
                    }
                }
            }
        }

        info!(
            "{} of {} members of {} done, {} failures",
            action.verb(),
            total,
            group.name,
            failures
        );
        Ok(output)
    }
}
