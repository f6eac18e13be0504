//! Push direction: one internal subject out, compared against what the
//! resource currently holds for it.

use super::connector::{ConnectorError, ConnectorObject, OperationOptions};
use super::error::ReconciliationError;
use super::identity::{Subject, SubjectPatch};
use super::model::{MatchingRule, ResourceOperation, SubjectType, SyncResult, SyncStatus, UnmatchingRule};
use super::profile::PushProfile;
use super::provisioning::{PropagationStatus, PropagationStatusKind};
use super::pull::record;
use super::resource::Provision;
use crate::audit::{AuditEvent, AuditResult, EventCategory};
use crate::job::context::JobContext;
use crate::job::delegate::JobDependencies;
use crate::security;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

/// Outcome of a rule-driven transition before it is settled into a result.
enum Transition {
    /// The perform switch for this kind of change is off.
    Skipped(&'static str),
    Ignored,
    Applied(Vec<PropagationStatus>),
}

pub struct PushResultHandler<'a> {
    deps: &'a JobDependencies,
    ctx: &'a JobContext,
}

impl<'a> PushResultHandler<'a> {
    pub fn new(deps: &'a JobDependencies, ctx: &'a JobContext) -> Self {
        Self { deps, ctx }
    }

    /// Pushes one subject. A failure is recorded and the run goes on;
    /// returns `false` only when the run was interrupted or cannot go on.
    pub fn handle(&self, profile: &mut PushProfile, provision: &Provision, subject: &Subject) -> bool {
        let uid_value = subject.conn_object_key_value(provision);
        let outcome = self.do_handle(profile, provision, subject, uid_value.as_deref());
        let result = match outcome {
            Ok(result) => result,
            Err(ReconciliationError::Ignore(message)) => {
                warn!("Ignoring {} during push: {}", subject.key, message);
                let mut result = SyncResult::new(subject.subject_type, ResourceOperation::None, &subject.name)
                    .with_key(&subject.key)
                    .with_uid_value(uid_value);
                result.ignore(message);
                result
            }
            Err(ReconciliationError::Fatal(message)) => {
                error!("Push failed: {}", message);
                return false;
            }
            Err(e) => {
                warn!("Error pushing {} towards {}: {}", subject.key, profile.resource_key(), e);
                let mut result = SyncResult::new(subject.subject_type, ResourceOperation::None, &subject.name)
                    .with_key(&subject.key)
                    .with_uid_value(uid_value);
                result.fail(e.to_string());
                for action in &profile.actions {
                    action.on_error(profile, subject, &result, &e);
                }
                result
            }
        };
        record(profile, "push", result);
        !self.ctx.is_cancelled()
    }

    fn do_handle(
        &self,
        profile: &PushProfile,
        provision: &Provision,
        subject: &Subject,
        uid_value: Option<&str>,
    ) -> Result<SyncResult, ReconciliationError> {
        debug!(
            "Propagating {} {} towards {}",
            subject.subject_type,
            subject.key,
            profile.resource_key()
        );
        let before = self.remote_object(profile, provision, uid_value)?;
        let matched = before.is_some();
        let (operation, event) = if matched {
            let rule = profile.spec.matching_rule;
            (rule.operation(), rule.event_name())
        } else {
            let rule = profile.spec.unmatching_rule;
            (rule.operation(), rule.event_name())
        };

        let mut result = SyncResult::new(subject.subject_type, operation, &subject.name)
            .with_key(&subject.key)
            .with_uid_value(uid_value.map(str::to_string));
        if profile.dry_run {
            return Ok(result);
        }

        let transition = if matched {
            self.matched(profile, subject)
        } else {
            self.unmatched(profile, subject)
        };

        let transition = transition.and_then(|transition| {
            settle(&mut result, profile.resource_key(), transition);
            for action in &profile.actions {
                action.after(profile, subject, &result)?;
            }
            Ok(())
        });

        let output = match transition {
            Ok(()) => self
                .remote_object(profile, provision, uid_value)
                .ok()
                .flatten()
                .and_then(|o| serde_json::to_value(o).ok()),
            Err(e @ ReconciliationError::Ignore(_)) => return Err(e),
            Err(e) => {
                warn!("Error pushing {} towards {}: {}", subject.key, profile.resource_key(), e);
                result.fail(e.to_string());
                for action in &profile.actions {
                    action.on_error(profile, subject, &result, &e);
                }
                Some(json!({ "error": e.to_string() }))
            }
        };

        let audit = AuditEvent::new(
            EventCategory::Push,
            &subject.subject_type.as_str().to_lowercase(),
            event,
            AuditResult::from_success(!result.is_failure()),
            &security::who(&profile.executor),
        )
        .with_resource(profile.resource_key())
        .with_before(before.and_then(|o| serde_json::to_value(o).ok()))
        .with_output(output)
        .with_input(serde_json::to_value(subject).unwrap_or(Value::Null));
        self.deps.side_effects.fire(&profile.domain, &audit);

        Ok(result)
    }

    /// Reads what the resource holds for the subject. Timeouts are
    /// propagated; any other lookup failure counts as not found.
    fn remote_object(
        &self,
        profile: &PushProfile,
        provision: &Provision,
        uid_value: Option<&str>,
    ) -> Result<Option<ConnectorObject>, ReconciliationError> {
        let Some(value) = uid_value else {
            return Ok(None);
        };
        let options = OperationOptions {
            attributes_to_get: provision.all_items().map(|i| i.ext_attr_name.clone()).collect(),
            page_size: None,
        };
        match profile.connector.get_object(
            &provision.object_class,
            &provision.conn_object_key.ext_attr_name,
            value,
            &options,
        ) {
            Ok(object) => Ok(object),
            Err(e @ ConnectorError::Timeout(_)) => {
                debug!("Request timeout while resolving {}", value);
                Err(e.into())
            }
            Err(e) => {
                debug!("While resolving {}: {}", value, e);
                Ok(None)
            }
        }
    }

    fn unmatched(&self, profile: &PushProfile, subject: &Subject) -> Result<Transition, ReconciliationError> {
        let resources = [profile.resource_key().to_string()];
        let provisioning = &self.deps.provisioning;
        let spec = &profile.spec;
        match spec.unmatching_rule {
            UnmatchingRule::Assign => {
                for action in &profile.actions {
                    action.before_assign(profile, subject)?;
                }
                if !spec.perform_create {
                    return Ok(Transition::Skipped("create"));
                }
                Ok(Transition::Applied(provisioning.assign(
                    subject.subject_type,
                    &subject.key,
                    &resources,
                )?))
            }
            UnmatchingRule::Provision => {
                for action in &profile.actions {
                    action.before_provision(profile, subject)?;
                }
                if !spec.perform_create {
                    return Ok(Transition::Skipped("create"));
                }
                Ok(Transition::Applied(provisioning.provision(
                    subject.subject_type,
                    &subject.key,
                    &resources,
                )?))
            }
            UnmatchingRule::Unlink => {
                for action in &profile.actions {
                    action.before_unlink(profile, subject)?;
                }
                if !spec.perform_update {
                    return Ok(Transition::Skipped("update"));
                }
                Ok(Transition::Applied(provisioning.unlink(
                    subject.subject_type,
                    &subject.key,
                    &resources,
                )?))
            }
            UnmatchingRule::Ignore => Ok(Transition::Ignored),
        }
    }

    fn matched(&self, profile: &PushProfile, subject: &Subject) -> Result<Transition, ReconciliationError> {
        let resource = profile.resource_key().to_string();
        let resources = [resource.clone()];
        let provisioning = &self.deps.provisioning;
        let spec = &profile.spec;
        match spec.matching_rule {
            MatchingRule::Update => {
                for action in &profile.actions {
                    action.before_update(profile, subject)?;
                }
                if !spec.perform_update {
                    return Ok(Transition::Skipped("update"));
                }
                let mut patch = SubjectPatch::new(subject.subject_type, &subject.key);
                if spec.sync_status && subject.subject_type == SubjectType::User {
                    patch.enabled = Some(!subject.suspended);
                }
                let excluded: Vec<String> = subject
                    .resources
                    .iter()
                    .filter(|r| **r != resource)
                    .cloned()
                    .collect();
                Ok(Transition::Applied(provisioning.update(&patch, &excluded)?))
            }
            MatchingRule::Deprovision => {
                for action in &profile.actions {
                    action.before_deprovision(profile, subject)?;
                }
                if !spec.perform_delete {
                    return Ok(Transition::Skipped("delete"));
                }
                Ok(Transition::Applied(provisioning.deprovision(
                    subject.subject_type,
                    &subject.key,
                    &resources,
                )?))
            }
            MatchingRule::Unassign => {
                for action in &profile.actions {
                    action.before_unassign(profile, subject)?;
                }
                if !spec.perform_delete {
                    return Ok(Transition::Skipped("delete"));
                }
                Ok(Transition::Applied(provisioning.unassign(
                    subject.subject_type,
                    &subject.key,
                    &resources,
                )?))
            }
            MatchingRule::Link | MatchingRule::Unlink => {
                let unlink = spec.matching_rule == MatchingRule::Unlink;
                for action in &profile.actions {
                    if unlink {
                        action.before_unlink(profile, subject)?;
                    } else {
                        action.before_link(profile, subject)?;
                    }
                }
                if !spec.perform_update {
                    return Ok(Transition::Skipped("update"));
                }
                let statuses = if unlink {
                    provisioning.unlink(subject.subject_type, &subject.key, &resources)?
                } else {
                    provisioning.link(subject.subject_type, &subject.key, &resources)?
                };
                Ok(Transition::Applied(statuses))
            }
            MatchingRule::Ignore => Ok(Transition::Ignored),
        }
    }
}

/// Status of the push is the propagation status towards the task resource.
fn settle(result: &mut SyncResult, resource: &str, transition: Transition) {
    match transition {
        Transition::Skipped(kind) => {
            debug!("Push task not configured for {}", kind);
            result.ignore(format!("not configured for {}", kind));
        }
        Transition::Ignored => result.ignore("ignored by rule"),
        Transition::Applied(statuses) => {
            let Some(status) = statuses.iter().find(|s| s.resource == resource) else {
                result.status = SyncStatus::Success;
                return;
            };
            match status.status {
                PropagationStatusKind::Success => result.status = SyncStatus::Success,
                PropagationStatusKind::Failure => result.fail(
                    status
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("propagation to {} failed", resource)),
                ),
                PropagationStatusKind::Created | PropagationStatusKind::NotAttempted => {
                    result.ignore(format!("propagation to {} not attempted", resource))
                }
            }
        }
    }
}
