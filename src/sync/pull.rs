//! Pull direction of the reconciliation state machine: one external change
//! in, zero or more internal transitions out.

use super::connector::{ConnectorObject, DeltaType, SyncDelta, SyncToken};
use super::correlation::Correlator;
use super::error::ReconciliationError;
use super::identity::{Subject, SubjectDraft, SubjectPatch};
use super::model::{
    ConflictResolutionAction, MatchingRule, ResourceOperation, SubjectType, SyncResult,
    UnmatchingRule,
};
use super::profile::PullProfile;
use super::provisioning::PropagationStatus;
use super::resource::Provision;
use crate::audit::{AuditEvent, AuditResult, EventCategory};
use crate::job::context::JobContext;
use crate::job::delegate::JobDependencies;
use crate::metrics;
use crate::security;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error, warn};

type Transition = Result<Option<Subject>, ReconciliationError>;

/// Fails with the first per-resource propagation failure.
pub(crate) fn check_propagation(statuses: &[PropagationStatus]) -> Result<(), ReconciliationError> {
    match statuses.iter().find(|s| s.is_failure()) {
        Some(status) => Err(ReconciliationError::PerEntity(format!(
            "propagation to {} failed: {}",
            status.resource,
            status.failure_reason.as_deref().unwrap_or("unknown reason")
        ))),
        None => Ok(()),
    }
}

fn require_object(delta: &SyncDelta) -> Result<&ConnectorObject, ReconciliationError> {
    delta.object.as_ref().ok_or_else(|| {
        ReconciliationError::PerEntity(format!("{} change carries no object", delta.uid))
    })
}

/// Handles the deltas of one pull run.
///
/// Per-entity failures become FAILURE results and never stop the run.
/// `handle` returns `false` only when the run must stop: missing provision,
/// interruption, or, in incremental mode, a failed change (the sync token
/// then stays before it).
pub struct PullResultHandler<'a> {
    deps: &'a JobDependencies,
    ctx: &'a JobContext,
    correlator: Correlator<'a>,
    incremental: bool,
    latest_tokens: HashMap<String, SyncToken>,
    pending_memberships: BTreeMap<String, BTreeSet<String>>,
    interrupted: bool,
}

impl<'a> PullResultHandler<'a> {
    pub fn new(deps: &'a JobDependencies, ctx: &'a JobContext, incremental: bool) -> Self {
        Self {
            deps,
            ctx,
            correlator: Correlator::new(deps.identities.as_ref(), &deps.correlation_rules),
            incremental,
            latest_tokens: HashMap::new(),
            pending_memberships: BTreeMap::new(),
            interrupted: false,
        }
    }

    /// Token of the last change fully handled for an object class.
    pub fn latest_token(&self, object_class: &str) -> Option<&SyncToken> {
        self.latest_tokens.get(object_class)
    }

    /// Group memberships to apply once the run is over, by user key.
    pub fn pending_memberships(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.pending_memberships
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn handle(&mut self, profile: &mut PullProfile, delta: SyncDelta) -> bool {
        let Some(provision) = profile
            .spec
            .resource
            .provisions
            .iter()
            .find(|p| p.object_class == delta.object_class)
            .cloned()
        else {
            error!(
                "No provision found on {} for {}",
                profile.resource_key(),
                delta.object_class
            );
            return false;
        };

        let token = delta.token.clone();
        let object_class = delta.object_class.clone();
        let uid = delta.uid.clone();
        let name = delta.display_name().to_string();
        let first_new = profile.results.len();

        match self.do_handle(profile, &provision, delta) {
            Ok(results) => {
                for result in results {
                    record(profile, "pull", result);
                }
            }
            Err(ReconciliationError::Ignore(message)) => {
                warn!("Ignoring {} during pull: {}", uid, message);
                let mut result =
                    SyncResult::new(provision.subject_type, ResourceOperation::None, &name)
                        .with_uid_value(Some(uid));
                result.ignore(message);
                record(profile, "pull", result);
                self.advance_token(&object_class, token);
                return true;
            }
            Err(ReconciliationError::Fatal(message)) => {
                error!("Pull failed: {}", message);
                return false;
            }
            Err(e @ (ReconciliationError::AmbiguousMatch(_)
            | ReconciliationError::InvalidCorrelation(_))) => {
                warn!("Skipping {}: {}", uid, e);
            }
            Err(e) => {
                error!("Could not handle {}: {}", uid, e);
                let mut result =
                    SyncResult::new(provision.subject_type, ResourceOperation::None, &name)
                        .with_uid_value(Some(uid));
                result.fail(e.to_string());
                record(profile, "pull", result);
            }
        }

        if !self.incremental {
            return !self.check_interrupted();
        }

        let failed = profile.results[first_new..].iter().any(SyncResult::is_failure);
        if !failed {
            self.advance_token(&object_class, token);
        }
        if self.check_interrupted() {
            return false;
        }
        !failed
    }

    fn check_interrupted(&mut self) -> bool {
        if !self.interrupted && self.ctx.is_cancelled() {
            debug!("Pull interrupted");
            self.interrupted = true;
        }
        self.interrupted
    }

    fn advance_token(&mut self, object_class: &str, token: Option<SyncToken>) {
        if let Some(token) = token {
            self.latest_tokens.insert(object_class.to_string(), token);
        }
    }

    fn do_handle(
        &mut self,
        profile: &PullProfile,
        provision: &Provision,
        delta: SyncDelta,
    ) -> Result<Vec<SyncResult>, ReconciliationError> {
        debug!(
            "Process {:?} for {} as {}",
            delta.delta_type, delta.uid, delta.object_class
        );
        let mut delta = delta;
        for action in &profile.actions {
            delta = action.preprocess(profile, delta)?;
        }

        let mut matches = self
            .correlator
            .find_existing(&profile.spec.resource, provision, &delta)?;
        if matches.len() > 1 {
            match profile.conflict_resolution {
                ConflictResolutionAction::Ignore => {
                    return Err(ReconciliationError::AmbiguousMatch(
                        matches.into_iter().map(|s| s.key).collect(),
                    ));
                }
                ConflictResolutionAction::FirstMatch => matches.truncate(1),
                ConflictResolutionAction::LastMatch => {
                    matches = matches.pop().into_iter().collect();
                }
            }
        }
        debug!("Match(es) found for {}: {}", delta.uid, matches.len());

        match delta.delta_type {
            DeltaType::CreateOrUpdate if matches.is_empty() => {
                self.unmatched(profile, provision, &delta)
            }
            DeltaType::CreateOrUpdate => self.matched(profile, provision, &delta, matches),
            DeltaType::Delete if matches.is_empty() => {
                debug!("Nothing to delete for {}", delta.uid);
                Ok(Vec::new())
            }
            DeltaType::Delete => self.delete(profile, provision, &delta, matches),
        }
    }

    fn unmatched(
        &mut self,
        profile: &PullProfile,
        provision: &Provision,
        delta: &SyncDelta,
    ) -> Result<Vec<SyncResult>, ReconciliationError> {
        let rule = profile.spec.unmatching_rule;
        let object = require_object(delta)?;

        if matches!(rule, UnmatchingRule::Unlink | UnmatchingRule::Ignore) {
            debug!("Nothing to {} for unmatched {}", rule.event_name(), delta.uid);
            let result =
                SyncResult::new(provision.subject_type, ResourceOperation::None, delta.display_name())
                    .with_uid_value(Some(delta.uid.clone()));
            if !profile.dry_run {
                self.audit(profile, provision, delta, rule.event_name(), true, None, None);
            }
            return Ok(vec![result]);
        }

        let mut draft = SubjectDraft::from_object(provision, object, profile.spec.sync_status);
        if rule == UnmatchingRule::Assign {
            draft.resources.insert(profile.resource_key().to_string());
        }
        let mut result = SyncResult::new(provision.subject_type, ResourceOperation::Create, &draft.name)
            .with_uid_value(Some(delta.uid.clone()));

        if !profile.spec.perform_create {
            debug!("Pull task not configured for create");
            result.ignore("not configured for create");
        } else if !profile.dry_run {
            let outcome = self.create(profile, delta, rule, &mut draft, &mut result);
            self.finish(profile, provision, delta, rule.event_name(), &mut result, None, outcome)?;
        }
        Ok(vec![result])
    }

    fn matched(
        &mut self,
        profile: &PullProfile,
        provision: &Provision,
        delta: &SyncDelta,
        matches: Vec<Subject>,
    ) -> Result<Vec<SyncResult>, ReconciliationError> {
        let rule = profile.spec.matching_rule;
        let object = require_object(delta)?;
        let mut results = Vec::with_capacity(matches.len());

        for before in matches {
            let mut result = SyncResult::new(provision.subject_type, rule.operation(), &before.name)
                .with_key(&before.key)
                .with_uid_value(Some(delta.uid.clone()));

            if rule == MatchingRule::Ignore {
                if !profile.dry_run {
                    self.audit(profile, provision, delta, rule.event_name(), true, Some(&before), None);
                }
            } else if !profile.spec.perform_update {
                debug!("Pull task not configured for update");
                result.ignore("not configured for update");
            } else if !profile.dry_run {
                let outcome = match rule {
                    MatchingRule::Update => self.update(profile, provision, delta, object, &before, &mut result),
                    MatchingRule::Deprovision | MatchingRule::Unassign => {
                        self.deprovision(profile, delta, rule, &before)
                    }
                    MatchingRule::Link => self.link(profile, delta, &before, false),
                    MatchingRule::Unlink => self.link(profile, delta, &before, true),
                    MatchingRule::Ignore => Ok(None),
                };
                self.finish(profile, provision, delta, rule.event_name(), &mut result, Some(&before), outcome)?;
            }
            results.push(result);
        }
        Ok(results)
    }

    fn delete(
        &mut self,
        profile: &PullProfile,
        provision: &Provision,
        delta: &SyncDelta,
        matches: Vec<Subject>,
    ) -> Result<Vec<SyncResult>, ReconciliationError> {
        let mut results = Vec::with_capacity(matches.len());
        for before in matches {
            let mut result =
                SyncResult::new(provision.subject_type, ResourceOperation::Delete, &before.name)
                    .with_key(&before.key)
                    .with_uid_value(Some(delta.uid.clone()));

            if !profile.spec.perform_delete {
                debug!("Pull task not configured for delete");
                result.ignore("not configured for delete");
            } else if !profile.dry_run {
                let outcome = self.remove(profile, delta, &before);
                self.finish(profile, provision, delta, "delete", &mut result, Some(&before), outcome)?;
            }
            results.push(result);
        }
        Ok(results)
    }

    fn create(
        &self,
        profile: &PullProfile,
        delta: &SyncDelta,
        rule: UnmatchingRule,
        draft: &mut SubjectDraft,
        result: &mut SyncResult,
    ) -> Transition {
        for action in &profile.actions {
            match rule {
                UnmatchingRule::Assign => action.before_assign(profile, delta, draft)?,
                _ => action.before_provision(profile, delta, draft)?,
            }
        }
        result.name = draft.name.clone();

        let created = self
            .deps
            .provisioning
            .create(draft, &[profile.resource_key().to_string()])?;
        result.key = Some(created.key.clone());
        check_propagation(&created.statuses)?;
        debug!("{} {} successfully created", draft.subject_type, created.key);
        Ok(self.deps.identities.find(draft.subject_type, &created.key)?)
    }

    fn update(
        &self,
        profile: &PullProfile,
        provision: &Provision,
        delta: &SyncDelta,
        object: &ConnectorObject,
        before: &Subject,
        result: &mut SyncResult,
    ) -> Transition {
        let mut patch = SubjectPatch::from_object(before, provision, object, profile.spec.sync_status);
        for action in &profile.actions {
            action.before_update(profile, delta, before, &mut patch)?;
        }
        if patch.is_empty() {
            debug!("{} {} already up to date", before.subject_type, before.key);
            return Ok(Some(before.clone()));
        }

        let statuses = self
            .deps
            .provisioning
            .update(&patch, &[profile.resource_key().to_string()])?;
        check_propagation(&statuses)?;
        let updated = self.deps.identities.find(before.subject_type, &before.key)?;
        if let Some(updated) = &updated {
            result.name = updated.name.clone();
        }
        Ok(updated)
    }

    fn deprovision(
        &self,
        profile: &PullProfile,
        delta: &SyncDelta,
        rule: MatchingRule,
        before: &Subject,
    ) -> Transition {
        let resources = [profile.resource_key().to_string()];
        let statuses = if rule == MatchingRule::Unassign {
            for action in &profile.actions {
                action.before_unassign(profile, delta, before)?;
            }
            self.deps
                .provisioning
                .unassign(before.subject_type, &before.key, &resources)?
        } else {
            for action in &profile.actions {
                action.before_deprovision(profile, delta, before)?;
            }
            self.deps
                .provisioning
                .deprovision(before.subject_type, &before.key, &resources)?
        };
        check_propagation(&statuses)?;
        Ok(self.deps.identities.find(before.subject_type, &before.key)?)
    }

    fn link(&self, profile: &PullProfile, delta: &SyncDelta, before: &Subject, unlink: bool) -> Transition {
        let resources = [profile.resource_key().to_string()];
        for action in &profile.actions {
            if unlink {
                action.before_unlink(profile, delta, before)?;
            } else {
                action.before_link(profile, delta, before)?;
            }
        }
        let statuses = if unlink {
            self.deps
                .provisioning
                .unlink(before.subject_type, &before.key, &resources)?
        } else {
            self.deps
                .provisioning
                .link(before.subject_type, &before.key, &resources)?
        };
        check_propagation(&statuses)?;
        Ok(self.deps.identities.find(before.subject_type, &before.key)?)
    }

    fn remove(&self, profile: &PullProfile, delta: &SyncDelta, before: &Subject) -> Transition {
        for action in &profile.actions {
            action.before_delete(profile, delta, before)?;
        }
        let statuses = self.deps.provisioning.delete(
            before.subject_type,
            &before.key,
            &[profile.resource_key().to_string()],
        )?;
        check_propagation(&statuses)?;
        Ok(None)
    }

    /// Runs the `after` hooks, settles the result and fires side effects.
    /// Only an `Ignore` raised by a hook escapes.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &mut self,
        profile: &PullProfile,
        provision: &Provision,
        delta: &SyncDelta,
        event: &str,
        result: &mut SyncResult,
        before: Option<&Subject>,
        outcome: Transition,
    ) -> Result<(), ReconciliationError> {
        let outcome = outcome.and_then(|subject| {
            for action in &profile.actions {
                action.after(profile, delta, subject.as_ref(), result)?;
            }
            Ok(subject)
        });

        let output = match outcome {
            Ok(subject) => {
                if let Some(subject) = &subject {
                    self.collect_memberships(provision, delta, subject);
                }
                subject.and_then(|s| serde_json::to_value(s).ok())
            }
            Err(e @ ReconciliationError::Ignore(_)) => return Err(e),
            Err(e) => {
                for action in &profile.actions {
                    action.on_error(profile, delta, &e)?;
                }
                error!(
                    "Could not {} {} {}: {}",
                    event, provision.subject_type, delta.uid, e
                );
                result.fail(e.to_string());
                Some(json!({ "error": e.to_string() }))
            }
        };

        self.audit(profile, provision, delta, event, !result.is_failure(), before, output);
        Ok(())
    }

    fn collect_memberships(&mut self, provision: &Provision, delta: &SyncDelta, subject: &Subject) {
        let Some(attr) = &provision.membership_attr else {
            return;
        };
        if subject.subject_type != SubjectType::User {
            return;
        }
        let Some(group_names) = delta.object.as_ref().and_then(|o| o.attr(attr)) else {
            return;
        };
        for group_name in group_names {
            match self.deps.identities.find_by_name(SubjectType::Group, group_name) {
                Ok(Some(group)) => {
                    self.pending_memberships
                        .entry(subject.key.clone())
                        .or_default()
                        .insert(group.key);
                }
                Ok(None) => debug!("Group {} not found, membership skipped", group_name),
                Err(e) => warn!("Could not look group {} up: {:#}", group_name, e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        profile: &PullProfile,
        provision: &Provision,
        delta: &SyncDelta,
        event: &str,
        success: bool,
        before: Option<&Subject>,
        output: Option<Value>,
    ) {
        let event = AuditEvent::new(
            EventCategory::Synchronization,
            &provision.subject_type.as_str().to_lowercase(),
            event,
            AuditResult::from_success(success),
            &security::who(&profile.executor),
        )
        .with_resource(profile.resource_key())
        .with_before(before.and_then(|b| serde_json::to_value(b).ok()))
        .with_output(output)
        .with_input(serde_json::to_value(delta).unwrap_or(Value::Null));
        self.deps.side_effects.fire(&profile.domain, &event);
    }
}

pub(crate) fn record<A: ?Sized>(
    profile: &mut super::profile::SyncProfile<A>,
    direction: &str,
    result: SyncResult,
) {
    metrics::record_sync_result(direction, result.operation.as_str(), result.status.as_str());
    profile.results.push(result);
}
