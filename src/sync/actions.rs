//! Extension points invoked around each reconciliation transition.
//!
//! Every hook defaults to a no-op. A hook returning
//! [`ReconciliationError::Ignore`] skips the current entity and records it
//! as ignored; any other error fails that entity only.

use super::connector::SyncDelta;
use super::error::ReconciliationError;
use super::identity::{Subject, SubjectDraft, SubjectPatch};
use super::model::SyncResult;
use super::profile::{PullProfile, PushProfile};

type Hook = Result<(), ReconciliationError>;

pub trait PullActions: Send + Sync {
    fn before_all(&self, _profile: &PullProfile) -> Hook {
        Ok(())
    }

    /// May rewrite the delta before correlation.
    fn preprocess(
        &self,
        _profile: &PullProfile,
        delta: SyncDelta,
    ) -> Result<SyncDelta, ReconciliationError> {
        Ok(delta)
    }

    fn before_provision(
        &self,
        _profile: &PullProfile,
        _delta: &SyncDelta,
        _draft: &mut SubjectDraft,
    ) -> Hook {
        Ok(())
    }

    fn before_assign(
        &self,
        _profile: &PullProfile,
        _delta: &SyncDelta,
        _draft: &mut SubjectDraft,
    ) -> Hook {
        Ok(())
    }

    fn before_update(
        &self,
        _profile: &PullProfile,
        _delta: &SyncDelta,
        _before: &Subject,
        _patch: &mut SubjectPatch,
    ) -> Hook {
        Ok(())
    }

    fn before_deprovision(&self, _profile: &PullProfile, _delta: &SyncDelta, _before: &Subject) -> Hook {
        Ok(())
    }

    fn before_unassign(&self, _profile: &PullProfile, _delta: &SyncDelta, _before: &Subject) -> Hook {
        Ok(())
    }

    fn before_link(&self, _profile: &PullProfile, _delta: &SyncDelta, _before: &Subject) -> Hook {
        Ok(())
    }

    fn before_unlink(&self, _profile: &PullProfile, _delta: &SyncDelta, _before: &Subject) -> Hook {
        Ok(())
    }

    fn before_delete(&self, _profile: &PullProfile, _delta: &SyncDelta, _before: &Subject) -> Hook {
        Ok(())
    }

    fn after(
        &self,
        _profile: &PullProfile,
        _delta: &SyncDelta,
        _subject: Option<&Subject>,
        _result: &SyncResult,
    ) -> Hook {
        Ok(())
    }

    /// Sees every per-entity failure. Returning `Ignore` downgrades it.
    fn on_error(
        &self,
        _profile: &PullProfile,
        _delta: &SyncDelta,
        _error: &ReconciliationError,
    ) -> Hook {
        Ok(())
    }

    fn after_all(&self, _profile: &PullProfile) -> Hook {
        Ok(())
    }
}

pub trait PushActions: Send + Sync {
    fn before_all(&self, _profile: &PushProfile) -> Hook {
        Ok(())
    }

    fn before_provision(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn before_assign(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn before_update(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn before_deprovision(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn before_unassign(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn before_link(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn before_unlink(&self, _profile: &PushProfile, _subject: &Subject) -> Hook {
        Ok(())
    }

    fn after(&self, _profile: &PushProfile, _subject: &Subject, _result: &SyncResult) -> Hook {
        Ok(())
    }

    /// Notified after a push failure was recorded; cannot undo it.
    fn on_error(
        &self,
        _profile: &PushProfile,
        _subject: &Subject,
        _result: &SyncResult,
        _error: &ReconciliationError,
    ) {
    }

    fn after_all(&self, _profile: &PushProfile) -> Hook {
        Ok(())
    }
}
