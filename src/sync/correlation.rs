//! Finding the internal subjects an external change refers to.

use super::connector::{ConnectorObject, SyncDelta};
use super::error::ReconciliationError;
use super::identity::{IdentityRepository, SearchCond, Subject};
use super::resource::{ExternalResource, IntAttr, Provision};
use crate::job::delegate::ImplementationRegistry;
use tracing::debug;

/// Pluggable correlation: turns an external object into a search condition.
pub trait CorrelationRule: Send + Sync {
    fn search_cond(
        &self,
        object: &ConnectorObject,
        provision: &Provision,
    ) -> Result<SearchCond, ReconciliationError>;
}

pub struct Correlator<'a> {
    identities: &'a dyn IdentityRepository,
    rules: &'a ImplementationRegistry<dyn CorrelationRule>,
}

impl<'a> Correlator<'a> {
    pub fn new(
        identities: &'a dyn IdentityRepository,
        rules: &'a ImplementationRegistry<dyn CorrelationRule>,
    ) -> Self {
        Self { identities, rules }
    }

    /// Subjects matching the delta, ordered by key.
    ///
    /// Tried in order: the resource's correlation rule, its alternative
    /// search schemas, then the connector object key mapping. The first two
    /// need the object body; deltas without one go straight to the key.
    pub fn find_existing(
        &self,
        resource: &ExternalResource,
        provision: &Provision,
        delta: &SyncDelta,
    ) -> Result<Vec<Subject>, ReconciliationError> {
        let correlation = resource.correlation(provision.subject_type);
        if let (Some(correlation), Some(object)) = (correlation, delta.object.as_ref()) {
            if let Some(rule_key) = &correlation.rule {
                let rule = self.rules.get(rule_key).ok_or_else(|| {
                    ReconciliationError::InvalidCorrelation(format!(
                        "correlation rule {} not registered",
                        rule_key
                    ))
                })?;
                let cond = rule.search_cond(object, provision)?;
                debug!("Correlating {} with rule {}", delta.uid, rule_key);
                return Ok(self.identities.search(provision.subject_type, &cond)?);
            }
            if !correlation.alt_search_schemas.is_empty() {
                let cond = alt_search_cond(&correlation.alt_search_schemas, provision, object)?;
                return Ok(self.identities.search(provision.subject_type, &cond)?);
            }
        }
        self.find_by_conn_object_key(provision, delta)
    }

    fn find_by_conn_object_key(
        &self,
        provision: &Provision,
        delta: &SyncDelta,
    ) -> Result<Vec<Subject>, ReconciliationError> {
        let key_item = &provision.conn_object_key;
        // A renamed object is still known internally under its old value.
        let value = match (&delta.previous_uid, &delta.object) {
            (Some(previous), _) => previous.as_str(),
            (None, Some(object)) => object
                .first_value(&key_item.ext_attr_name)
                .unwrap_or(delta.uid.as_str()),
            (None, None) => delta.uid.as_str(),
        };
        let subject_type = provision.subject_type;

        let found = match &key_item.int_attr {
            IntAttr::Key => self.identities.find(subject_type, value)?.into_iter().collect(),
            IntAttr::Username | IntAttr::GroupName => self
                .identities
                .find_by_name(subject_type, value)?
                .into_iter()
                .collect(),
            IntAttr::PlainSchema(schema) => self.identities.find_by_plain_attr(
                subject_type,
                schema,
                value,
                provision.ignore_case_match,
            )?,
            IntAttr::DerivedSchema(schema) => self.identities.find_by_derived_attr(
                subject_type,
                schema,
                value,
                provision.ignore_case_match,
            )?,
        };
        Ok(found)
    }
}

/// All alternative schemas must match. An empty external value matches
/// subjects without the attribute.
fn alt_search_cond(
    schemas: &[String],
    provision: &Provision,
    object: &ConnectorObject,
) -> Result<SearchCond, ReconciliationError> {
    let mut conds = Vec::with_capacity(schemas.len());
    for schema in schemas {
        let item = provision.item_for_schema(schema).ok_or_else(|| {
            ReconciliationError::InvalidCorrelation(format!("{} is not mapped", schema))
        })?;
        let values = object.attr(&item.ext_attr_name).ok_or_else(|| {
            ReconciliationError::InvalidCorrelation(format!(
                "{} not found on {}",
                item.ext_attr_name, object.uid
            ))
        })?;
        let cond = match values.first().filter(|v| !v.is_empty()) {
            None => SearchCond::is_null(schema),
            Some(value) if provision.ignore_case_match => SearchCond::ieq(schema, value),
            Some(value) => SearchCond::eq(schema, value),
        };
        conds.push(cond);
    }
    Ok(SearchCond::And(conds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::identity::MemoryIdentityRepository;
    use crate::sync::model::SubjectType;
    use crate::sync::resource::{CorrelationSpec, MappingItem, PullPolicy};
    use std::sync::Arc;

    fn provision() -> Provision {
        Provision::new(
            SubjectType::User,
            "__ACCOUNT__",
            MappingItem::new("__NAME__", IntAttr::Username),
        )
        .with_mapping(MappingItem::new("mail", IntAttr::PlainSchema("email".to_string())))
    }

    fn resource(correlation: Option<CorrelationSpec>) -> ExternalResource {
        let mut resource = ExternalResource::new("ldap");
        resource.provisions.push(provision());
        if let Some(correlation) = correlation {
            let mut policy = PullPolicy::default();
            policy.correlation.insert(SubjectType::User, correlation);
            resource.pull_policy = Some(policy);
        }
        resource
    }

    fn repository() -> MemoryIdentityRepository {
        let repo = MemoryIdentityRepository::new();
        repo.insert(Subject::new(SubjectType::User, "u1", "alice").with_attr("email", "a@x.org"));
        repo.insert(Subject::new(SubjectType::User, "u2", "bob").with_attr("email", "b@x.org"));
        repo.insert(Subject::new(SubjectType::User, "u3", "bobby").with_attr("email", "b@x.org"));
        repo
    }

    fn object(name: &str, mail: &str) -> ConnectorObject {
        ConnectorObject::new("__ACCOUNT__", name, name)
            .with_attr("__NAME__", &[name])
            .with_attr("mail", &[mail])
    }

    struct MailRule;

    impl CorrelationRule for MailRule {
        fn search_cond(
            &self,
            object: &ConnectorObject,
            _provision: &Provision,
        ) -> Result<SearchCond, ReconciliationError> {
            let mail = object
                .first_value("mail")
                .ok_or_else(|| ReconciliationError::InvalidCorrelation("no mail".to_string()))?;
            Ok(SearchCond::eq("email", mail))
        }
    }

    #[test]
    fn test_default_lookup_by_username() {
        let repo = repository();
        let rules = ImplementationRegistry::new();
        let correlator = Correlator::new(&repo, &rules);

        let delta = SyncDelta::create_or_update(object("alice", "other@x.org"));
        let found = correlator.find_existing(&resource(None), &provision(), &delta).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "u1");

        let delta = SyncDelta::delete("__ACCOUNT__", "carol");
        let found = correlator.find_existing(&resource(None), &provision(), &delta).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_renamed_object_found_by_previous_uid() {
        let repo = repository();
        let rules = ImplementationRegistry::new();
        let correlator = Correlator::new(&repo, &rules);

        let mut delta = SyncDelta::create_or_update(object("alicia", "a@x.org"));
        delta.previous_uid = Some("alice".to_string());
        let found = correlator.find_existing(&resource(None), &provision(), &delta).unwrap();
        assert_eq!(found[0].key, "u1");
    }

    #[test]
    fn test_alt_search_schemas_can_yield_several_matches() {
        let repo = repository();
        let rules = ImplementationRegistry::new();
        let correlator = Correlator::new(&repo, &rules);
        let resource = resource(Some(CorrelationSpec {
            rule: None,
            alt_search_schemas: vec!["email".to_string()],
        }));

        let delta = SyncDelta::create_or_update(object("robert", "b@x.org"));
        let found = correlator.find_existing(&resource, &provision(), &delta).unwrap();
        let keys: Vec<&str> = found.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["u2", "u3"]);
    }

    #[test]
    fn test_alt_search_schema_must_be_mapped() {
        let repo = repository();
        let rules = ImplementationRegistry::new();
        let correlator = Correlator::new(&repo, &rules);
        let resource = resource(Some(CorrelationSpec {
            rule: None,
            alt_search_schemas: vec!["phone".to_string()],
        }));

        let delta = SyncDelta::create_or_update(object("alice", "a@x.org"));
        let err = correlator.find_existing(&resource, &provision(), &delta).unwrap_err();
        assert!(matches!(err, ReconciliationError::InvalidCorrelation(_)));
    }

    #[test]
    fn test_correlation_rule_takes_precedence() {
        let repo = repository();
        let mut rules: ImplementationRegistry<dyn CorrelationRule> = ImplementationRegistry::new();
        rules.register("mail", Arc::new(MailRule));
        let correlator = Correlator::new(&repo, &rules);
        let resource = resource(Some(CorrelationSpec {
            rule: Some("mail".to_string()),
            alt_search_schemas: vec!["phone".to_string()],
        }));

        let delta = SyncDelta::create_or_update(object("someone", "a@x.org"));
        let found = correlator.find_existing(&resource, &provision(), &delta).unwrap();
        assert_eq!(found[0].key, "u1");

        let missing = ExternalResource {
            pull_policy: Some(PullPolicy {
                correlation: [(
                    SubjectType::User,
                    CorrelationSpec {
                        rule: Some("nope".to_string()),
                        alt_search_schemas: Vec::new(),
                    },
                )]
                .into(),
                ..PullPolicy::default()
            }),
            ..resource
        };
        assert!(matches!(
            correlator.find_existing(&missing, &provision(), &delta),
            Err(ReconciliationError::InvalidCorrelation(_))
        ));
    }
}
