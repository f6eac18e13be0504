//! Internal identity records and the read-only repository over them.
//!
//! Mutations never go through the repository: they are requested from the
//! provisioning manager, which owns persistence and propagation.

use super::connector::ConnectorObject;
use super::model::SubjectType;
use super::resource::{IntAttr, Provision};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub key: String,
    pub subject_type: SubjectType,
    /// Username for users, group name for groups, object name otherwise.
    pub name: String,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub derived_attrs: BTreeMap<String, Vec<String>>,
    /// Keys of the groups this subject belongs to.
    #[serde(default)]
    pub memberships: BTreeSet<String>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub last_recertification: Option<DateTime<Utc>>,
}

impl Subject {
    pub fn new(subject_type: SubjectType, key: &str, name: &str) -> Self {
        Self {
            key: key.to_string(),
            subject_type,
            name: name.to_string(),
            resources: BTreeSet::new(),
            attrs: BTreeMap::new(),
            derived_attrs: BTreeMap::new(),
            memberships: BTreeSet::new(),
            suspended: false,
            last_recertification: None,
        }
    }

    pub fn with_attr(mut self, schema: &str, value: &str) -> Self {
        self.attrs
            .entry(schema.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resources.insert(resource.to_string());
        self
    }

    pub fn with_membership(mut self, group_key: &str) -> Self {
        self.memberships.insert(group_key.to_string());
        self
    }

    /// Values for an internal attribute, as seen through a mapping item.
    pub fn values_for(&self, int_attr: &IntAttr) -> Vec<String> {
        match int_attr {
            IntAttr::Key => vec![self.key.clone()],
            IntAttr::Username | IntAttr::GroupName => vec![self.name.clone()],
            IntAttr::PlainSchema(schema) => self.attrs.get(schema).cloned().unwrap_or_default(),
            IntAttr::DerivedSchema(schema) => {
                self.derived_attrs.get(schema).cloned().unwrap_or_default()
            }
        }
    }

    /// Value the connector object key takes for this subject on a provision.
    pub fn conn_object_key_value(&self, provision: &Provision) -> Option<String> {
        self.values_for(&provision.conn_object_key.int_attr)
            .into_iter()
            .next()
    }

    fn field(&self, schema: &str) -> Option<Vec<String>> {
        match schema {
            "key" => Some(vec![self.key.clone()]),
            "username" | "name" => Some(vec![self.name.clone()]),
            _ => self
                .attrs
                .get(schema)
                .or_else(|| self.derived_attrs.get(schema))
                .cloned(),
        }
    }
}

/// Internal subject to be created from an external object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDraft {
    pub subject_type: SubjectType,
    pub name: String,
    pub attrs: BTreeMap<String, Vec<String>>,
    pub resources: BTreeSet<String>,
    pub enabled: Option<bool>,
}

impl SubjectDraft {
    /// Applies the provision mapping to an external object.
    pub fn from_object(provision: &Provision, object: &ConnectorObject, sync_status: bool) -> Self {
        let mut draft = Self {
            subject_type: provision.subject_type,
            name: object.name.clone(),
            attrs: BTreeMap::new(),
            resources: BTreeSet::new(),
            enabled: if sync_status { object.enabled() } else { None },
        };
        for item in provision.all_items() {
            let Some(values) = object.attr(&item.ext_attr_name) else {
                continue;
            };
            match &item.int_attr {
                IntAttr::Username | IntAttr::GroupName => {
                    if let Some(first) = values.first() {
                        draft.name = first.clone();
                    }
                }
                IntAttr::PlainSchema(schema) => {
                    draft.attrs.insert(schema.clone(), values.clone());
                }
                IntAttr::Key | IntAttr::DerivedSchema(_) => {}
            }
        }
        draft
    }
}

/// Changes to apply to an existing internal subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPatch {
    pub subject_type: SubjectType,
    pub key: String,
    pub name: Option<String>,
    /// Attribute values replacing the current ones.
    pub attrs: BTreeMap<String, Vec<String>>,
    pub memberships_to_add: BTreeSet<String>,
    pub enabled: Option<bool>,
}

impl SubjectPatch {
    pub fn new(subject_type: SubjectType, key: &str) -> Self {
        Self {
            subject_type,
            key: key.to_string(),
            name: None,
            attrs: BTreeMap::new(),
            memberships_to_add: BTreeSet::new(),
            enabled: None,
        }
    }

    /// Computes the difference between `before` and the mapped external object.
    pub fn from_object(
        before: &Subject,
        provision: &Provision,
        object: &ConnectorObject,
        sync_status: bool,
    ) -> Self {
        let draft = SubjectDraft::from_object(provision, object, sync_status);
        let mut patch = Self::new(before.subject_type, &before.key);
        if draft.name != before.name {
            patch.name = Some(draft.name);
        }
        for (schema, values) in draft.attrs {
            if before.attrs.get(&schema) != Some(&values) {
                patch.attrs.insert(schema, values);
            }
        }
        if let Some(enabled) = draft.enabled {
            if enabled == before.suspended {
                patch.enabled = Some(enabled);
            }
        }
        patch
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.attrs.is_empty()
            && self.memberships_to_add.is_empty()
            && self.enabled.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrCondKind {
    Eq,
    IgnoreCaseEq,
    IsNull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrCond {
    pub schema: String,
    pub kind: AttrCondKind,
    pub value: Option<String>,
}

/// Search condition over internal subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchCond {
    Attr(AttrCond),
    And(Vec<SearchCond>),
    Or(Vec<SearchCond>),
}

impl SearchCond {
    pub fn eq(schema: &str, value: &str) -> Self {
        SearchCond::Attr(AttrCond {
            schema: schema.to_string(),
            kind: AttrCondKind::Eq,
            value: Some(value.to_string()),
        })
    }

    pub fn ieq(schema: &str, value: &str) -> Self {
        SearchCond::Attr(AttrCond {
            schema: schema.to_string(),
            kind: AttrCondKind::IgnoreCaseEq,
            value: Some(value.to_string()),
        })
    }

    pub fn is_null(schema: &str) -> Self {
        SearchCond::Attr(AttrCond {
            schema: schema.to_string(),
            kind: AttrCondKind::IsNull,
            value: None,
        })
    }

    pub fn matches(&self, subject: &Subject) -> bool {
        match self {
            SearchCond::And(conds) => conds.iter().all(|c| c.matches(subject)),
            SearchCond::Or(conds) => conds.iter().any(|c| c.matches(subject)),
            SearchCond::Attr(cond) => {
                let values = subject.field(&cond.schema).unwrap_or_default();
                match (cond.kind, cond.value.as_deref()) {
                    (AttrCondKind::IsNull, _) => values.is_empty(),
                    (AttrCondKind::Eq, Some(expected)) => values.iter().any(|v| v == expected),
                    (AttrCondKind::IgnoreCaseEq, Some(expected)) => {
                        values.iter().any(|v| v.eq_ignore_ascii_case(expected))
                    }
                    (_, None) => false,
                }
            }
        }
    }
}

/// Read access to internal identities.
pub trait IdentityRepository: Send + Sync {
    fn find(&self, subject_type: SubjectType, key: &str) -> Result<Option<Subject>>;
    fn find_by_name(&self, subject_type: SubjectType, name: &str) -> Result<Option<Subject>>;
    fn find_by_plain_attr(
        &self,
        subject_type: SubjectType,
        schema: &str,
        value: &str,
        ignore_case: bool,
    ) -> Result<Vec<Subject>>;
    fn find_by_derived_attr(
        &self,
        subject_type: SubjectType,
        schema: &str,
        value: &str,
        ignore_case: bool,
    ) -> Result<Vec<Subject>>;
    fn search(&self, subject_type: SubjectType, cond: &SearchCond) -> Result<Vec<Subject>>;
    fn count(&self, subject_type: SubjectType) -> Result<usize>;
    /// One page of subjects ordered by key; `page` starts at 1.
    fn page(&self, subject_type: SubjectType, page: usize, size: usize) -> Result<Vec<Subject>>;
    fn count_members(&self, group_key: &str) -> Result<usize>;
    /// One page of users that are members of the group; `page` starts at 1.
    fn members_page(&self, group_key: &str, page: usize, size: usize) -> Result<Vec<Subject>>;
}

/// Number of pages to walk for `total` items.
///
/// Always one more than `total / page_size`, so an exact multiple ends with an
/// empty trailing page. Existing deployments rely on this count.
pub fn page_count(total: usize, page_size: usize) -> usize {
    total / page_size.max(1) + 1
}

/// In-process identity repository.
#[derive(Default)]
pub struct MemoryIdentityRepository {
    subjects: RwLock<BTreeMap<(SubjectType, String), Subject>>,
}

impl MemoryIdentityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: Subject) {
        self.subjects
            .write()
            .unwrap()
            .insert((subject.subject_type, subject.key.clone()), subject);
    }

    pub fn remove(&self, subject_type: SubjectType, key: &str) -> Option<Subject> {
        self.subjects
            .write()
            .unwrap()
            .remove(&(subject_type, key.to_string()))
    }

    pub fn all(&self, subject_type: SubjectType) -> Vec<Subject> {
        self.filtered(subject_type, |_| true)
    }

    fn filtered(&self, subject_type: SubjectType, predicate: impl Fn(&Subject) -> bool) -> Vec<Subject> {
        self.subjects
            .read()
            .unwrap()
            .values()
            .filter(|s| s.subject_type == subject_type && predicate(s))
            .cloned()
            .collect()
    }

    fn paginate(items: Vec<Subject>, page: usize, size: usize) -> Vec<Subject> {
        let skip = page.saturating_sub(1) * size;
        items.into_iter().skip(skip).take(size).collect()
    }
}

fn value_matches(values: Option<&Vec<String>>, value: &str, ignore_case: bool) -> bool {
    values.is_some_and(|values| {
        values.iter().any(|v| {
            if ignore_case {
                v.eq_ignore_ascii_case(value)
            } else {
                v == value
            }
        })
    })
}

impl IdentityRepository for MemoryIdentityRepository {
    fn find(&self, subject_type: SubjectType, key: &str) -> Result<Option<Subject>> {
        Ok(self
            .subjects
            .read()
            .unwrap()
            .get(&(subject_type, key.to_string()))
            .cloned())
    }

    fn find_by_name(&self, subject_type: SubjectType, name: &str) -> Result<Option<Subject>> {
        Ok(self
            .filtered(subject_type, |s| s.name == name)
            .into_iter()
            .next())
    }

    fn find_by_plain_attr(
        &self,
        subject_type: SubjectType,
        schema: &str,
        value: &str,
        ignore_case: bool,
    ) -> Result<Vec<Subject>> {
        Ok(self.filtered(subject_type, |s| {
            value_matches(s.attrs.get(schema), value, ignore_case)
        }))
    }

    fn find_by_derived_attr(
        &self,
        subject_type: SubjectType,
        schema: &str,
        value: &str,
        ignore_case: bool,
    ) -> Result<Vec<Subject>> {
        Ok(self.filtered(subject_type, |s| {
            value_matches(s.derived_attrs.get(schema), value, ignore_case)
        }))
    }

    fn search(&self, subject_type: SubjectType, cond: &SearchCond) -> Result<Vec<Subject>> {
        Ok(self.filtered(subject_type, |s| cond.matches(s)))
    }

    fn count(&self, subject_type: SubjectType) -> Result<usize> {
        Ok(self.filtered(subject_type, |_| true).len())
    }

    fn page(&self, subject_type: SubjectType, page: usize, size: usize) -> Result<Vec<Subject>> {
        Ok(Self::paginate(self.all(subject_type), page, size))
    }

    fn count_members(&self, group_key: &str) -> Result<usize> {
        Ok(self
            .filtered(SubjectType::User, |s| s.memberships.contains(group_key))
            .len())
    }

    fn members_page(&self, group_key: &str, page: usize, size: usize) -> Result<Vec<Subject>> {
        let members = self.filtered(SubjectType::User, |s| s.memberships.contains(group_key));
        Ok(Self::paginate(members, page, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::resource::MappingItem;

    fn user_provision() -> Provision {
        Provision::new(
            SubjectType::User,
            "__ACCOUNT__",
            MappingItem::new("uid", IntAttr::Username),
        )
        .with_mapping(MappingItem::new("mail", IntAttr::PlainSchema("email".into())))
    }

    #[test]
    fn test_page_count_adds_trailing_page_on_exact_multiple() {
        assert_eq!(page_count(0, 10), 1);
        assert_eq!(page_count(9, 10), 1);
        // 20 items fit in 2 pages; the count keeps a third, empty one
        assert_eq!(page_count(20, 10), 3);
        assert_eq!(page_count(21, 10), 3);
    }

    #[test]
    fn test_exact_multiple_last_page_is_empty() {
        let repo = MemoryIdentityRepository::new();
        for i in 0..4 {
            repo.insert(Subject::new(SubjectType::User, &format!("u{i}"), &format!("user{i}")));
        }
        let pages = page_count(repo.count(SubjectType::User).unwrap(), 2);
        assert_eq!(pages, 3);
        assert_eq!(repo.page(SubjectType::User, 1, 2).unwrap().len(), 2);
        assert_eq!(repo.page(SubjectType::User, 2, 2).unwrap().len(), 2);
        assert!(repo.page(SubjectType::User, 3, 2).unwrap().is_empty());
    }

    #[test]
    fn test_draft_from_object_applies_mapping() {
        let object = ConnectorObject::new("__ACCOUNT__", "u-1", "cn=alice")
            .with_attr("uid", &["alice"])
            .with_attr("mail", &["alice@example.org"])
            .with_attr("__ENABLE__", &["false"]);
        let draft = SubjectDraft::from_object(&user_provision(), &object, true);
        assert_eq!(draft.name, "alice");
        assert_eq!(draft.attrs["email"], vec!["alice@example.org".to_string()]);
        assert_eq!(draft.enabled, Some(false));
    }

    #[test]
    fn test_patch_only_contains_differences() {
        let before = Subject::new(SubjectType::User, "k1", "alice").with_attr("email", "old@example.org");
        let object = ConnectorObject::new("__ACCOUNT__", "u-1", "alice")
            .with_attr("uid", &["alice"])
            .with_attr("mail", &["new@example.org"]);
        let patch = SubjectPatch::from_object(&before, &user_provision(), &object, false);
        assert!(patch.name.is_none());
        assert_eq!(patch.attrs["email"], vec!["new@example.org".to_string()]);
        assert!(patch.enabled.is_none());
    }

    #[test]
    fn test_search_cond_is_null_and_ignore_case() {
        let subject = Subject::new(SubjectType::User, "k1", "Alice").with_attr("email", "A@X.org");
        assert!(SearchCond::is_null("phone").matches(&subject));
        assert!(SearchCond::ieq("email", "a@x.org").matches(&subject));
        assert!(!SearchCond::eq("email", "a@x.org").matches(&subject));
        assert!(SearchCond::And(vec![SearchCond::eq("username", "Alice"), SearchCond::eq("key", "k1")])
            .matches(&subject));
    }
}
