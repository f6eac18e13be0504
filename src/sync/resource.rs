//! External resource configuration as seen by provisioning tasks.

use super::connector::{Filter, SyncToken};
use super::model::{
    ConflictResolutionAction, MatchingRule, SubjectType, TraceLevel, UnmatchingRule,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Internal side of a mapping item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "schema", rename_all = "snake_case")]
pub enum IntAttr {
    Key,
    Username,
    GroupName,
    PlainSchema(String),
    DerivedSchema(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingItem {
    pub ext_attr_name: String,
    pub int_attr: IntAttr,
}

impl MappingItem {
    pub fn new(ext_attr_name: &str, int_attr: IntAttr) -> Self {
        Self {
            ext_attr_name: ext_attr_name.to_string(),
            int_attr,
        }
    }
}

/// How one subject type is mapped onto one object class of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub subject_type: SubjectType,
    pub object_class: String,
    pub conn_object_key: MappingItem,
    #[serde(default)]
    pub mapping: Vec<MappingItem>,
    #[serde(default)]
    pub sync_token: Option<SyncToken>,
    #[serde(default)]
    pub ignore_case_match: bool,
    /// External attribute listing group names the user should belong to.
    #[serde(default)]
    pub membership_attr: Option<String>,
}

impl Provision {
    pub fn new(subject_type: SubjectType, object_class: &str, conn_object_key: MappingItem) -> Self {
        Self {
            subject_type,
            object_class: object_class.to_string(),
            conn_object_key,
            mapping: Vec::new(),
            sync_token: None,
            ignore_case_match: false,
            membership_attr: None,
        }
    }

    pub fn with_mapping(mut self, item: MappingItem) -> Self {
        self.mapping.push(item);
        self
    }

    /// Mapping items including the connector object key, key first.
    pub fn all_items(&self) -> impl Iterator<Item = &MappingItem> {
        std::iter::once(&self.conn_object_key).chain(self.mapping.iter())
    }

    /// Looks up the mapping item for an internal schema name.
    pub fn item_for_schema(&self, schema: &str) -> Option<&MappingItem> {
        self.all_items().find(|item| match &item.int_attr {
            IntAttr::PlainSchema(s) | IntAttr::DerivedSchema(s) => s == schema,
            IntAttr::Username => schema == "username",
            IntAttr::GroupName => schema == "name",
            IntAttr::Key => schema == "key",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationSpec {
    /// Key of a registered correlation rule implementation.
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub alt_search_schemas: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullPolicy {
    #[serde(default)]
    pub conflict_resolution: ConflictResolutionAction,
    #[serde(default)]
    pub correlation: BTreeMap<SubjectType, CorrelationSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResource {
    pub key: String,
    pub provisions: Vec<Provision>,
    #[serde(default)]
    pub trace_level: TraceLevel,
    #[serde(default)]
    pub pull_policy: Option<PullPolicy>,
}

impl ExternalResource {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            provisions: Vec::new(),
            trace_level: TraceLevel::default(),
            pull_policy: None,
        }
    }

    pub fn provision(&self, subject_type: SubjectType) -> Option<&Provision> {
        self.provisions
            .iter()
            .find(|p| p.subject_type == subject_type)
    }

    pub fn conflict_resolution(&self) -> ConflictResolutionAction {
        self.pull_policy
            .as_ref()
            .map(|p| p.conflict_resolution)
            .unwrap_or_default()
    }

    pub fn correlation(&self, subject_type: SubjectType) -> Option<&CorrelationSpec> {
        self.pull_policy
            .as_ref()
            .and_then(|p| p.correlation.get(&subject_type))
    }

    /// Provisions in processing order.
    pub fn sorted_provisions(&self) -> Vec<&Provision> {
        let mut provisions: Vec<&Provision> = self.provisions.iter().collect();
        provisions.sort_by_key(|p| p.subject_type.processing_rank());
        provisions
    }
}

fn default_true() -> bool {
    true
}

/// Settings shared by pull and push tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningSpec {
    pub resource: ExternalResource,
    #[serde(default)]
    pub matching_rule: MatchingRule,
    #[serde(default)]
    pub unmatching_rule: UnmatchingRule,
    #[serde(default = "default_true")]
    pub perform_create: bool,
    #[serde(default = "default_true")]
    pub perform_update: bool,
    #[serde(default = "default_true")]
    pub perform_delete: bool,
    /// Whether the enabled status is synchronized too.
    #[serde(default)]
    pub sync_status: bool,
    /// Keys of registered action implementations, invoked in order.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl ProvisioningSpec {
    pub fn new(resource: ExternalResource) -> Self {
        Self {
            resource,
            matching_rule: MatchingRule::default(),
            unmatching_rule: UnmatchingRule::default(),
            perform_create: true,
            perform_update: true,
            perform_delete: true,
            sync_status: false,
            actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullMode {
    #[default]
    FullReconciliation,
    FilteredReconciliation,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSpec {
    #[serde(flatten)]
    pub provisioning: ProvisioningSpec,
    #[serde(default)]
    pub pull_mode: PullMode,
    #[serde(default)]
    pub reconciliation_filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSpec {
    #[serde(flatten)]
    pub provisioning: ProvisioningSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_provisions_puts_groups_first() {
        let mut resource = ExternalResource::new("ldap");
        resource.provisions.push(Provision::new(
            SubjectType::User,
            "__ACCOUNT__",
            MappingItem::new("uid", IntAttr::Username),
        ));
        resource.provisions.push(Provision::new(
            SubjectType::Group,
            "__GROUP__",
            MappingItem::new("cn", IntAttr::GroupName),
        ));

        let order: Vec<SubjectType> = resource
            .sorted_provisions()
            .iter()
            .map(|p| p.subject_type)
            .collect();
        assert_eq!(order, vec![SubjectType::Group, SubjectType::User]);
    }

    #[test]
    fn test_pull_spec_defaults_from_json() {
        let json = r#"{
            "resource": {"key": "ldap", "provisions": []},
            "pull_mode": "INCREMENTAL"
        }"#;
        let spec: PullSpec = serde_json::from_str(json).unwrap();
        assert!(spec.provisioning.perform_create);
        assert_eq!(spec.provisioning.matching_rule, MatchingRule::Update);
        assert_eq!(spec.pull_mode, PullMode::Incremental);
        assert_eq!(spec.provisioning.resource.trace_level, TraceLevel::All);
    }

    #[test]
    fn test_item_for_schema() {
        let provision = Provision::new(
            SubjectType::User,
            "__ACCOUNT__",
            MappingItem::new("uid", IntAttr::Username),
        )
        .with_mapping(MappingItem::new("mail", IntAttr::PlainSchema("email".into())));
        assert_eq!(provision.item_for_schema("email").unwrap().ext_attr_name, "mail");
        assert_eq!(provision.item_for_schema("username").unwrap().ext_attr_name, "uid");
        assert!(provision.item_for_schema("phone").is_none());
    }
}
