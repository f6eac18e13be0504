//! Boundary to external systems.
//!
//! The reconciliation engine only needs the read side of a connector: search,
//! sync feed, full listing and single-object lookup. Writes go through the
//! provisioning manager.

use super::resource::ExternalResource;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Attribute holding the enabled flag on connector objects.
pub const ENABLE_ATTR: &str = "__ENABLE__";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("connector request timed out: {0}")]
    Timeout(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("connector failure: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorObject {
    pub uid: String,
    pub name: String,
    pub object_class: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl ConnectorObject {
    pub fn new(object_class: &str, uid: &str, name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            object_class: object_class.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn attr(&self, name: &str) -> Option<&Vec<String>> {
        self.attributes.get(name)
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn enabled(&self) -> Option<bool> {
        self.first_value(ENABLE_ATTR)
            .map(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Opaque position in a resource's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncToken(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaType {
    CreateOrUpdate,
    Delete,
}

/// One change observed on the external resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub token: Option<SyncToken>,
    pub delta_type: DeltaType,
    pub uid: String,
    /// Set when the resource renamed the object in this change.
    pub previous_uid: Option<String>,
    pub object_class: String,
    /// Absent for most delete deltas.
    pub object: Option<ConnectorObject>,
}

impl SyncDelta {
    pub fn create_or_update(object: ConnectorObject) -> Self {
        Self {
            token: None,
            delta_type: DeltaType::CreateOrUpdate,
            uid: object.uid.clone(),
            previous_uid: None,
            object_class: object.object_class.clone(),
            object: Some(object),
        }
    }

    pub fn delete(object_class: &str, uid: &str) -> Self {
        Self {
            token: None,
            delta_type: DeltaType::Delete,
            uid: uid.to_string(),
            previous_uid: None,
            object_class: object_class.to_string(),
            object: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(SyncToken(token.to_string()));
        self
    }

    /// Name to report for this delta: the object name, falling back to the uid.
    pub fn display_name(&self) -> &str {
        self.object
            .as_ref()
            .map(|o| o.name.as_str())
            .unwrap_or(self.uid.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    EqualTo { attribute: String, value: String },
    EqualsIgnoreCase { attribute: String, value: String },
    And { filters: Vec<Filter> },
}

impl Filter {
    pub fn matches(&self, object: &ConnectorObject) -> bool {
        match self {
            Filter::EqualTo { attribute, value } => {
                attribute_values(object, attribute)
                    .iter()
                    .any(|v| *v == value.as_str())
            }
            Filter::EqualsIgnoreCase { attribute, value } => attribute_values(object, attribute)
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value)),
            Filter::And { filters } => filters.iter().all(|f| f.matches(object)),
        }
    }
}

fn attribute_values<'a>(object: &'a ConnectorObject, attribute: &str) -> Vec<&'a str> {
    match attribute {
        "__UID__" => vec![object.uid.as_str()],
        "__NAME__" => vec![object.name.as_str()],
        _ => object
            .attr(attribute)
            .map(|values| values.iter().map(String::as_str).collect())
            .unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationOptions {
    pub attributes_to_get: Vec<String>,
    pub page_size: Option<usize>,
}

/// Read access to one external resource.
///
/// Handlers passed to `sync` and `get_all_objects` return `false` to stop the
/// iteration early.
pub trait Connector: Send + Sync {
    fn search(
        &self,
        object_class: &str,
        filter: &Filter,
        options: &OperationOptions,
    ) -> Result<Vec<ConnectorObject>, ConnectorError>;

    fn sync(
        &self,
        object_class: &str,
        token: Option<&SyncToken>,
        handler: &mut dyn FnMut(SyncDelta) -> bool,
        options: &OperationOptions,
    ) -> Result<(), ConnectorError>;

    fn get_all_objects(
        &self,
        object_class: &str,
        handler: &mut dyn FnMut(ConnectorObject) -> bool,
        options: &OperationOptions,
    ) -> Result<(), ConnectorError>;

    /// Looks an object up by the value of `key_attribute`.
    fn get_object(
        &self,
        object_class: &str,
        key_attribute: &str,
        key_value: &str,
        options: &OperationOptions,
    ) -> Result<Option<ConnectorObject>, ConnectorError>;

    fn get_latest_sync_token(&self, object_class: &str)
        -> Result<Option<SyncToken>, ConnectorError>;
}

/// Resolves the connector instance serving a resource.
pub trait ConnectorManager: Send + Sync {
    fn connector(&self, resource: &ExternalResource) -> Option<Arc<dyn Connector>>;
}

/// Connector over objects held in memory. Every change is appended to a log
/// that `sync` replays; a sync token is a position in that log.
#[derive(Default)]
pub struct InMemoryConnector {
    objects: RwLock<BTreeMap<(String, String), ConnectorObject>>,
    changes: RwLock<Vec<SyncDelta>>,
    failing_lookups: RwLock<BTreeMap<String, ConnectorError>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the object and logs a create-or-update change.
    pub fn put(&self, object: ConnectorObject) {
        let delta = SyncDelta::create_or_update(object.clone());
        self.objects
            .write()
            .unwrap()
            .insert((object.object_class.clone(), object.uid.clone()), object);
        self.log_change(delta);
    }

    /// Removes the object and logs a delete change.
    pub fn remove(&self, object_class: &str, uid: &str) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap()
            .remove(&(object_class.to_string(), uid.to_string()))
            .is_some();
        if removed {
            self.log_change(SyncDelta::delete(object_class, uid));
        }
        removed
    }

    /// Makes every lookup of `key_value` fail with `error`.
    pub fn fail_lookup(&self, key_value: &str, error: ConnectorError) {
        self.failing_lookups
            .write()
            .unwrap()
            .insert(key_value.to_string(), error);
    }

    pub fn objects(&self, object_class: &str) -> Vec<ConnectorObject> {
        self.objects
            .read()
            .unwrap()
            .values()
            .filter(|o| o.object_class == object_class)
            .cloned()
            .collect()
    }

    fn log_change(&self, delta: SyncDelta) {
        let mut changes = self.changes.write().unwrap();
        let token = (changes.len() + 1).to_string();
        changes.push(delta.with_token(&token));
    }
}

fn log_position(token: Option<&SyncToken>) -> usize {
    token.and_then(|t| t.0.parse().ok()).unwrap_or(0)
}

impl Connector for InMemoryConnector {
    fn search(
        &self,
        object_class: &str,
        filter: &Filter,
        _options: &OperationOptions,
    ) -> Result<Vec<ConnectorObject>, ConnectorError> {
        Ok(self
            .objects(object_class)
            .into_iter()
            .filter(|o| filter.matches(o))
            .collect())
    }

    fn sync(
        &self,
        object_class: &str,
        token: Option<&SyncToken>,
        handler: &mut dyn FnMut(SyncDelta) -> bool,
        _options: &OperationOptions,
    ) -> Result<(), ConnectorError> {
        let pending: Vec<SyncDelta> = self
            .changes
            .read()
            .unwrap()
            .iter()
            .skip(log_position(token))
            .filter(|d| d.object_class == object_class)
            .cloned()
            .collect();
        for delta in pending {
            if !handler(delta) {
                break;
            }
        }
        Ok(())
    }

    fn get_all_objects(
        &self,
        object_class: &str,
        handler: &mut dyn FnMut(ConnectorObject) -> bool,
        _options: &OperationOptions,
    ) -> Result<(), ConnectorError> {
        for object in self.objects(object_class) {
            if !handler(object) {
                break;
            }
        }
        Ok(())
    }

    fn get_object(
        &self,
        object_class: &str,
        key_attribute: &str,
        key_value: &str,
        _options: &OperationOptions,
    ) -> Result<Option<ConnectorObject>, ConnectorError> {
        if let Some(error) = self.failing_lookups.read().unwrap().get(key_value) {
            return Err(error.clone());
        }
        Ok(self.objects(object_class).into_iter().find(|o| {
            attribute_values(o, key_attribute)
                .iter()
                .any(|v| *v == key_value)
        }))
    }

    fn get_latest_sync_token(
        &self,
        object_class: &str,
    ) -> Result<Option<SyncToken>, ConnectorError> {
        Ok(self
            .changes
            .read()
            .unwrap()
            .iter()
            .rposition(|d| d.object_class == object_class)
            .map(|i| SyncToken((i + 1).to_string())))
    }
}

/// Connectors registered by resource key.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource_key: &str, connector: Arc<dyn Connector>) {
        self.connectors.insert(resource_key.to_string(), connector);
    }
}

impl ConnectorManager for ConnectorRegistry {
    fn connector(&self, resource: &ExternalResource) -> Option<Arc<dyn Connector>> {
        self.connectors
            .get(&resource.key)
            .map(|entry| entry.value().clone())
    }
}
