use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{PersistableModel, Selectable};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Resource {
    pub id: String,
    pub workspace_id: String,
    pub provider_id: Option<String>,

    pub name: String,
    pub kind: String,
    pub version: String,
    pub identifier: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// True when applying `incoming` would change anything a selector or a release can see.
    pub fn differs_from(&self, incoming: &ResourceToInsert) -> bool {
        self.name != incoming.name
            || self.kind != incoming.kind
            || self.version != incoming.version
            || self.metadata != incoming.metadata
            || self.variables != incoming.variables
            || self.is_deleted()
    }
}

impl PersistableModel<Resource> for Resource {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

impl Selectable for Resource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn kind(&self) -> Option<&str> {
        Some(&self.kind)
    }

    fn identifier(&self) -> Option<&str> {
        Some(&self.identifier)
    }

    fn version(&self) -> Option<&str> {
        Some(&self.version)
    }

    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|value| value.as_str())
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

/// A resource as reported by a scanner.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResourceToInsert {
    pub name: String,
    pub kind: String,
    pub version: String,
    pub identifier: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceRelationship {
    pub id: String,
    pub workspace_id: String,
    pub parent_id: String,
    pub child_id: String,
    pub relationship_type: String,
}

impl ResourceRelationship {
    pub fn make_id(parent_id: &str, child_id: &str, relationship_type: &str) -> String {
        format!("{}:{}:{}", parent_id, child_id, relationship_type)
    }
}

impl PersistableModel<ResourceRelationship> for ResourceRelationship {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}
