use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{Condition, PersistableModel, Selectable};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Environment {
    pub id: String,
    pub workspace_id: String,
    pub system_id: String,
    pub name: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Without a selector an environment contains no resources.
    pub resource_selector: Option<Condition>,

    pub created_at: DateTime<Utc>,
}

impl PersistableModel<Environment> for Environment {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

impl Selectable for Environment {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|value| value.as_str())
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
}
