use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{Condition, PersistableModel, Selectable};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Deployment {
    pub id: String,
    pub workspace_id: String,
    pub system_id: String,
    pub name: String,

    /// Without a selector a deployment applies to every resource of its environments.
    pub resource_selector: Option<Condition>,

    pub job_agent_id: Option<String>,
    #[serde(default)]
    pub job_agent_config: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl PersistableModel<Deployment> for Deployment {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

impl Selectable for Deployment {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
}
