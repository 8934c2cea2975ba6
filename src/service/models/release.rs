use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::PersistableModel;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Release {
    pub id: String,
    pub release_target_id: String,
    pub version_id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Release {
    pub fn is_equivalent(
        &self,
        version_id: &str,
        variables: &BTreeMap<String, serde_json::Value>,
    ) -> bool {
        self.version_id == version_id && &self.variables == variables
    }
}

impl PersistableModel<Release> for Release {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

/// Payload of an evaluation unit of work.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EvaluationRequest {
    pub release_target_id: String,
}

/// Payload of the notification sent when a deployment stops applying to a resource.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExitHook {
    pub deployment_id: String,
    pub resource_id: String,
    pub release_target_ids: Vec<String>,
}
