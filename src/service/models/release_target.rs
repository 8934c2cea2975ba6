use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::PersistableModel;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReleaseTarget {
    pub id: String,
    pub workspace_id: String,

    pub resource_id: String,
    pub environment_id: String,
    pub deployment_id: String,

    /// Pinned version; bypasses the policy rule chain while set.
    pub desired_version_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl ReleaseTarget {
    pub fn triple(&self) -> (String, String, String) {
        (
            self.resource_id.clone(),
            self.environment_id.clone(),
            self.deployment_id.clone(),
        )
    }
}

impl PersistableModel<ReleaseTarget> for ReleaseTarget {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}
