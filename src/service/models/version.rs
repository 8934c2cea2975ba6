use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{Condition, PersistableModel, Selectable};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Ready,
    Building,
    Failed,
    Rejected,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Ready => "ready",
            VersionStatus::Building => "building",
            VersionStatus::Failed => "failed",
            VersionStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(VersionStatus::Ready),
            "building" => Ok(VersionStatus::Building),
            "failed" => Ok(VersionStatus::Failed),
            "rejected" => Ok(VersionStatus::Rejected),
            _ => Err(anyhow::anyhow!("unknown version status: {}", s)),
        }
    }
}

/// Another deployment whose current version on the same resource, or on one of its parents,
/// must match `version_selector` before the declaring version may roll out.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VersionDependency {
    pub deployment_id: String,
    pub version_selector: Condition,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeploymentVersion {
    pub id: String,
    pub deployment_id: String,

    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub status: VersionStatus,
    #[serde(default)]
    pub dependencies: Vec<VersionDependency>,

    pub created_at: DateTime<Utc>,
}

impl DeploymentVersion {
    pub fn is_ready(&self) -> bool {
        self.status == VersionStatus::Ready
    }
}

impl PersistableModel<DeploymentVersion> for DeploymentVersion {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

impl Selectable for DeploymentVersion {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn version(&self) -> Option<&str> {
        Some(&self.tag)
    }

    fn identifier(&self) -> Option<&str> {
        Some(&self.tag)
    }

    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|value| value.as_str())
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
}
