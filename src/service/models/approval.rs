use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::PersistableModel;
use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            _ => Err(anyhow::anyhow!("unknown approval status: {}", s)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub deployment_version_id: String,
    pub environment_id: String,
    pub user_id: String,
    #[serde(default)]
    pub role_ids: Vec<String>,
    pub status: ApprovalStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRecord {
    /// One record per user, version and environment; a later decision replaces the earlier one.
    pub fn make_id(deployment_version_id: &str, environment_id: &str, user_id: &str) -> String {
        format!("{}:{}:{}", deployment_version_id, environment_id, user_id)
    }

    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }
}

impl PersistableModel<ApprovalRecord> for ApprovalRecord {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}
