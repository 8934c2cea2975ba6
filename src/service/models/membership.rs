use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Kind of selector owner a computed membership row belongs to.
///
/// Environment and deployment rows hold resource ids; policy target rows hold
/// release target ids.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipKind {
    Environment,
    Deployment,
    PolicyTarget,
}

impl MembershipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipKind::Environment => "environment",
            MembershipKind::Deployment => "deployment",
            MembershipKind::PolicyTarget => "policy_target",
        }
    }
}

impl fmt::Display for MembershipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "environment" => Ok(MembershipKind::Environment),
            "deployment" => Ok(MembershipKind::Deployment),
            "policy_target" => Ok(MembershipKind::PolicyTarget),
            _ => Err(anyhow::anyhow!("unknown membership kind: {}", s)),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct MembershipScope {
    pub kind: MembershipKind,
    pub owner_id: String,
}

impl MembershipScope {
    pub fn environment(environment_id: &str) -> Self {
        Self {
            kind: MembershipKind::Environment,
            owner_id: environment_id.to_string(),
        }
    }

    pub fn deployment(deployment_id: &str) -> Self {
        Self {
            kind: MembershipKind::Deployment,
            owner_id: deployment_id.to_string(),
        }
    }

    pub fn policy_target(policy_target_id: &str) -> Self {
        Self {
            kind: MembershipKind::PolicyTarget,
            owner_id: policy_target_id.to_string(),
        }
    }

    /// Key of the no-wait lock guarding replacement of this scope.
    pub fn lock_key(&self) -> String {
        format!("membership:{}:{}", self.kind.as_str(), self.owner_id)
    }
}
