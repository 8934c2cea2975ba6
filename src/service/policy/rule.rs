use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::models::{Deployment, DeploymentVersion, Environment, Policy, ReleaseTarget, Resource};

/// Everything a rule may inspect about the release target under evaluation.
#[derive(Clone, Debug)]
pub struct RuleContext {
    pub release_target: ReleaseTarget,
    pub resource: Resource,
    pub environment: Environment,
    pub deployment: Deployment,

    /// Enabled policies covering the target, highest priority first.
    pub policies: Vec<Policy>,

    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleResult {
    pub allowed: Vec<DeploymentVersion>,
    pub reason: Option<String>,
}

impl RuleResult {
    pub fn allow(allowed: Vec<DeploymentVersion>) -> Self {
        Self {
            allowed,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: vec![],
            reason: Some(reason.into()),
        }
    }
}

/// One stage of the policy rule chain.
///
/// A rule narrows the candidate versions, newest first, and explains itself when it
/// rejects any. Rules never write.
#[async_trait]
pub trait Rule: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    async fn filter(
        &self,
        context: &RuleContext,
        candidates: Vec<DeploymentVersion>,
    ) -> anyhow::Result<RuleResult>;
}
