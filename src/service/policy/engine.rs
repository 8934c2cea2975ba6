use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::{Rule, RuleContext};
use crate::{
    models::{DeploymentVersion, Policy, ReleaseTarget},
    services::{
        DeploymentService, EnvironmentService, MembershipService, PolicyService, ResourceService,
        VersionService,
    },
};

/// Outcome of running the rule chain for one release target.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyEvaluation {
    pub policy_ids: Vec<String>,
    /// Versions allowed to roll out, newest first.
    pub allowed: Vec<DeploymentVersion>,
    /// Why nothing is allowed, set when `allowed` is empty.
    pub reason: Option<String>,
}

impl PolicyEvaluation {
    pub fn selected(&self) -> Option<&DeploymentVersion> {
        self.allowed.first()
    }
}

/// Runs the ordered policy rule chain over the versions of a release target.
#[derive(Debug)]
pub struct PolicyEngine {
    pub rules: Vec<Box<dyn Rule>>,

    pub deployment_service: Arc<DeploymentService>,
    pub environment_service: Arc<EnvironmentService>,
    pub membership_service: Arc<MembershipService>,
    pub policy_service: Arc<PolicyService>,
    pub resource_service: Arc<ResourceService>,
    pub version_service: Arc<VersionService>,
}

impl PolicyEngine {
    /// Enabled policies whose targets cover the release target, highest priority first.
    #[tracing::instrument(name = "policy::engine::applicable_policies", skip_all)]
    pub async fn applicable_policies(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Policy>> {
        let policy_target_ids = self
            .membership_service
            .list_policy_target_ids(release_target_id)
            .await?;

        self.policy_service
            .list_enabled_by_target_ids(&policy_target_ids)
            .await
    }

    /// Loads what the rules need to know about a target. `None` when its resource,
    /// environment or deployment no longer exists.
    #[tracing::instrument(name = "policy::engine::load_context", skip_all)]
    pub async fn load_context(
        &self,
        release_target: &ReleaseTarget,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<RuleContext>> {
        let resource = match self
            .resource_service
            .get_by_id(&release_target.resource_id)
            .await?
        {
            Some(resource) if !resource.is_deleted() => resource,
            _ => return Ok(None),
        };

        let environment = match self
            .environment_service
            .get_by_id(&release_target.environment_id)
            .await?
        {
            Some(environment) => environment,
            None => return Ok(None),
        };

        let deployment = match self
            .deployment_service
            .get_by_id(&release_target.deployment_id)
            .await?
        {
            Some(deployment) => deployment,
            None => return Ok(None),
        };

        let policies = self.applicable_policies(&release_target.id).await?;

        Ok(Some(RuleContext {
            release_target: release_target.clone(),
            resource,
            environment,
            deployment,
            policies,
            now,
        }))
    }

    /// Ready versions of the deployment passing every policy's version selector, newest
    /// first.
    pub async fn candidates(&self, context: &RuleContext) -> anyhow::Result<Vec<DeploymentVersion>> {
        let versions = self
            .version_service
            .list_ready_by_deployment(&context.deployment.id)
            .await?;

        Ok(versions
            .into_iter()
            .filter(|version| {
                context.policies.iter().all(|policy| match &policy.version_selector {
                    Some(selector) => selector.matches(version),
                    None => true,
                })
            })
            .collect())
    }

    #[tracing::instrument(name = "policy::engine::evaluate", skip_all)]
    pub async fn evaluate(&self, context: &RuleContext) -> anyhow::Result<PolicyEvaluation> {
        let policy_ids: Vec<String> = context.policies.iter().map(|p| p.id.clone()).collect();

        let mut candidates = self.candidates(context).await?;
        if candidates.is_empty() {
            return Ok(PolicyEvaluation {
                policy_ids,
                allowed: vec![],
                reason: Some(format!(
                    "no ready version of deployment {} matches the version selectors",
                    context.deployment.id
                )),
            });
        }

        for rule in self.rules.iter() {
            let result = rule.filter(context, candidates).await?;

            if result.allowed.is_empty() {
                let reason = result
                    .reason
                    .unwrap_or_else(|| format!("no version passed the {} rule", rule.name()));

                tracing::info!(
                    "release target {} blocked by {} rule: {}",
                    context.release_target.id,
                    rule.name(),
                    reason
                );

                return Ok(PolicyEvaluation {
                    policy_ids,
                    allowed: vec![],
                    reason: Some(reason),
                });
            }

            candidates = result.allowed;
        }

        candidates.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(PolicyEvaluation {
            policy_ids,
            allowed: candidates,
            reason: None,
        })
    }
}
