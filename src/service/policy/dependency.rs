use async_trait::async_trait;
use std::sync::Arc;

use super::{Rule, RuleContext, RuleResult};
use crate::{
    models::{DeploymentVersion, JobStatus, VersionDependency},
    services::{JobService, ReleaseService, ReleaseTargetService, ResourceService, VersionService},
};

/// Keeps candidates whose declared dependencies are already running on the same resource
/// or on one of its parents.
///
/// A dependency on deployment D is satisfied when some release target of D on one of those
/// resources has a latest successful job whose release version matches the selector.
#[derive(Debug)]
pub struct DependencyRule {
    pub job_service: Arc<JobService>,
    pub release_service: Arc<ReleaseService>,
    pub release_target_service: Arc<ReleaseTargetService>,
    pub resource_service: Arc<ResourceService>,
    pub version_service: Arc<VersionService>,
}

impl DependencyRule {
    /// Version most recently deployed successfully for `deployment_id` on a resource.
    pub async fn deployed_version(
        &self,
        resource_id: &str,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        let release_targets = self
            .release_target_service
            .list_by_resource_ids(&[resource_id.to_string()])
            .await?;

        let mut deployed = Vec::new();
        for release_target in release_targets
            .iter()
            .filter(|release_target| release_target.deployment_id == deployment_id)
        {
            let jobs = self
                .job_service
                .list_by_release_target(&release_target.id)
                .await?;

            let successful = match jobs
                .into_iter()
                .find(|job| job.status == JobStatus::Successful)
            {
                Some(job) => job,
                None => continue,
            };

            let release = match self.release_service.get_by_id(&successful.release_id).await? {
                Some(release) => release,
                None => continue,
            };

            if let Some(version) = self.version_service.get_by_id(&release.version_id).await? {
                deployed.push(version);
            }
        }

        Ok(deployed)
    }

    async fn is_satisfied(
        &self,
        resource_ids: &[String],
        dependency: &VersionDependency,
    ) -> anyhow::Result<bool> {
        for resource_id in resource_ids.iter() {
            let deployed = self
                .deployed_version(resource_id, &dependency.deployment_id)
                .await?;

            if deployed
                .iter()
                .any(|version| dependency.version_selector.matches(version))
            {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[async_trait]
impl Rule for DependencyRule {
    fn name(&self) -> &'static str {
        "dependency"
    }

    async fn filter(
        &self,
        context: &RuleContext,
        candidates: Vec<DeploymentVersion>,
    ) -> anyhow::Result<RuleResult> {
        let mut allowed = Vec::new();
        let mut reasons: Vec<String> = Vec::new();

        if candidates.iter().all(|candidate| candidate.dependencies.is_empty()) {
            return Ok(RuleResult::allow(candidates));
        }

        let mut resource_ids = vec![context.resource.id.clone()];
        resource_ids.extend(
            self.resource_service
                .get_parent_ids(&context.resource.id)
                .await?,
        );

        for candidate in candidates {
            let mut unsatisfied = None;

            for dependency in candidate.dependencies.iter() {
                if !self
                    .is_satisfied(&resource_ids, dependency)
                    .await?
                {
                    unsatisfied = Some(dependency.deployment_id.clone());
                    break;
                }
            }

            match unsatisfied {
                None => allowed.push(candidate),
                Some(deployment_id) => {
                    let reason = format!(
                        "dependency on deployment {} not satisfied",
                        deployment_id
                    );
                    if !reasons.contains(&reason) {
                        reasons.push(reason);
                    }
                }
            }
        }

        let reason = match reasons.is_empty() {
            true => None,
            false => Some(reasons.join(", ")),
        };

        Ok(RuleResult { allowed, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ServiceContext,
        models::{Job, Release, ReleaseTarget, ResourceRelationship},
        policy::tests::rule_context,
        test::{get_job_fixture, get_release_target_fixture, get_version_fixture},
    };
    use shipyard_core::{Condition, StringOperator};

    fn dependent_version() -> DeploymentVersion {
        DeploymentVersion {
            dependencies: vec![VersionDependency {
                deployment_id: "database".to_owned(),
                version_selector: Condition::Version {
                    operator: StringOperator::StartsWith,
                    value: "5.".to_owned(),
                },
            }],
            ..get_version_fixture(None)
        }
    }

    async fn deploy_database(context: &ServiceContext, resource_id: &str, tag: &str) {
        let release_target = ReleaseTarget {
            id: "database-target".to_owned(),
            resource_id: resource_id.to_owned(),
            deployment_id: "database".to_owned(),
            ..get_release_target_fixture(None)
        };
        context
            .release_target_service
            .persistence
            .upsert(&release_target)
            .await
            .unwrap();

        let version = DeploymentVersion {
            id: "database-version".to_owned(),
            deployment_id: "database".to_owned(),
            ..get_version_fixture(Some(tag))
        };
        context
            .version_service
            .persistence
            .upsert(&version)
            .await
            .unwrap();

        let release = Release {
            id: "database-release".to_owned(),
            release_target_id: release_target.id.clone(),
            version_id: version.id.clone(),
            variables: Default::default(),
            created_at: version.created_at,
        };
        context
            .release_service
            .persistence
            .upsert(&release)
            .await
            .unwrap();

        let job = Job {
            id: "database-job".to_owned(),
            release_id: release.id.clone(),
            release_target_id: release_target.id.clone(),
            status: JobStatus::Successful,
            ..get_job_fixture(None)
        };
        context.job_service.persistence.upsert(&job).await.unwrap();
    }

    fn dependency_rule(context: &ServiceContext) -> DependencyRule {
        DependencyRule {
            job_service: Arc::clone(&context.job_service),
            release_service: Arc::clone(&context.release_service),
            release_target_service: Arc::clone(&context.release_target_service),
            resource_service: Arc::clone(&context.resource_service),
            version_service: Arc::clone(&context.version_service),
        }
    }

    #[tokio::test]
    async fn test_unsatisfied_dependency_blocks() {
        let context = ServiceContext::memory();
        let rule = dependency_rule(&context);

        let result = rule
            .filter(&rule_context(), vec![dependent_version()])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());
        assert_eq!(
            result.reason.as_deref(),
            Some("dependency on deployment database not satisfied")
        );

        deploy_database(&context, "resource-fixture", "4.2.0").await;
        let result = rule
            .filter(&rule_context(), vec![dependent_version()])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());
    }

    #[tokio::test]
    async fn test_dependency_satisfied_on_parent_resource() {
        let context = ServiceContext::memory();
        let rule = dependency_rule(&context);

        deploy_database(&context, "parent-cluster", "5.1.0").await;
        context
            .resource_service
            .upsert_relationship(&ResourceRelationship {
                id: ResourceRelationship::make_id("parent-cluster", "resource-fixture", "contains"),
                workspace_id: "workspace-fixture".to_owned(),
                parent_id: "parent-cluster".to_owned(),
                child_id: "resource-fixture".to_owned(),
                relationship_type: "contains".to_owned(),
            })
            .await
            .unwrap();

        let result = rule
            .filter(&rule_context(), vec![dependent_version()])
            .await
            .unwrap();
        assert_eq!(result, RuleResult::allow(vec![dependent_version()]));
    }
}
