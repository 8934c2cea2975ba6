use shipyard_core::{Condition, LockOutcome};
use std::{collections::HashMap, sync::Arc};

use super::{DeploymentService, EnvironmentService, PolicyService, ResourceService};
use crate::{
    models::{
        Deployment, Environment, MembershipKind, MembershipScope, Policy, PolicyTarget,
        ReleaseTarget, Resource,
    },
    persistence::{MembershipPersistence, ReleaseTargetPersistence},
};

/// Live entities of one workspace, keyed by id.
#[derive(Debug, Default)]
struct WorkspaceSnapshot {
    resources: HashMap<String, Resource>,
    environments: HashMap<String, Environment>,
    deployments: HashMap<String, Deployment>,
}

impl WorkspaceSnapshot {
    fn matches(&self, target: &PolicyTarget, release_target: &ReleaseTarget) -> bool {
        let resource = self.resources.get(&release_target.resource_id);
        let environment = self.environments.get(&release_target.environment_id);
        let deployment = self.deployments.get(&release_target.deployment_id);

        match (resource, environment, deployment) {
            (Some(resource), Some(environment), Some(deployment)) => {
                target.matches(resource, environment, deployment)
            }
            _ => false,
        }
    }
}

/// Keeps the computed selector membership rows in step with selectors and entities.
#[derive(Debug)]
pub struct MembershipService {
    pub persistence: Box<dyn MembershipPersistence>,
    pub release_target_persistence: Arc<dyn ReleaseTargetPersistence>,

    pub resource_service: Arc<ResourceService>,
    pub environment_service: Arc<EnvironmentService>,
    pub deployment_service: Arc<DeploymentService>,
    pub policy_service: Arc<PolicyService>,
}

fn matching_resource_ids(
    selector: &Option<Condition>,
    match_all_without_selector: bool,
    resources: &[Resource],
) -> Vec<String> {
    resources
        .iter()
        .filter(|resource| match selector {
            Some(selector) => selector.matches(*resource),
            None => match_all_without_selector,
        })
        .map(|resource| resource.id.clone())
        .collect()
}

impl MembershipService {
    async fn snapshot(&self, workspace_id: &str) -> anyhow::Result<WorkspaceSnapshot> {
        let resources = self.resource_service.list_by_workspace(workspace_id).await?;
        let environments = self
            .environment_service
            .list_by_workspace(workspace_id)
            .await?;
        let deployments = self
            .deployment_service
            .list_by_workspace(workspace_id)
            .await?;

        Ok(WorkspaceSnapshot {
            resources: resources.into_iter().map(|r| (r.id.clone(), r)).collect(),
            environments: environments.into_iter().map(|e| (e.id.clone(), e)).collect(),
            deployments: deployments.into_iter().map(|d| (d.id.clone(), d)).collect(),
        })
    }

    /// Recomputes the resources of an environment. No selector means no resources.
    #[tracing::instrument(name = "service::membership::refresh_environment", skip_all)]
    pub async fn refresh_environment(
        &self,
        environment: &Environment,
    ) -> anyhow::Result<LockOutcome<Vec<String>>> {
        let resources = self
            .resource_service
            .list_by_workspace(&environment.workspace_id)
            .await?;
        let resource_ids =
            matching_resource_ids(&environment.resource_selector, false, &resources);

        let outcome = self
            .persistence
            .replace(&MembershipScope::environment(&environment.id), &resource_ids)
            .await?;

        Ok(outcome.map(|_| resource_ids))
    }

    /// Recomputes the resources of a deployment. No selector means every resource.
    #[tracing::instrument(name = "service::membership::refresh_deployment", skip_all)]
    pub async fn refresh_deployment(
        &self,
        deployment: &Deployment,
    ) -> anyhow::Result<LockOutcome<Vec<String>>> {
        let resources = self
            .resource_service
            .list_by_workspace(&deployment.workspace_id)
            .await?;
        let resource_ids = matching_resource_ids(&deployment.resource_selector, true, &resources);

        let outcome = self
            .persistence
            .replace(&MembershipScope::deployment(&deployment.id), &resource_ids)
            .await?;

        Ok(outcome.map(|_| resource_ids))
    }

    /// Recomputes the release targets of every target of a policy.
    #[tracing::instrument(name = "service::membership::refresh_policy", skip_all)]
    pub async fn refresh_policy(&self, policy: &Policy) -> anyhow::Result<LockOutcome<Vec<String>>> {
        let snapshot = self.snapshot(&policy.workspace_id).await?;
        let release_targets = self
            .release_target_persistence
            .list_by_workspace(&policy.workspace_id)
            .await?;

        self.refresh_policy_targets(&policy.targets, &snapshot, &release_targets)
            .await
    }

    async fn refresh_policy_targets(
        &self,
        targets: &[PolicyTarget],
        snapshot: &WorkspaceSnapshot,
        release_targets: &[ReleaseTarget],
    ) -> anyhow::Result<LockOutcome<Vec<String>>> {
        let mut release_target_ids = Vec::new();

        for target in targets {
            let matching: Vec<String> = release_targets
                .iter()
                .filter(|release_target| snapshot.matches(target, release_target))
                .map(|release_target| release_target.id.clone())
                .collect();

            let outcome = self
                .persistence
                .replace(&MembershipScope::policy_target(&target.id), &matching)
                .await?;
            if outcome.is_contended() {
                return Ok(LockOutcome::Contended);
            }

            release_target_ids.extend(matching);
        }

        release_target_ids.sort();
        release_target_ids.dedup();

        Ok(LockOutcome::Acquired(release_target_ids))
    }

    /// Empties a scope, used when its owner is deleted.
    #[tracing::instrument(name = "service::membership::clear", skip_all)]
    pub async fn clear(&self, scope: &MembershipScope) -> anyhow::Result<LockOutcome<u64>> {
        self.persistence.replace(scope, &[]).await
    }

    /// Recomputes environment and deployment membership of a whole workspace, in that order.
    #[tracing::instrument(name = "service::membership::refresh_catalog", skip_all)]
    pub async fn refresh_catalog(&self, workspace_id: &str) -> anyhow::Result<LockOutcome<()>> {
        for environment in self
            .environment_service
            .list_by_workspace(workspace_id)
            .await?
        {
            if self.refresh_environment(&environment).await?.is_contended() {
                return Ok(LockOutcome::Contended);
            }
        }

        for deployment in self
            .deployment_service
            .list_by_workspace(workspace_id)
            .await?
        {
            if self.refresh_deployment(&deployment).await?.is_contended() {
                return Ok(LockOutcome::Contended);
            }
        }

        Ok(LockOutcome::Acquired(()))
    }

    /// Recomputes the release targets of every policy target of a workspace against current
    /// release targets, resources, environments and deployments.
    #[tracing::instrument(name = "service::membership::refresh_policies", skip_all)]
    pub async fn refresh_policies(&self, workspace_id: &str) -> anyhow::Result<LockOutcome<()>> {
        let snapshot = self.snapshot(workspace_id).await?;
        let release_targets = self
            .release_target_persistence
            .list_by_workspace(workspace_id)
            .await?;

        for policy in self.policy_service.list_by_workspace(workspace_id).await? {
            let outcome = self
                .refresh_policy_targets(&policy.targets, &snapshot, &release_targets)
                .await?;
            if outcome.is_contended() {
                return Ok(LockOutcome::Contended);
            }
        }

        Ok(LockOutcome::Acquired(()))
    }

    #[tracing::instrument(name = "service::membership::detach_release_target", skip_all)]
    pub async fn detach_release_target(&self, release_target_id: &str) -> anyhow::Result<u64> {
        self.persistence
            .delete_entity(MembershipKind::PolicyTarget, release_target_id)
            .await
    }

    pub async fn list_members(&self, scope: &MembershipScope) -> anyhow::Result<Vec<String>> {
        self.persistence.list_entities(scope).await
    }

    /// Ids of the policy targets whose selectors cover a release target.
    pub async fn list_policy_target_ids(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        self.persistence
            .list_owners(MembershipKind::PolicyTarget, release_target_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ServiceContext,
        test::{get_environment_fixture, get_resource_fixture, WORKSPACE_FIXTURE_ID},
    };
    use shipyard_core::MetadataOperator;

    #[tokio::test]
    async fn test_environment_membership_follows_selector() {
        let context = ServiceContext::memory();

        let cluster = get_resource_fixture(Some("cluster-a"));
        let vm = crate::models::Resource {
            kind: "vm".to_owned(),
            ..get_resource_fixture(Some("vm-b"))
        };
        context
            .resource_service
            .persistence
            .upsert_many(&[cluster.clone(), vm])
            .await
            .unwrap();

        let mut environment = get_environment_fixture(None);
        let members = match context
            .membership_service
            .refresh_environment(&environment)
            .await
            .unwrap()
        {
            LockOutcome::Acquired(members) => members,
            LockOutcome::Contended => panic!("unexpected contention"),
        };
        assert_eq!(members, vec![cluster.id.clone()]);

        environment.resource_selector = Some(Condition::Metadata {
            key: "team".to_owned(),
            operator: MetadataOperator::Null,
            value: None,
        });
        context
            .membership_service
            .refresh_environment(&environment)
            .await
            .unwrap();

        let mut stored = context
            .membership_service
            .list_members(&MembershipScope::environment(&environment.id))
            .await
            .unwrap();
        stored.sort();
        assert_eq!(stored, vec![cluster.id.clone(), "vm-b".to_owned()]);

        environment.resource_selector = None;
        context
            .membership_service
            .refresh_environment(&environment)
            .await
            .unwrap();
        assert!(context
            .membership_service
            .list_members(&MembershipScope::environment(&environment.id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deployment_without_selector_covers_workspace() {
        let context = ServiceContext::memory();

        context
            .resource_service
            .persistence
            .upsert_many(&[
                get_resource_fixture(Some("one")),
                get_resource_fixture(Some("two")),
            ])
            .await
            .unwrap();

        let deployment = crate::test::get_deployment_fixture(None);
        let outcome = context
            .membership_service
            .refresh_deployment(&deployment)
            .await
            .unwrap();

        match outcome {
            LockOutcome::Acquired(members) => assert_eq!(members.len(), 2),
            LockOutcome::Contended => panic!("unexpected contention"),
        }

        let outcome = context
            .membership_service
            .refresh_catalog(WORKSPACE_FIXTURE_ID)
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Acquired(()));
    }

    #[tokio::test]
    async fn test_policy_membership_follows_resource_metadata() {
        let context = ServiceContext::memory();

        let resource = get_resource_fixture(None);
        context
            .resource_service
            .persistence
            .upsert_many(&[resource.clone()])
            .await
            .unwrap();
        context
            .environment_service
            .upsert(&get_environment_fixture(None), &None)
            .await
            .unwrap();
        context
            .deployment_service
            .upsert(&crate::test::get_deployment_fixture(None), &None)
            .await
            .unwrap();
        context
            .release_target_service
            .persistence
            .upsert(&crate::test::get_release_target_fixture(None))
            .await
            .unwrap();

        let mut policy = crate::test::get_policy_fixture(None);
        policy.targets[0].resource_selector = Some(Condition::Metadata {
            key: "tier".to_owned(),
            operator: MetadataOperator::Equals,
            value: Some("prod".to_owned()),
        });
        context.policy_service.upsert(&policy, &None).await.unwrap();

        let scope = MembershipScope::policy_target(&policy.targets[0].id);
        context
            .membership_service
            .refresh_policies(WORKSPACE_FIXTURE_ID)
            .await
            .unwrap();
        assert!(context
            .membership_service
            .list_members(&scope)
            .await
            .unwrap()
            .is_empty());

        let mut prod = resource;
        prod.metadata.insert("tier".to_owned(), "prod".to_owned());
        context
            .resource_service
            .persistence
            .upsert_many(&[prod])
            .await
            .unwrap();

        let outcome = context
            .membership_service
            .refresh_policies(WORKSPACE_FIXTURE_ID)
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Acquired(()));
        assert_eq!(
            context.membership_service.list_members(&scope).await.unwrap(),
            vec!["release-target-fixture".to_owned()]
        );
    }
}
