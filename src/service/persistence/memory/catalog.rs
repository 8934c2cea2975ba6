use async_trait::async_trait;

use super::MemoryPersistence;
use crate::{
    models::{Deployment, DeploymentVariable, DeploymentVersion, Environment, Policy},
    persistence::{
        DeploymentPersistence, EnvironmentPersistence, PolicyPersistence, VariablePersistence,
        VersionPersistence,
    },
};

#[async_trait]
impl EnvironmentPersistence for MemoryPersistence<Environment> {
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Environment>> {
        self.filter(|environment| environment.workspace_id == workspace_id)
    }

    async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Environment>> {
        self.filter(|environment| environment.system_id == system_id)
    }
}

#[async_trait]
impl DeploymentPersistence for MemoryPersistence<Deployment> {
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Deployment>> {
        self.filter(|deployment| deployment.workspace_id == workspace_id)
    }

    async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Deployment>> {
        self.filter(|deployment| deployment.system_id == system_id)
    }
}

#[async_trait]
impl VersionPersistence for MemoryPersistence<DeploymentVersion> {
    async fn list_ready_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        let mut versions =
            self.filter(|version| version.deployment_id == deployment_id && version.is_ready())?;

        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(versions)
    }

    async fn get_by_tag(
        &self,
        deployment_id: &str,
        tag: &str,
    ) -> anyhow::Result<Option<DeploymentVersion>> {
        let versions =
            self.filter(|version| version.deployment_id == deployment_id && version.tag == tag)?;

        Ok(versions.into_iter().next())
    }

    async fn list_depending_on(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        self.filter(|version| {
            version
                .dependencies
                .iter()
                .any(|dependency| dependency.deployment_id == deployment_id)
        })
    }
}

#[async_trait]
impl VariablePersistence for MemoryPersistence<DeploymentVariable> {
    async fn list_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVariable>> {
        let mut variables = self.filter(|variable| variable.deployment_id == deployment_id)?;

        variables.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(variables)
    }
}

#[async_trait]
impl PolicyPersistence for MemoryPersistence<Policy> {
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Policy>> {
        let mut policies = self.filter(|policy| policy.workspace_id == workspace_id)?;

        Policy::sort_by_priority(&mut policies);

        Ok(policies)
    }

    async fn list_by_target_ids(
        &self,
        policy_target_ids: &[String],
    ) -> anyhow::Result<Vec<Policy>> {
        let mut policies = self.filter(|policy| {
            policy
                .targets
                .iter()
                .any(|target| policy_target_ids.contains(&target.id))
        })?;

        Policy::sort_by_priority(&mut policies);

        Ok(policies)
    }
}
