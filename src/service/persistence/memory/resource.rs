use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::MemoryPersistence;
use crate::{
    models::{Resource, ResourceRelationship},
    persistence::{ResourcePersistence, ResourceRelationshipPersistence},
};

#[async_trait]
impl ResourcePersistence for MemoryPersistence<Resource> {
    async fn upsert_many(&self, resources: &[Resource]) -> anyhow::Result<u64> {
        let mut locked_resources = self.get_models_locked()?;

        for resource in resources {
            locked_resources.insert(resource.id.clone(), resource.clone());
        }

        Ok(resources.len() as u64)
    }

    async fn get_by_identifier(
        &self,
        workspace_id: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Resource>> {
        let resources = self.filter(|resource| {
            resource.workspace_id == workspace_id && resource.identifier == identifier
        })?;

        Ok(resources.into_iter().next())
    }

    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Resource>> {
        self.filter(|resource| resource.workspace_id == workspace_id && !resource.is_deleted())
    }

    async fn list_by_provider(
        &self,
        workspace_id: &str,
        provider_id: &str,
    ) -> anyhow::Result<Vec<Resource>> {
        self.filter(|resource| {
            resource.workspace_id == workspace_id
                && resource.provider_id.as_deref() == Some(provider_id)
                && !resource.is_deleted()
        })
    }

    async fn soft_delete(
        &self,
        resource_ids: &[String],
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut locked_resources = self.get_models_locked()?;

        let mut deleted_count = 0;
        for resource_id in resource_ids {
            if let Some(resource) = locked_resources.get_mut(resource_id) {
                if resource.deleted_at.is_none() {
                    resource.deleted_at = Some(now);
                    resource.updated_at = now;
                    deleted_count += 1;
                }
            }
        }

        Ok(deleted_count)
    }
}

#[async_trait]
impl ResourceRelationshipPersistence for MemoryPersistence<ResourceRelationship> {
    async fn get_children(&self, parent_id: &str) -> anyhow::Result<Vec<ResourceRelationship>> {
        self.filter(|relationship| relationship.parent_id == parent_id)
    }

    async fn get_parents(&self, child_id: &str) -> anyhow::Result<Vec<ResourceRelationship>> {
        self.filter(|relationship| relationship.child_id == child_id)
    }
}
