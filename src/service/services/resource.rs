use chrono::Utc;
use shipyard_core::{
    create_event, make_dedup_key, Event, EventStream, EventType, ModelType, OperationId,
};
use std::{collections::HashSet, sync::Arc};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    models::{Resource, ResourceRelationship, ResourceToInsert},
    persistence::{ResourcePersistence, ResourceRelationshipPersistence},
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpsertResourcesResult {
    pub inserted: Vec<Resource>,
    pub updated: Vec<Resource>,
    pub deleted: Vec<Resource>,
}

impl UpsertResourcesResult {
    /// Ids of every resource whose release targets may have changed.
    pub fn affected_resource_ids(&self) -> Vec<String> {
        self.inserted
            .iter()
            .chain(self.updated.iter())
            .chain(self.deleted.iter())
            .map(|resource| resource.id.clone())
            .collect()
    }
}

#[derive(Debug)]
pub struct ResourceService {
    pub persistence: Box<dyn ResourcePersistence>,
    pub relationship_persistence: Box<dyn ResourceRelationshipPersistence>,
    pub event_stream: Arc<dyn EventStream>,
}

impl ResourceService {
    /// Applies a scanner's full view of a provider's resources.
    ///
    /// Resources of the provider missing from the batch are soft-deleted. Unchanged
    /// resources are left alone and emit no event.
    #[tracing::instrument(name = "service::resource::upsert_resources", skip_all)]
    pub async fn upsert_resources(
        &self,
        workspace_id: &str,
        provider_id: &str,
        resources: &[ResourceToInsert],
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<UpsertResourcesResult> {
        let mut seen_identifiers = HashSet::new();
        for resource in resources {
            if resource.identifier.is_empty() {
                return Err(
                    ServiceError::Validation("resource identifier is required".to_owned()).into(),
                );
            }

            if !seen_identifiers.insert(resource.identifier.as_str()) {
                return Err(ServiceError::Validation(format!(
                    "duplicate resource identifier '{}' in batch",
                    resource.identifier
                ))
                .into());
            }
        }

        let now = Utc::now();
        let mut result = UpsertResourcesResult::default();
        let mut previous_models = Vec::new();

        for incoming in resources {
            let existing = self
                .persistence
                .get_by_identifier(workspace_id, &incoming.identifier)
                .await?;

            match existing {
                None => result.inserted.push(Resource {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: workspace_id.to_string(),
                    provider_id: Some(provider_id.to_string()),

                    name: incoming.name.clone(),
                    kind: incoming.kind.clone(),
                    version: incoming.version.clone(),
                    identifier: incoming.identifier.clone(),

                    metadata: incoming.metadata.clone(),
                    variables: incoming.variables.clone(),

                    created_at: now,
                    updated_at: now,
                    deleted_at: None,
                }),
                Some(existing) => {
                    let provider_changed =
                        existing.provider_id.as_deref() != Some(provider_id);

                    if !existing.differs_from(incoming) && !provider_changed {
                        continue;
                    }

                    let updated = Resource {
                        provider_id: Some(provider_id.to_string()),
                        name: incoming.name.clone(),
                        kind: incoming.kind.clone(),
                        version: incoming.version.clone(),
                        metadata: incoming.metadata.clone(),
                        variables: incoming.variables.clone(),
                        updated_at: now,
                        deleted_at: None,
                        ..existing.clone()
                    };

                    previous_models.push(existing);
                    result.updated.push(updated);
                }
            }
        }

        let upserted: Vec<Resource> = result
            .inserted
            .iter()
            .chain(result.updated.iter())
            .cloned()
            .collect();

        if !upserted.is_empty() {
            self.persistence.upsert_many(&upserted).await?;
        }

        let missing: Vec<Resource> = self
            .persistence
            .list_by_provider(workspace_id, provider_id)
            .await?
            .into_iter()
            .filter(|resource| !seen_identifiers.contains(resource.identifier.as_str()))
            .collect();

        if !missing.is_empty() {
            let missing_ids: Vec<String> = missing.iter().map(|r| r.id.clone()).collect();
            self.persistence.soft_delete(&missing_ids, now).await?;

            result.deleted = missing
                .into_iter()
                .map(|resource| Resource {
                    deleted_at: Some(now),
                    updated_at: now,
                    ..resource
                })
                .collect();
        }

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let mut events = Vec::new();

        for resource in result.inserted.iter() {
            events.push(Self::make_event(
                None,
                Some(resource.clone()),
                EventType::Created,
                &operation_id,
            )?);
        }

        for (previous, resource) in previous_models.into_iter().zip(result.updated.iter()) {
            events.push(Self::make_event(
                Some(previous),
                Some(resource.clone()),
                EventType::Updated,
                &operation_id,
            )?);
        }

        for resource in result.deleted.iter() {
            events.push(Self::make_event(
                Some(resource.clone()),
                None,
                EventType::Deleted,
                &operation_id,
            )?);
        }

        if !events.is_empty() {
            self.event_stream.send_many(&events).await?;
        }

        tracing::info!(
            "resources upserted for provider {}: {} inserted, {} updated, {} deleted",
            provider_id,
            result.inserted.len(),
            result.updated.len(),
            result.deleted.len()
        );

        Ok(result)
    }

    fn make_event(
        previous: Option<Resource>,
        current: Option<Resource>,
        event_type: EventType,
        operation_id: &OperationId,
    ) -> anyhow::Result<Event> {
        let resource = match (&current, &previous) {
            (Some(resource), _) | (None, Some(resource)) => resource,
            (None, None) => return Err(anyhow::anyhow!("resource event without a model")),
        };

        let workspace_id = resource.workspace_id.clone();
        let dedup_key = make_dedup_key(ModelType::Resource, &resource.id);

        Ok(create_event(
            &previous,
            &current,
            event_type,
            ModelType::Resource,
            &workspace_id,
            operation_id,
        )?
        .with_dedup_key(dedup_key))
    }

    #[tracing::instrument(name = "service::resource::get_by_id", skip_all)]
    pub async fn get_by_id(&self, resource_id: &str) -> anyhow::Result<Option<Resource>> {
        self.persistence.get_by_id(resource_id).await
    }

    #[tracing::instrument(name = "service::resource::get_by_identifier", skip_all)]
    pub async fn get_by_identifier(
        &self,
        workspace_id: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Resource>> {
        self.persistence
            .get_by_identifier(workspace_id, identifier)
            .await
    }

    #[tracing::instrument(name = "service::resource::list_by_workspace", skip_all)]
    pub async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Resource>> {
        self.persistence.list_by_workspace(workspace_id).await
    }

    #[tracing::instrument(name = "service::resource::upsert_relationship", skip_all)]
    pub async fn upsert_relationship(
        &self,
        relationship: &ResourceRelationship,
    ) -> anyhow::Result<u64> {
        if relationship.parent_id == relationship.child_id {
            return Err(ServiceError::Validation(format!(
                "resource {} cannot be its own child",
                relationship.parent_id
            ))
            .into());
        }

        self.relationship_persistence.upsert(relationship).await
    }

    /// Ids of the direct children of a resource in the relationship graph.
    #[tracing::instrument(name = "service::resource::get_child_ids", skip_all)]
    pub async fn get_child_ids(&self, resource_id: &str) -> anyhow::Result<Vec<String>> {
        let relationships = self.relationship_persistence.get_children(resource_id).await?;

        let mut child_ids: Vec<String> = relationships
            .into_iter()
            .map(|relationship| relationship.child_id)
            .collect();
        child_ids.sort();
        child_ids.dedup();

        Ok(child_ids)
    }

    #[tracing::instrument(name = "service::resource::get_parent_ids", skip_all)]
    pub async fn get_parent_ids(&self, resource_id: &str) -> anyhow::Result<Vec<String>> {
        let mut parent_ids: Vec<String> = self
            .relationship_persistence
            .get_parents(resource_id)
            .await?
            .into_iter()
            .map(|relationship| relationship.parent_id)
            .collect();
        parent_ids.sort();
        parent_ids.dedup();

        Ok(parent_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persistence::memory::{RelationshipMemoryPersistence, ResourceMemoryPersistence},
        test::WORKSPACE_FIXTURE_ID,
    };
    use shipyard_memory_stream::MemoryEventStream;
    use std::collections::BTreeMap;

    fn scanned(identifier: &str, kind: &str) -> ResourceToInsert {
        ResourceToInsert {
            name: identifier.to_owned(),
            kind: kind.to_owned(),
            version: "v1".to_owned(),
            identifier: identifier.to_owned(),
            metadata: BTreeMap::new(),
            variables: BTreeMap::new(),
        }
    }

    fn resource_service(event_stream: &Arc<MemoryEventStream>) -> ResourceService {
        ResourceService {
            persistence: Box::new(ResourceMemoryPersistence::default()),
            relationship_persistence: Box::new(RelationshipMemoryPersistence::default()),
            event_stream: Arc::clone(event_stream) as Arc<dyn EventStream>,
        }
    }

    #[tokio::test]
    async fn test_upsert_resources_inserts_updates_and_deletes() {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap());
        let resource_service = resource_service(&event_stream);

        let result = resource_service
            .upsert_resources(
                WORKSPACE_FIXTURE_ID,
                "scanner",
                &[scanned("a", "cluster"), scanned("b", "vm")],
                &None,
            )
            .await
            .unwrap();
        assert_eq!(result.inserted.len(), 2);
        assert!(result.updated.is_empty());
        assert!(result.deleted.is_empty());

        let unchanged = resource_service
            .upsert_resources(
                WORKSPACE_FIXTURE_ID,
                "scanner",
                &[scanned("a", "cluster"), scanned("b", "vm")],
                &None,
            )
            .await
            .unwrap();
        assert_eq!(unchanged, UpsertResourcesResult::default());

        let result = resource_service
            .upsert_resources(
                WORKSPACE_FIXTURE_ID,
                "scanner",
                &[scanned("a", "vm")],
                &None,
            )
            .await
            .unwrap();
        assert_eq!(result.updated.len(), 1);
        assert_eq!(result.updated[0].kind, "vm");
        assert_eq!(result.deleted.len(), 1);
        assert_eq!(result.deleted[0].identifier, "b");

        let live = resource_service
            .list_by_workspace(WORKSPACE_FIXTURE_ID)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);

        // later changes to "a" and "b" collapse into the pending created events
        let events = event_stream.receive("").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.model_type == ModelType::Resource));
    }

    #[tokio::test]
    async fn test_upsert_resources_rejects_duplicate_identifiers() {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap());
        let resource_service = resource_service(&event_stream);

        let err = resource_service
            .upsert_resources(
                WORKSPACE_FIXTURE_ID,
                "scanner",
                &[scanned("a", "cluster"), scanned("a", "vm")],
                &None,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            ServiceError::from(err),
            ServiceError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_child_and_parent_ids() {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap());
        let resource_service = resource_service(&event_stream);

        let relationship = ResourceRelationship {
            id: ResourceRelationship::make_id("parent", "child", "contains"),
            workspace_id: WORKSPACE_FIXTURE_ID.to_owned(),
            parent_id: "parent".to_owned(),
            child_id: "child".to_owned(),
            relationship_type: "contains".to_owned(),
        };
        resource_service
            .upsert_relationship(&relationship)
            .await
            .unwrap();

        let child_ids = resource_service.get_child_ids("parent").await.unwrap();
        assert_eq!(child_ids, vec!["child".to_owned()]);

        let parent_ids = resource_service.get_parent_ids("child").await.unwrap();
        assert_eq!(parent_ids, vec!["parent".to_owned()]);
        assert!(resource_service.get_parent_ids("parent").await.unwrap().is_empty());
    }
}
