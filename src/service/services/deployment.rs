use shipyard_core::{
    create_event, make_dedup_key, EventStream, EventType, ModelType, OperationId,
};
use std::sync::Arc;

use crate::{errors::ServiceError, models::Deployment, persistence::DeploymentPersistence};

#[derive(Debug)]
pub struct DeploymentService {
    pub persistence: Box<dyn DeploymentPersistence>,
    pub event_stream: Arc<dyn EventStream>,
}

impl DeploymentService {
    #[tracing::instrument(name = "service::deployment::upsert", skip_all)]
    pub async fn upsert(
        &self,
        deployment: &Deployment,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        if let Some(selector) = &deployment.resource_selector {
            selector
                .validate()
                .map_err(|err| ServiceError::Validation(err.to_string()))?;
        }

        let previous = self.persistence.get_by_id(&deployment.id).await?;
        let event_type = match previous {
            Some(_) => EventType::Updated,
            None => EventType::Created,
        };

        self.persistence.upsert(deployment).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &previous,
            &Some(deployment.clone()),
            event_type,
            ModelType::Deployment,
            &deployment.workspace_id,
            &operation_id,
        )?
        .with_dedup_key(make_dedup_key(ModelType::Deployment, &deployment.id));

        self.event_stream.send(&event).await?;

        tracing::info!("deployment {} {}", deployment.id, event_type.as_str());

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::deployment::delete", skip_all)]
    pub async fn delete(
        &self,
        deployment_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let deployment = match self.get_by_id(deployment_id).await? {
            Some(deployment) => deployment,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "deployment {} not found",
                    deployment_id
                ))
                .into())
            }
        };

        self.persistence.delete(deployment_id).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &Some(deployment.clone()),
            &None,
            EventType::Deleted,
            ModelType::Deployment,
            &deployment.workspace_id,
            &operation_id,
        )?;

        self.event_stream.send(&event).await?;

        tracing::info!("deployment {} deleted", deployment_id);

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::deployment::get_by_id", skip_all)]
    pub async fn get_by_id(&self, deployment_id: &str) -> anyhow::Result<Option<Deployment>> {
        self.persistence.get_by_id(deployment_id).await
    }

    #[tracing::instrument(name = "service::deployment::list_by_workspace", skip_all)]
    pub async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Deployment>> {
        self.persistence.list_by_workspace(workspace_id).await
    }

    #[tracing::instrument(name = "service::deployment::list_by_system", skip_all)]
    pub async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Deployment>> {
        self.persistence.list_by_system(system_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{persistence::memory::DeploymentMemoryPersistence, test::get_deployment_fixture};
    use shipyard_memory_stream::MemoryEventStream;

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap()) as Arc<dyn EventStream>;
        let deployment_service = DeploymentService {
            persistence: Box::new(DeploymentMemoryPersistence::default()),
            event_stream: Arc::clone(&event_stream),
        };

        let deployment = get_deployment_fixture(None);
        deployment_service.upsert(&deployment, &None).await.unwrap();

        let updated = Deployment {
            name: "api-v2".to_owned(),
            ..deployment.clone()
        };
        deployment_service.upsert(&updated, &None).await.unwrap();

        let by_system = deployment_service
            .list_by_system(&deployment.system_id)
            .await
            .unwrap();
        assert_eq!(by_system.len(), 1);
        assert_eq!(by_system[0].name, "api-v2");

        let operation_id = deployment_service
            .delete(&deployment.id, &None)
            .await
            .unwrap();
        assert_eq!(operation_id.id.len(), 36);

        assert!(deployment_service
            .list_by_workspace(&deployment.workspace_id)
            .await
            .unwrap()
            .is_empty());
    }
}
