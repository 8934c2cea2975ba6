use shipyard_core::{
    create_event, make_dedup_key, EventStream, EventType, ModelType, OperationId,
};
use std::sync::Arc;

use crate::{errors::ServiceError, models::Environment, persistence::EnvironmentPersistence};

#[derive(Debug)]
pub struct EnvironmentService {
    pub persistence: Box<dyn EnvironmentPersistence>,
    pub event_stream: Arc<dyn EventStream>,
}

impl EnvironmentService {
    #[tracing::instrument(name = "service::environment::upsert", skip_all)]
    pub async fn upsert(
        &self,
        environment: &Environment,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        if let Some(selector) = &environment.resource_selector {
            selector
                .validate()
                .map_err(|err| ServiceError::Validation(err.to_string()))?;
        }

        let previous = self.persistence.get_by_id(&environment.id).await?;
        let event_type = match previous {
            Some(_) => EventType::Updated,
            None => EventType::Created,
        };

        self.persistence.upsert(environment).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &previous,
            &Some(environment.clone()),
            event_type,
            ModelType::Environment,
            &environment.workspace_id,
            &operation_id,
        )?
        .with_dedup_key(make_dedup_key(ModelType::Environment, &environment.id));

        self.event_stream.send(&event).await?;

        tracing::info!("environment {} {}", environment.id, event_type.as_str());

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::environment::delete", skip_all)]
    pub async fn delete(
        &self,
        environment_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let environment = match self.get_by_id(environment_id).await? {
            Some(environment) => environment,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "environment {} not found",
                    environment_id
                ))
                .into())
            }
        };

        self.persistence.delete(environment_id).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &Some(environment.clone()),
            &None,
            EventType::Deleted,
            ModelType::Environment,
            &environment.workspace_id,
            &operation_id,
        )?;

        self.event_stream.send(&event).await?;

        tracing::info!("environment {} deleted", environment_id);

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::environment::get_by_id", skip_all)]
    pub async fn get_by_id(&self, environment_id: &str) -> anyhow::Result<Option<Environment>> {
        self.persistence.get_by_id(environment_id).await
    }

    #[tracing::instrument(name = "service::environment::list_by_workspace", skip_all)]
    pub async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Environment>> {
        self.persistence.list_by_workspace(workspace_id).await
    }

    #[tracing::instrument(name = "service::environment::list_by_system", skip_all)]
    pub async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Environment>> {
        self.persistence.list_by_system(system_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{persistence::memory::EnvironmentMemoryPersistence, test::get_environment_fixture};
    use shipyard_core::{ComparisonOperator, Condition};
    use shipyard_memory_stream::MemoryEventStream;

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap()) as Arc<dyn EventStream>;
        let environment_service = EnvironmentService {
            persistence: Box::new(EnvironmentMemoryPersistence::default()),
            event_stream: Arc::clone(&event_stream),
        };

        let environment = get_environment_fixture(None);
        let operation_id = environment_service.upsert(&environment, &None).await.unwrap();
        assert_eq!(operation_id.id.len(), 36);

        let fetched = environment_service
            .get_by_id(&environment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, environment);

        let events = event_stream.receive("").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Created);

        environment_service
            .delete(&environment.id, &None)
            .await
            .unwrap();
        assert!(environment_service
            .get_by_id(&environment.id)
            .await
            .unwrap()
            .is_none());

        let err = environment_service
            .delete(&environment.id, &None)
            .await
            .unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upsert_rejects_deep_selector() {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap()) as Arc<dyn EventStream>;
        let environment_service = EnvironmentService {
            persistence: Box::new(EnvironmentMemoryPersistence::default()),
            event_stream,
        };

        let nested = |conditions| Condition::Comparison {
            operator: ComparisonOperator::And,
            not: false,
            conditions,
        };

        let environment = Environment {
            resource_selector: Some(nested(vec![nested(vec![nested(vec![nested(vec![])])])])),
            ..get_environment_fixture(None)
        };

        let err = environment_service
            .upsert(&environment, &None)
            .await
            .unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::Validation(_)));
    }
}
