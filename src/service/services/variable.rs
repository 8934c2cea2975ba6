use shipyard_core::{
    create_event, make_dedup_key, EventStream, EventType, ModelType, OperationId,
};
use std::{collections::BTreeMap, sync::Arc};

use super::DeploymentService;
use crate::{
    errors::ServiceError,
    models::{DeploymentVariable, Resource},
    persistence::VariablePersistence,
};

#[derive(Debug)]
pub struct VariableService {
    pub persistence: Box<dyn VariablePersistence>,
    pub event_stream: Arc<dyn EventStream>,

    pub deployment_service: Arc<DeploymentService>,
}

impl VariableService {
    #[tracing::instrument(name = "service::variable::upsert", skip_all)]
    pub async fn upsert(
        &self,
        variable: &DeploymentVariable,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let deployment = match self
            .deployment_service
            .get_by_id(&variable.deployment_id)
            .await?
        {
            Some(deployment) => deployment,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "deployment {} not found: can't set variable {}",
                    variable.deployment_id, variable.key
                ))
                .into())
            }
        };

        for value in variable.values.iter() {
            if let Some(selector) = &value.resource_selector {
                selector
                    .validate()
                    .map_err(|err| ServiceError::Validation(err.to_string()))?;
            }
        }

        let duplicate = self
            .persistence
            .list_by_deployment(&variable.deployment_id)
            .await?
            .into_iter()
            .any(|existing| existing.key == variable.key && existing.id != variable.id);
        if duplicate {
            return Err(ServiceError::Conflict(format!(
                "deployment {} already has a variable named {}",
                variable.deployment_id, variable.key
            ))
            .into());
        }

        let previous = self.persistence.get_by_id(&variable.id).await?;
        let event_type = match previous {
            Some(_) => EventType::Updated,
            None => EventType::Created,
        };

        self.persistence.upsert(variable).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &previous,
            &Some(variable.clone()),
            event_type,
            ModelType::DeploymentVariable,
            &deployment.workspace_id,
            &operation_id,
        )?
        .with_dedup_key(make_dedup_key(ModelType::DeploymentVariable, &variable.id));

        self.event_stream.send(&event).await?;

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::variable::list_by_deployment", skip_all)]
    pub async fn list_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVariable>> {
        self.persistence.list_by_deployment(deployment_id).await
    }

    /// Resolves the variable set a release of `deployment_id` on `resource` carries.
    ///
    /// A variable the resource itself defines wins. Otherwise the highest priority value
    /// whose selector matches the resource is used, then the default. Keys with no
    /// applicable value are left out.
    #[tracing::instrument(name = "service::variable::resolve", skip_all)]
    pub async fn resolve(
        &self,
        deployment_id: &str,
        resource: &Resource,
    ) -> anyhow::Result<BTreeMap<String, serde_json::Value>> {
        let variables = self.persistence.list_by_deployment(deployment_id).await?;

        Ok(variables
            .into_iter()
            .filter_map(|variable| {
                let value = resolve_variable(&variable, resource)?;
                Some((variable.key, value))
            })
            .collect())
    }
}

fn resolve_variable(
    variable: &DeploymentVariable,
    resource: &Resource,
) -> Option<serde_json::Value> {
    if let Some(value) = resource.variables.get(&variable.key) {
        return Some(value.clone());
    }

    let mut matching: Vec<_> = variable
        .values
        .iter()
        .filter(|value| match &value.resource_selector {
            Some(selector) => selector.matches(resource),
            None => false,
        })
        .collect();
    matching.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    match matching.first() {
        Some(value) => Some(value.value.clone()),
        None => variable.default_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::VariableValue,
        persistence::memory::{DeploymentMemoryPersistence, VariableMemoryPersistence},
        test::{get_deployment_fixture, get_resource_fixture, get_variable_fixture},
    };
    use serde_json::json;
    use shipyard_core::Condition;
    use shipyard_memory_stream::MemoryEventStream;

    async fn variable_service() -> VariableService {
        let event_stream = Arc::new(MemoryEventStream::new().unwrap()) as Arc<dyn EventStream>;
        let deployment_service = Arc::new(DeploymentService {
            persistence: Box::new(DeploymentMemoryPersistence::default()),
            event_stream: Arc::clone(&event_stream),
        });
        deployment_service
            .upsert(&get_deployment_fixture(None), &None)
            .await
            .unwrap();

        VariableService {
            persistence: Box::new(VariableMemoryPersistence::default()),
            event_stream,
            deployment_service,
        }
    }

    #[tokio::test]
    async fn test_resolve_precedence() {
        let variable_service = variable_service().await;

        let mut replicas = get_variable_fixture(Some("replicas"));
        replicas.values.push(VariableValue {
            id: "replicas-clusters".to_owned(),
            value: json!(5),
            resource_selector: Some(Condition::Kind {
                value: "Kubernetes".to_owned(),
            }),
            priority: 20,
        });
        variable_service.upsert(&replicas, &None).await.unwrap();

        let image = DeploymentVariable {
            id: "variable-image".to_owned(),
            key: "image".to_owned(),
            default_value: None,
            values: vec![VariableValue {
                id: "image-unselected".to_owned(),
                value: json!("nginx"),
                resource_selector: None,
                priority: 100,
            }],
            ..get_variable_fixture(None)
        };
        variable_service.upsert(&image, &None).await.unwrap();

        let mut resource = get_resource_fixture(None);
        let resolved = variable_service
            .resolve(&replicas.deployment_id, &resource)
            .await
            .unwrap();
        assert_eq!(resolved.get("replicas"), Some(&json!(5)));
        assert!(!resolved.contains_key("image"));

        resource.variables.insert("replicas".to_owned(), json!(7));
        let resolved = variable_service
            .resolve(&replicas.deployment_id, &resource)
            .await
            .unwrap();
        assert_eq!(resolved.get("replicas"), Some(&json!(7)));

        resource.variables.clear();
        resource.kind = "vm".to_owned();
        resource.metadata.clear();
        let resolved = variable_service
            .resolve(&replicas.deployment_id, &resource)
            .await
            .unwrap();
        assert_eq!(resolved.get("replicas"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_upsert_rejects_duplicate_key() {
        let variable_service = variable_service().await;
        let variable = get_variable_fixture(None);
        variable_service.upsert(&variable, &None).await.unwrap();

        let duplicate = DeploymentVariable {
            id: "variable-other".to_owned(),
            ..variable
        };
        let err = variable_service.upsert(&duplicate, &None).await.unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::Conflict(_)));
    }
}
