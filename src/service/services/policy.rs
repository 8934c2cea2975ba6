use shipyard_core::{
    create_event, make_dedup_key, EventStream, EventType, ModelType, OperationId,
};
use std::sync::Arc;

use crate::{errors::ServiceError, models::Policy, persistence::PolicyPersistence};

#[derive(Debug)]
pub struct PolicyService {
    pub persistence: Box<dyn PolicyPersistence>,
    pub event_stream: Arc<dyn EventStream>,
}

impl PolicyService {
    #[tracing::instrument(name = "service::policy::upsert", skip_all)]
    pub async fn upsert(
        &self,
        policy: &Policy,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        policy
            .validate()
            .map_err(|err| ServiceError::Validation(err.to_string()))?;

        let previous = self.persistence.get_by_id(&policy.id).await?;
        let event_type = match previous {
            Some(_) => EventType::Updated,
            None => EventType::Created,
        };

        self.persistence.upsert(policy).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &previous,
            &Some(policy.clone()),
            event_type,
            ModelType::Policy,
            &policy.workspace_id,
            &operation_id,
        )?
        .with_dedup_key(make_dedup_key(ModelType::Policy, &policy.id));

        self.event_stream.send(&event).await?;

        tracing::info!("policy {} {}", policy.id, event_type.as_str());

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::policy::delete", skip_all)]
    pub async fn delete(
        &self,
        policy_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let policy = match self.get_by_id(policy_id).await? {
            Some(policy) => policy,
            None => {
                return Err(ServiceError::NotFound(format!("policy {} not found", policy_id)).into())
            }
        };

        self.persistence.delete(policy_id).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &Some(policy.clone()),
            &None,
            EventType::Deleted,
            ModelType::Policy,
            &policy.workspace_id,
            &operation_id,
        )?;

        self.event_stream.send(&event).await?;

        tracing::info!("policy {} deleted", policy_id);

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::policy::get_by_id", skip_all)]
    pub async fn get_by_id(&self, policy_id: &str) -> anyhow::Result<Option<Policy>> {
        self.persistence.get_by_id(policy_id).await
    }

    #[tracing::instrument(name = "service::policy::list_by_workspace", skip_all)]
    pub async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Policy>> {
        self.persistence.list_by_workspace(workspace_id).await
    }

    /// Enabled policies owning any of the given targets, highest priority first.
    #[tracing::instrument(name = "service::policy::list_enabled_by_target_ids", skip_all)]
    pub async fn list_enabled_by_target_ids(
        &self,
        policy_target_ids: &[String],
    ) -> anyhow::Result<Vec<Policy>> {
        if policy_target_ids.is_empty() {
            return Ok(vec![]);
        }

        let mut policies: Vec<Policy> = self
            .persistence
            .list_by_target_ids(policy_target_ids)
            .await?
            .into_iter()
            .filter(|policy| policy.enabled)
            .collect();
        Policy::sort_by_priority(&mut policies);

        Ok(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{DenyWindow, Policy},
        persistence::memory::PolicyMemoryPersistence,
        test::get_policy_fixture,
    };
    use chrono::{Duration, Utc};
    use shipyard_memory_stream::MemoryEventStream;

    fn policy_service() -> PolicyService {
        PolicyService {
            persistence: Box::new(PolicyMemoryPersistence::default()),
            event_stream: Arc::new(MemoryEventStream::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_enabled_policies_by_priority() {
        let policy_service = policy_service();

        let low = get_policy_fixture(Some("low"));
        let high = Policy {
            priority: 10,
            ..get_policy_fixture(Some("high"))
        };
        let disabled = Policy {
            enabled: false,
            priority: 100,
            ..get_policy_fixture(Some("disabled"))
        };

        for policy in [&low, &high, &disabled] {
            policy_service.upsert(policy, &None).await.unwrap();
        }

        let target_ids: Vec<String> = [&low, &high, &disabled]
            .iter()
            .map(|policy| policy.targets[0].id.clone())
            .collect();

        let policies = policy_service
            .list_enabled_by_target_ids(&target_ids)
            .await
            .unwrap();
        let ids: Vec<&str> = policies.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_upsert_rejects_inverted_deny_window() {
        let policy_service = policy_service();
        let now = Utc::now();

        let policy = Policy {
            deny_windows: vec![DenyWindow {
                name: "backwards".to_owned(),
                starts_at: now,
                ends_at: now - Duration::hours(1),
                recurrence: None,
            }],
            ..get_policy_fixture(None)
        };

        let err = policy_service.upsert(&policy, &None).await.unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::Validation(_)));
    }
}
