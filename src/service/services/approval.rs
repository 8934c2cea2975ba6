use chrono::Utc;
use shipyard_core::{create_event, EventStream, EventType, ModelType, OperationId};
use std::sync::Arc;

use super::{EnvironmentService, ReleaseTargetService, VersionService};
use crate::{
    errors::ServiceError,
    models::{ApprovalRecord, ApprovalStatus, ReleaseTarget},
    persistence::ApprovalPersistence,
};

/// An approval decision made by a principal.
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalDecision {
    pub user_id: String,
    pub role_ids: Vec<String>,
    pub status: ApprovalStatus,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub struct ApprovalService {
    pub persistence: Box<dyn ApprovalPersistence>,
    pub event_stream: Arc<dyn EventStream>,

    pub environment_service: Arc<EnvironmentService>,
    pub release_target_service: Arc<ReleaseTargetService>,
    pub version_service: Arc<VersionService>,
}

impl ApprovalService {
    /// Records a decision on a version for an environment and re-evaluates the release
    /// targets it gates. A later decision by the same user replaces the earlier one.
    #[tracing::instrument(name = "service::approval::record", skip_all)]
    pub async fn record(
        &self,
        deployment_version_id: &str,
        environment_id: &str,
        decision: &ApprovalDecision,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<ApprovalRecord> {
        let version = match self.version_service.get_by_id(deployment_version_id).await? {
            Some(version) => version,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "version {} not found",
                    deployment_version_id
                ))
                .into())
            }
        };

        let environment = match self.environment_service.get_by_id(environment_id).await? {
            Some(environment) => environment,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "environment {} not found",
                    environment_id
                ))
                .into())
            }
        };

        let record = ApprovalRecord {
            id: ApprovalRecord::make_id(&version.id, &environment.id, &decision.user_id),
            deployment_version_id: version.id.clone(),
            environment_id: environment.id.clone(),
            user_id: decision.user_id.clone(),
            role_ids: decision.role_ids.clone(),
            status: decision.status,
            reason: decision.reason.clone(),
            created_at: Utc::now(),
        };

        let previous = self.persistence.get_by_id(&record.id).await?;
        let event_type = match previous {
            Some(_) => EventType::Updated,
            None => EventType::Created,
        };

        self.persistence.upsert(&record).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &previous,
            &Some(record.clone()),
            event_type,
            ModelType::Approval,
            &environment.workspace_id,
            &operation_id,
        )?;
        self.event_stream.send(&event).await?;

        let gated: Vec<ReleaseTarget> = self
            .release_target_service
            .list_by_environment(&environment.id)
            .await?
            .into_iter()
            .filter(|release_target| release_target.deployment_id == version.deployment_id)
            .collect();

        self.release_target_service
            .enqueue_evaluations(&gated, &Some(operation_id))
            .await?;

        tracing::info!(
            "version {} {} for environment {} by {}",
            version.tag,
            record.status,
            environment.id,
            record.user_id
        );

        Ok(record)
    }

    #[tracing::instrument(name = "service::approval::list_by_version_and_environment", skip_all)]
    pub async fn list_by_version_and_environment(
        &self,
        deployment_version_id: &str,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ApprovalRecord>> {
        self.persistence
            .list_by_version_and_environment(deployment_version_id, environment_id)
            .await
    }
}
