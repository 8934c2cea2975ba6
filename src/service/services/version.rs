use shipyard_core::{
    create_event, make_dedup_key, EventStream, EventType, ModelType, OperationId,
};
use std::sync::Arc;

use super::DeploymentService;
use crate::{
    errors::ServiceError,
    models::{DeploymentVersion, VersionStatus},
    persistence::VersionPersistence,
};

#[derive(Debug)]
pub struct VersionService {
    pub persistence: Box<dyn VersionPersistence>,
    pub event_stream: Arc<dyn EventStream>,

    pub deployment_service: Arc<DeploymentService>,
}

impl VersionService {
    /// Registers a new version. Tags are unique per deployment and versions are immutable
    /// apart from their status.
    #[tracing::instrument(name = "service::version::create", skip_all)]
    pub async fn create(
        &self,
        version: &DeploymentVersion,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let deployment = match self
            .deployment_service
            .get_by_id(&version.deployment_id)
            .await?
        {
            Some(deployment) => deployment,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "deployment {} not found: can't create version {}",
                    version.deployment_id, version.tag
                ))
                .into())
            }
        };

        for dependency in version.dependencies.iter() {
            if dependency.deployment_id == version.deployment_id {
                return Err(ServiceError::Validation(format!(
                    "version {} cannot depend on its own deployment",
                    version.tag
                ))
                .into());
            }

            dependency
                .version_selector
                .validate()
                .map_err(|err| ServiceError::Validation(err.to_string()))?;
        }

        if self
            .persistence
            .get_by_tag(&version.deployment_id, &version.tag)
            .await?
            .is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "deployment {} already has a version tagged {}",
                version.deployment_id, version.tag
            ))
            .into());
        }

        // Newest-first ordering relies on strictly increasing creation times.
        let latest = self
            .persistence
            .list_ready_by_deployment(&version.deployment_id)
            .await?
            .into_iter()
            .next();
        let mut version = version.clone();
        if let Some(latest) = latest {
            if version.created_at <= latest.created_at {
                version.created_at = latest.created_at + chrono::Duration::microseconds(1);
            }
        }

        self.persistence.upsert(&version).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &None,
            &Some(version.clone()),
            EventType::Created,
            ModelType::DeploymentVersion,
            &deployment.workspace_id,
            &operation_id,
        )?
        .with_dedup_key(make_dedup_key(ModelType::DeploymentVersion, &version.id));

        self.event_stream.send(&event).await?;

        tracing::info!(
            "version {} created for deployment {}",
            version.tag,
            version.deployment_id
        );

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::version::set_status", skip_all)]
    pub async fn set_status(
        &self,
        version_id: &str,
        status: VersionStatus,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let previous = match self.get_by_id(version_id).await? {
            Some(version) => version,
            None => {
                return Err(
                    ServiceError::NotFound(format!("version {} not found", version_id)).into(),
                )
            }
        };

        let deployment = self
            .deployment_service
            .get_by_id(&previous.deployment_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "deployment {} of version {} not found",
                    previous.deployment_id,
                    version_id
                )
            })?;

        let version = DeploymentVersion {
            status,
            ..previous.clone()
        };
        self.persistence.upsert(&version).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &Some(previous),
            &Some(version.clone()),
            EventType::Updated,
            ModelType::DeploymentVersion,
            &deployment.workspace_id,
            &operation_id,
        )?
        .with_dedup_key(make_dedup_key(ModelType::DeploymentVersion, &version.id));

        self.event_stream.send(&event).await?;

        tracing::info!("version {} is now {}", version_id, status);

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::version::get_by_id", skip_all)]
    pub async fn get_by_id(&self, version_id: &str) -> anyhow::Result<Option<DeploymentVersion>> {
        self.persistence.get_by_id(version_id).await
    }

    #[tracing::instrument(name = "service::version::get_by_tag", skip_all)]
    pub async fn get_by_tag(
        &self,
        deployment_id: &str,
        tag: &str,
    ) -> anyhow::Result<Option<DeploymentVersion>> {
        self.persistence.get_by_tag(deployment_id, tag).await
    }

    #[tracing::instrument(name = "service::version::list_ready_by_deployment", skip_all)]
    pub async fn list_ready_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        self.persistence
            .list_ready_by_deployment(deployment_id)
            .await
    }

    #[tracing::instrument(name = "service::version::list_depending_on", skip_all)]
    pub async fn list_depending_on(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        self.persistence.list_depending_on(deployment_id).await
    }
}
