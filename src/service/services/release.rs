use chrono::{Duration, Utc};
use shipyard_core::{create_event, EventStream, EventType, ModelType, OperationId};
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

use crate::{
    models::{Release, ReleaseTarget},
    persistence::ReleasePersistence,
};

#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseUpsert {
    pub created: bool,
    pub release: Release,
}

#[derive(Debug)]
pub struct ReleaseService {
    pub persistence: Box<dyn ReleasePersistence>,
    pub event_stream: Arc<dyn EventStream>,
}

impl ReleaseService {
    /// Returns the latest release of the target when it already carries `version_id` and
    /// `variables`; otherwise appends a new release.
    #[tracing::instrument(name = "service::release::upsert_release", skip_all)]
    pub async fn upsert_release(
        &self,
        release_target: &ReleaseTarget,
        version_id: &str,
        variables: &BTreeMap<String, serde_json::Value>,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<ReleaseUpsert> {
        let latest = self.persistence.get_latest(&release_target.id).await?;

        if let Some(latest) = &latest {
            if latest.is_equivalent(version_id, variables) {
                return Ok(ReleaseUpsert {
                    created: false,
                    release: latest.clone(),
                });
            }
        }

        let mut created_at = Utc::now();
        if let Some(latest) = &latest {
            if created_at <= latest.created_at {
                created_at = latest.created_at + Duration::microseconds(1);
            }
        }

        let release = Release {
            id: Uuid::new_v4().to_string(),
            release_target_id: release_target.id.clone(),
            version_id: version_id.to_string(),
            variables: variables.clone(),
            created_at,
        };

        self.persistence.upsert(&release).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &None,
            &Some(release.clone()),
            EventType::Created,
            ModelType::Release,
            &release_target.workspace_id,
            &operation_id,
        )?;
        self.event_stream.send(&event).await?;

        tracing::info!(
            "release {} created for target {} at version {}",
            release.id,
            release_target.id,
            version_id
        );

        Ok(ReleaseUpsert {
            created: true,
            release,
        })
    }

    #[tracing::instrument(name = "service::release::get_by_id", skip_all)]
    pub async fn get_by_id(&self, release_id: &str) -> anyhow::Result<Option<Release>> {
        self.persistence.get_by_id(release_id).await
    }

    #[tracing::instrument(name = "service::release::get_latest", skip_all)]
    pub async fn get_latest(&self, release_target_id: &str) -> anyhow::Result<Option<Release>> {
        self.persistence.get_latest(release_target_id).await
    }

    pub async fn list_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Release>> {
        self.persistence
            .list_by_release_target(release_target_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{persistence::memory::ReleaseMemoryPersistence, test::get_release_target_fixture};
    use serde_json::json;
    use shipyard_memory_stream::MemoryEventStream;

    #[tokio::test]
    async fn test_upsert_release_is_idempotent() {
        let release_service = ReleaseService {
            persistence: Box::new(ReleaseMemoryPersistence::default()),
            event_stream: Arc::new(MemoryEventStream::new().unwrap()),
        };
        let release_target = get_release_target_fixture(None);
        let variables = BTreeMap::from([("replicas".to_owned(), json!(3))]);

        let first = release_service
            .upsert_release(&release_target, "version-1", &variables, &None)
            .await
            .unwrap();
        assert!(first.created);

        let second = release_service
            .upsert_release(&release_target, "version-1", &variables, &None)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.release.id, first.release.id);

        let changed = BTreeMap::from([("replicas".to_owned(), json!(4))]);
        let third = release_service
            .upsert_release(&release_target, "version-1", &changed, &None)
            .await
            .unwrap();
        assert!(third.created);

        let latest = release_service
            .get_latest(&release_target.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, third.release.id);

        let releases = release_service
            .list_by_release_target(&release_target.id)
            .await
            .unwrap();
        assert_eq!(releases.len(), 2);
    }
}
