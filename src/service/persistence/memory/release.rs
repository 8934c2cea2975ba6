use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use super::MemoryPersistence;
use crate::{
    models::{ApprovalRecord, Release, ReleaseTarget, ReleaseTargetLock},
    persistence::{
        ApprovalPersistence, LockPersistence, ReleasePersistence, ReleaseTargetPersistence,
    },
};

#[async_trait]
impl ReleaseTargetPersistence for MemoryPersistence<ReleaseTarget> {
    async fn list_by_resource_ids(
        &self,
        resource_ids: &[String],
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.filter(|release_target| resource_ids.contains(&release_target.resource_id))
    }

    async fn list_by_deployment(&self, deployment_id: &str) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.filter(|release_target| release_target.deployment_id == deployment_id)
    }

    async fn list_by_environment(
        &self,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.filter(|release_target| release_target.environment_id == environment_id)
    }

    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.filter(|release_target| release_target.workspace_id == workspace_id)
    }

    async fn get_by_triple(
        &self,
        resource_id: &str,
        environment_id: &str,
        deployment_id: &str,
    ) -> anyhow::Result<Option<ReleaseTarget>> {
        let release_targets = self.filter(|release_target| {
            release_target.resource_id == resource_id
                && release_target.environment_id == environment_id
                && release_target.deployment_id == deployment_id
        })?;

        Ok(release_targets.into_iter().next())
    }

    async fn apply_changes(
        &self,
        created: &[ReleaseTarget],
        deleted_ids: &[String],
    ) -> anyhow::Result<u64> {
        let mut locked_release_targets = self.get_models_locked()?;

        let existing_triples: HashSet<(String, String, String)> = locked_release_targets
            .values()
            .map(|release_target| release_target.triple())
            .collect();

        let mut affected_count = 0;
        for release_target_id in deleted_ids {
            if locked_release_targets.remove(release_target_id).is_some() {
                affected_count += 1;
            }
        }

        for release_target in created {
            if existing_triples.contains(&release_target.triple()) {
                continue;
            }

            locked_release_targets.insert(release_target.id.clone(), release_target.clone());
            affected_count += 1;
        }

        Ok(affected_count)
    }
}

#[async_trait]
impl ReleasePersistence for MemoryPersistence<Release> {
    async fn get_latest(&self, release_target_id: &str) -> anyhow::Result<Option<Release>> {
        let releases = self.list_by_release_target(release_target_id).await?;

        Ok(releases.into_iter().next())
    }

    async fn list_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Release>> {
        let mut releases =
            self.filter(|release| release.release_target_id == release_target_id)?;

        releases.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        Ok(releases)
    }
}

#[async_trait]
impl ApprovalPersistence for MemoryPersistence<ApprovalRecord> {
    async fn list_by_version_and_environment(
        &self,
        deployment_version_id: &str,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ApprovalRecord>> {
        self.filter(|record| {
            record.deployment_version_id == deployment_version_id
                && record.environment_id == environment_id
        })
    }
}

#[async_trait]
impl LockPersistence for MemoryPersistence<ReleaseTargetLock> {
    async fn get_active(
        &self,
        release_target_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ReleaseTargetLock>> {
        let locks = self
            .filter(|lock| lock.release_target_id == release_target_id && lock.is_active(now))?;

        Ok(locks.into_iter().next())
    }

    async fn delete_by_release_target(&self, release_target_id: &str) -> anyhow::Result<u64> {
        let mut locked_locks = self.get_models_locked()?;

        let starting_len = locked_locks.len();
        locked_locks.retain(|_, lock| lock.release_target_id != release_target_id);

        Ok((starting_len - locked_locks.len()) as u64)
    }
}
