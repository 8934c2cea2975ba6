use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use shipyard_core::Persistence;

use crate::{models::ReleaseTarget, persistence::ReleaseTargetPersistence};

#[derive(Debug)]
pub struct ReleaseTargetRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct ReleaseTargetRow {
    id: String,
    workspace_id: String,
    resource_id: String,
    environment_id: String,
    deployment_id: String,
    desired_version_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<ReleaseTargetRow> for ReleaseTarget {
    fn from(row: ReleaseTargetRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            resource_id: row.resource_id,
            environment_id: row.environment_id,
            deployment_id: row.deployment_id,
            desired_version_id: row.desired_version_id,
            created_at: row.created_at,
        }
    }
}

const INSERT_RELEASE_TARGET: &str = r#"
    INSERT INTO release_targets
        (id, workspace_id, resource_id, environment_id, deployment_id, desired_version_id,
         created_at)
    VALUES
        ($1, $2, $3, $4, $5, $6, $7)
"#;

#[async_trait]
impl Persistence<ReleaseTarget> for ReleaseTargetRelationalPersistence {
    #[tracing::instrument(name = "relational::release_target::upsert", skip_all)]
    async fn upsert(&self, release_target: &ReleaseTarget) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            "{} ON CONFLICT (id) DO UPDATE SET desired_version_id = $6",
            INSERT_RELEASE_TARGET
        ))
        .bind(&release_target.id)
        .bind(&release_target.workspace_id)
        .bind(&release_target.resource_id)
        .bind(&release_target.environment_id)
        .bind(&release_target.deployment_id)
        .bind(&release_target.desired_version_id)
        .bind(release_target.created_at)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::release_target::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM release_targets WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::release_target::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<ReleaseTarget>> {
        let row =
            sqlx::query_as::<_, ReleaseTargetRow>("SELECT * FROM release_targets WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?;

        Ok(row.map(ReleaseTarget::from))
    }

    #[tracing::instrument(name = "relational::release_target::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<ReleaseTarget>> {
        let rows = sqlx::query_as::<_, ReleaseTargetRow>("SELECT * FROM release_targets")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(ReleaseTarget::from).collect())
    }
}

#[async_trait]
impl ReleaseTargetPersistence for ReleaseTargetRelationalPersistence {
    #[tracing::instrument(name = "relational::release_target::list_by_resource_ids", skip_all)]
    async fn list_by_resource_ids(
        &self,
        resource_ids: &[String],
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        let rows = sqlx::query_as::<_, ReleaseTargetRow>(
            "SELECT * FROM release_targets WHERE resource_id = ANY($1)",
        )
        .bind(resource_ids)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(ReleaseTarget::from).collect())
    }

    #[tracing::instrument(name = "relational::release_target::list_by_deployment", skip_all)]
    async fn list_by_deployment(&self, deployment_id: &str) -> anyhow::Result<Vec<ReleaseTarget>> {
        let rows = sqlx::query_as::<_, ReleaseTargetRow>(
            "SELECT * FROM release_targets WHERE deployment_id = $1",
        )
        .bind(deployment_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(ReleaseTarget::from).collect())
    }

    #[tracing::instrument(name = "relational::release_target::list_by_environment", skip_all)]
    async fn list_by_environment(
        &self,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        let rows = sqlx::query_as::<_, ReleaseTargetRow>(
            "SELECT * FROM release_targets WHERE environment_id = $1",
        )
        .bind(environment_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(ReleaseTarget::from).collect())
    }

    #[tracing::instrument(name = "relational::release_target::list_by_workspace", skip_all)]
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<ReleaseTarget>> {
        let rows = sqlx::query_as::<_, ReleaseTargetRow>(
            "SELECT * FROM release_targets WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(ReleaseTarget::from).collect())
    }

    #[tracing::instrument(name = "relational::release_target::get_by_triple", skip_all)]
    async fn get_by_triple(
        &self,
        resource_id: &str,
        environment_id: &str,
        deployment_id: &str,
    ) -> anyhow::Result<Option<ReleaseTarget>> {
        let row = sqlx::query_as::<_, ReleaseTargetRow>(
            r#"
                SELECT * FROM release_targets
                WHERE resource_id = $1 AND environment_id = $2 AND deployment_id = $3
            "#,
        )
        .bind(resource_id)
        .bind(environment_id)
        .bind(deployment_id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(ReleaseTarget::from))
    }

    #[tracing::instrument(name = "relational::release_target::apply_changes", skip_all)]
    async fn apply_changes(
        &self,
        created: &[ReleaseTarget],
        deleted_ids: &[String],
    ) -> anyhow::Result<u64> {
        let mut tx = self.db.begin().await?;

        let deleted = sqlx::query("DELETE FROM release_targets WHERE id = ANY($1)")
            .bind(deleted_ids)
            .execute(&mut tx)
            .await?;

        let mut affected_count = deleted.rows_affected();

        let insert = format!(
            "{} ON CONFLICT (resource_id, environment_id, deployment_id) DO NOTHING",
            INSERT_RELEASE_TARGET
        );
        for release_target in created {
            let result = sqlx::query(&insert)
                .bind(&release_target.id)
                .bind(&release_target.workspace_id)
                .bind(&release_target.resource_id)
                .bind(&release_target.environment_id)
                .bind(&release_target.deployment_id)
                .bind(&release_target.desired_version_id)
                .bind(release_target.created_at)
                .execute(&mut tx)
                .await?;

            affected_count += result.rows_affected();
        }

        tx.commit().await?;

        Ok(affected_count)
    }
}
