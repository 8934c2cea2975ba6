use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::sync::Arc;

use shipyard_core::Persistence;

use crate::{models::ApprovalRecord, persistence::ApprovalPersistence};

#[derive(Debug)]
pub struct ApprovalRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    deployment_version_id: String,
    environment_id: String,
    user_id: String,
    role_ids: Json<Vec<String>>,
    status: String,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ApprovalRow> for ApprovalRecord {
    type Error = anyhow::Error;

    fn try_from(row: ApprovalRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.id,
            deployment_version_id: row.deployment_version_id,
            environment_id: row.environment_id,
            user_id: row.user_id,
            role_ids: row.role_ids.0,
            status: row.status.parse()?,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl Persistence<ApprovalRecord> for ApprovalRelationalPersistence {
    #[tracing::instrument(name = "relational::approval::upsert", skip_all)]
    async fn upsert(&self, record: &ApprovalRecord) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO approval_records
                    (id, deployment_version_id, environment_id, user_id, role_ids, status,
                     reason, created_at)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (deployment_version_id, environment_id, user_id) DO UPDATE SET
                    role_ids = $5,
                    status = $6,
                    reason = $7,
                    created_at = $8
            "#,
        )
        .bind(&record.id)
        .bind(&record.deployment_version_id)
        .bind(&record.environment_id)
        .bind(&record.user_id)
        .bind(Json(&record.role_ids))
        .bind(record.status.as_str())
        .bind(&record.reason)
        .bind(record.created_at)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::approval::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM approval_records WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::approval::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<ApprovalRecord>> {
        let row = sqlx::query_as::<_, ApprovalRow>("SELECT * FROM approval_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        row.map(ApprovalRecord::try_from).transpose()
    }

    #[tracing::instrument(name = "relational::approval::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<ApprovalRecord>> {
        let rows = sqlx::query_as::<_, ApprovalRow>("SELECT * FROM approval_records")
            .fetch_all(&*self.db)
            .await?;

        rows.into_iter().map(ApprovalRecord::try_from).collect()
    }
}

#[async_trait]
impl ApprovalPersistence for ApprovalRelationalPersistence {
    #[tracing::instrument(name = "relational::approval::list_by_version_and_environment", skip_all)]
    async fn list_by_version_and_environment(
        &self,
        deployment_version_id: &str,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ApprovalRecord>> {
        let rows = sqlx::query_as::<_, ApprovalRow>(
            r#"
                SELECT * FROM approval_records
                WHERE deployment_version_id = $1 AND environment_id = $2
            "#,
        )
        .bind(deployment_version_id)
        .bind(environment_id)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(ApprovalRecord::try_from).collect()
    }
}
