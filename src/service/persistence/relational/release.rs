use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::{collections::BTreeMap, sync::Arc};

use shipyard_core::Persistence;

use crate::{models::Release, persistence::ReleasePersistence};

#[derive(Debug)]
pub struct ReleaseRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    id: String,
    release_target_id: String,
    version_id: String,
    variables: Json<BTreeMap<String, serde_json::Value>>,
    created_at: DateTime<Utc>,
}

impl From<ReleaseRow> for Release {
    fn from(row: ReleaseRow) -> Self {
        Self {
            id: row.id,
            release_target_id: row.release_target_id,
            version_id: row.version_id,
            variables: row.variables.0,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl Persistence<Release> for ReleaseRelationalPersistence {
    #[tracing::instrument(name = "relational::release::upsert", skip_all)]
    async fn upsert(&self, release: &Release) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO releases
                    (id, release_target_id, version_id, variables, created_at)
                VALUES
                    ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&release.id)
        .bind(&release.release_target_id)
        .bind(&release.version_id)
        .bind(Json(&release.variables))
        .bind(release.created_at)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::release::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM releases WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::release::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Release>> {
        let row = sqlx::query_as::<_, ReleaseRow>("SELECT * FROM releases WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        Ok(row.map(Release::from))
    }

    #[tracing::instrument(name = "relational::release::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<Release>> {
        let rows = sqlx::query_as::<_, ReleaseRow>("SELECT * FROM releases")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(Release::from).collect())
    }
}

#[async_trait]
impl ReleasePersistence for ReleaseRelationalPersistence {
    #[tracing::instrument(name = "relational::release::get_latest", skip_all)]
    async fn get_latest(&self, release_target_id: &str) -> anyhow::Result<Option<Release>> {
        let row = sqlx::query_as::<_, ReleaseRow>(
            r#"
                SELECT * FROM releases WHERE release_target_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT 1
            "#,
        )
        .bind(release_target_id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(Release::from))
    }

    #[tracing::instrument(name = "relational::release::list_by_release_target", skip_all)]
    async fn list_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Release>> {
        let rows = sqlx::query_as::<_, ReleaseRow>(
            r#"
                SELECT * FROM releases WHERE release_target_id = $1
                ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(release_target_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Release::from).collect())
    }
}
