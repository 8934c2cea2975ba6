use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;

use shipyard_core::Persistence;

use crate::{models::ReleaseTargetLock, persistence::LockPersistence};

#[derive(Debug)]
pub struct LockRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct LockRow {
    id: String,
    release_target_id: String,
    locked_by: String,
    locked_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    unlocked_at: Option<DateTime<Utc>>,
    unlocked_by: Option<String>,
}

impl From<LockRow> for ReleaseTargetLock {
    fn from(row: LockRow) -> Self {
        Self {
            id: row.id,
            release_target_id: row.release_target_id,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            expires_at: row.expires_at,
            unlocked_at: row.unlocked_at,
            unlocked_by: row.unlocked_by,
        }
    }
}

#[async_trait]
impl Persistence<ReleaseTargetLock> for LockRelationalPersistence {
    #[tracing::instrument(name = "relational::lock::upsert", skip_all)]
    async fn upsert(&self, lock: &ReleaseTargetLock) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO release_target_locks
                    (id, release_target_id, locked_by, locked_at, expires_at, unlocked_at,
                     unlocked_by)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET
                    expires_at = $5,
                    unlocked_at = $6,
                    unlocked_by = $7
            "#,
        )
        .bind(&lock.id)
        .bind(&lock.release_target_id)
        .bind(&lock.locked_by)
        .bind(lock.locked_at)
        .bind(lock.expires_at)
        .bind(lock.unlocked_at)
        .bind(&lock.unlocked_by)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::lock::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM release_target_locks WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::lock::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<ReleaseTargetLock>> {
        let row = sqlx::query_as::<_, LockRow>("SELECT * FROM release_target_locks WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        Ok(row.map(ReleaseTargetLock::from))
    }

    #[tracing::instrument(name = "relational::lock::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<ReleaseTargetLock>> {
        let rows = sqlx::query_as::<_, LockRow>("SELECT * FROM release_target_locks")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(ReleaseTargetLock::from).collect())
    }
}

#[async_trait]
impl LockPersistence for LockRelationalPersistence {
    #[tracing::instrument(name = "relational::lock::get_active", skip_all)]
    async fn get_active(
        &self,
        release_target_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ReleaseTargetLock>> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
                SELECT * FROM release_target_locks
                WHERE release_target_id = $1
                  AND unlocked_at IS NULL
                  AND (expires_at IS NULL OR expires_at > $2)
                ORDER BY locked_at DESC
                LIMIT 1
            "#,
        )
        .bind(release_target_id)
        .bind(now)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(ReleaseTargetLock::from))
    }

    #[tracing::instrument(name = "relational::lock::delete_by_release_target", skip_all)]
    async fn delete_by_release_target(&self, release_target_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM release_target_locks WHERE release_target_id = $1")
            .bind(release_target_id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
