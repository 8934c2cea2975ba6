use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

use shipyard_core::LockOutcome;

use crate::{
    models::{MembershipKind, MembershipScope},
    persistence::MembershipPersistence,
};

#[derive(Debug)]
pub struct MembershipRelationalPersistence {
    pub db: Arc<PgPool>,
}

fn table_name(kind: MembershipKind) -> &'static str {
    match kind {
        MembershipKind::Environment => "computed_environment_resources",
        MembershipKind::Deployment => "computed_deployment_resources",
        MembershipKind::PolicyTarget => "computed_policy_target_release_targets",
    }
}

#[async_trait]
impl MembershipPersistence for MembershipRelationalPersistence {
    #[tracing::instrument(name = "relational::membership::replace", skip_all)]
    async fn replace(
        &self,
        scope: &MembershipScope,
        entity_ids: &[String],
    ) -> anyhow::Result<LockOutcome<u64>> {
        let mut tx = self.db.begin().await?;

        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(scope.lock_key())
            .fetch_one(&mut tx)
            .await?;

        if !acquired {
            tx.rollback().await?;
            return Ok(LockOutcome::Contended);
        }

        let table = table_name(scope.kind);

        sqlx::query(&format!("DELETE FROM {} WHERE owner_id = $1", table))
            .bind(&scope.owner_id)
            .execute(&mut tx)
            .await?;

        let result = sqlx::query(&format!(
            "INSERT INTO {} (owner_id, entity_id) SELECT $1, UNNEST($2::text[]) ON CONFLICT DO NOTHING",
            table
        ))
        .bind(&scope.owner_id)
        .bind(entity_ids)
        .execute(&mut tx)
        .await?;

        tx.commit().await?;

        Ok(LockOutcome::Acquired(result.rows_affected()))
    }

    #[tracing::instrument(name = "relational::membership::list_entities", skip_all)]
    async fn list_entities(&self, scope: &MembershipScope) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT entity_id FROM {} WHERE owner_id = $1 ORDER BY entity_id",
            table_name(scope.kind)
        ))
        .bind(&scope.owner_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(|(entity_id,)| entity_id).collect())
    }

    #[tracing::instrument(name = "relational::membership::list_owners", skip_all)]
    async fn list_owners(
        &self,
        kind: MembershipKind,
        entity_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT owner_id FROM {} WHERE entity_id = $1 ORDER BY owner_id",
            table_name(kind)
        ))
        .bind(entity_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(|(owner_id,)| owner_id).collect())
    }

    #[tracing::instrument(name = "relational::membership::delete_entity", skip_all)]
    async fn delete_entity(&self, kind: MembershipKind, entity_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE entity_id = $1",
            table_name(kind)
        ))
        .bind(entity_id)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }
}
