use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::{collections::HashMap, sync::Arc};

use shipyard_core::{Condition, Persistence};

use crate::{
    models::{
        ApprovalRequirements, DenyWindow, Policy, PolicyTarget, ReleaseSequencing, RetryRule,
        RolloutRule,
    },
    persistence::PolicyPersistence,
};

#[derive(Debug)]
pub struct PolicyRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: String,
    workspace_id: String,
    name: String,
    priority: i32,
    enabled: bool,
    deny_windows: Json<Vec<DenyWindow>>,
    version_selector: Option<Json<Condition>>,
    approvals: Option<Json<ApprovalRequirements>>,
    rollout: Option<Json<RolloutRule>>,
    sequencing: Option<String>,
    retry: Option<Json<RetryRule>>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PolicyTargetRow {
    id: String,
    policy_id: String,
    resource_selector: Option<Json<Condition>>,
    deployment_selector: Option<Json<Condition>>,
    environment_selector: Option<Json<Condition>>,
}

impl From<PolicyTargetRow> for PolicyTarget {
    fn from(row: PolicyTargetRow) -> Self {
        Self {
            id: row.id,
            policy_id: row.policy_id,
            resource_selector: row.resource_selector.map(|selector| selector.0),
            deployment_selector: row.deployment_selector.map(|selector| selector.0),
            environment_selector: row.environment_selector.map(|selector| selector.0),
        }
    }
}

fn sequencing_as_str(sequencing: &ReleaseSequencing) -> &'static str {
    match sequencing {
        ReleaseSequencing::Wait => "wait",
        ReleaseSequencing::Cancel => "cancel",
    }
}

fn parse_sequencing(sequencing: &str) -> anyhow::Result<ReleaseSequencing> {
    match sequencing {
        "wait" => Ok(ReleaseSequencing::Wait),
        "cancel" => Ok(ReleaseSequencing::Cancel),
        _ => Err(anyhow::anyhow!("unknown release sequencing: {}", sequencing)),
    }
}

impl PolicyRelationalPersistence {
    /// Attaches targets to policy rows, preserving row order.
    async fn assemble(&self, rows: Vec<PolicyRow>) -> anyhow::Result<Vec<Policy>> {
        let policy_ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();

        let target_rows = sqlx::query_as::<_, PolicyTargetRow>(
            "SELECT * FROM policy_targets WHERE policy_id = ANY($1) ORDER BY id",
        )
        .bind(&policy_ids)
        .fetch_all(&*self.db)
        .await?;

        let mut targets_by_policy: HashMap<String, Vec<PolicyTarget>> = HashMap::new();
        for target_row in target_rows {
            targets_by_policy
                .entry(target_row.policy_id.clone())
                .or_default()
                .push(target_row.into());
        }

        rows.into_iter()
            .map(|row| {
                let sequencing = match row.sequencing.as_deref() {
                    Some(sequencing) => Some(parse_sequencing(sequencing)?),
                    None => None,
                };

                Ok(Policy {
                    targets: targets_by_policy.remove(&row.id).unwrap_or_default(),
                    id: row.id,
                    workspace_id: row.workspace_id,
                    name: row.name,
                    priority: row.priority,
                    enabled: row.enabled,
                    deny_windows: row.deny_windows.0,
                    version_selector: row.version_selector.map(|selector| selector.0),
                    approvals: row.approvals.map(|approvals| approvals.0),
                    rollout: row.rollout.map(|rollout| rollout.0),
                    sequencing,
                    retry: row.retry.map(|retry| retry.0),
                    created_at: row.created_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Persistence<Policy> for PolicyRelationalPersistence {
    #[tracing::instrument(name = "relational::policy::upsert", skip_all)]
    async fn upsert(&self, policy: &Policy) -> anyhow::Result<u64> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
                INSERT INTO policies
                    (id, workspace_id, name, priority, enabled, deny_windows, version_selector,
                     approvals, rollout, sequencing, retry, created_at)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (id) DO UPDATE SET
                    name = $3,
                    priority = $4,
                    enabled = $5,
                    deny_windows = $6,
                    version_selector = $7,
                    approvals = $8,
                    rollout = $9,
                    sequencing = $10,
                    retry = $11
            "#,
        )
        .bind(&policy.id)
        .bind(&policy.workspace_id)
        .bind(&policy.name)
        .bind(policy.priority)
        .bind(policy.enabled)
        .bind(Json(&policy.deny_windows))
        .bind(policy.version_selector.as_ref().map(Json))
        .bind(policy.approvals.as_ref().map(Json))
        .bind(policy.rollout.as_ref().map(Json))
        .bind(policy.sequencing.as_ref().map(sequencing_as_str))
        .bind(policy.retry.as_ref().map(Json))
        .bind(policy.created_at)
        .execute(&mut tx)
        .await?;

        let target_ids: Vec<String> = policy.targets.iter().map(|t| t.id.clone()).collect();

        sqlx::query("DELETE FROM policy_targets WHERE policy_id = $1 AND NOT (id = ANY($2))")
            .bind(&policy.id)
            .bind(&target_ids)
            .execute(&mut tx)
            .await?;

        for target in policy.targets.iter() {
            sqlx::query(
                r#"
                    INSERT INTO policy_targets
                        (id, policy_id, resource_selector, deployment_selector,
                         environment_selector)
                    VALUES
                        ($1, $2, $3, $4, $5)
                    ON CONFLICT (id) DO UPDATE SET
                        resource_selector = $3,
                        deployment_selector = $4,
                        environment_selector = $5
                "#,
            )
            .bind(&target.id)
            .bind(&policy.id)
            .bind(target.resource_selector.as_ref().map(Json))
            .bind(target.deployment_selector.as_ref().map(Json))
            .bind(target.environment_selector.as_ref().map(Json))
            .execute(&mut tx)
            .await?;
        }

        tx.commit().await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::policy::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM policies WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::policy::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>("SELECT * FROM policies WHERE id = $1")
            .bind(id)
            .fetch_all(&*self.db)
            .await?;

        Ok(self.assemble(rows).await?.into_iter().next())
    }

    #[tracing::instrument(name = "relational::policy::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT * FROM policies ORDER BY priority DESC, id",
        )
        .fetch_all(&*self.db)
        .await?;

        self.assemble(rows).await
    }
}

#[async_trait]
impl PolicyPersistence for PolicyRelationalPersistence {
    #[tracing::instrument(name = "relational::policy::list_by_workspace", skip_all)]
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT * FROM policies WHERE workspace_id = $1 ORDER BY priority DESC, id",
        )
        .bind(workspace_id)
        .fetch_all(&*self.db)
        .await?;

        self.assemble(rows).await
    }

    #[tracing::instrument(name = "relational::policy::list_by_target_ids", skip_all)]
    async fn list_by_target_ids(
        &self,
        policy_target_ids: &[String],
    ) -> anyhow::Result<Vec<Policy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            r#"
                SELECT * FROM policies
                WHERE id IN (SELECT policy_id FROM policy_targets WHERE id = ANY($1))
                ORDER BY priority DESC, id
            "#,
        )
        .bind(policy_target_ids)
        .fetch_all(&*self.db)
        .await?;

        self.assemble(rows).await
    }
}
