use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::{collections::BTreeMap, sync::Arc};

use shipyard_core::{Condition, Persistence};

use crate::{
    models::{
        Deployment, DeploymentVariable, DeploymentVersion, Environment, VariableValue,
        VersionDependency,
    },
    persistence::{
        DeploymentPersistence, EnvironmentPersistence, VariablePersistence, VersionPersistence,
    },
};

#[derive(Debug)]
pub struct EnvironmentRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    workspace_id: String,
    system_id: String,
    name: String,
    metadata: Json<BTreeMap<String, String>>,
    resource_selector: Option<Json<Condition>>,
    created_at: DateTime<Utc>,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            system_id: row.system_id,
            name: row.name,
            metadata: row.metadata.0,
            resource_selector: row.resource_selector.map(|selector| selector.0),
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl Persistence<Environment> for EnvironmentRelationalPersistence {
    #[tracing::instrument(name = "relational::environment::upsert", skip_all)]
    async fn upsert(&self, environment: &Environment) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO environments
                    (id, workspace_id, system_id, name, metadata, resource_selector, created_at)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET
                    system_id = $3,
                    name = $4,
                    metadata = $5,
                    resource_selector = $6
            "#,
        )
        .bind(&environment.id)
        .bind(&environment.workspace_id)
        .bind(&environment.system_id)
        .bind(&environment.name)
        .bind(Json(&environment.metadata))
        .bind(environment.resource_selector.as_ref().map(Json))
        .bind(environment.created_at)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::environment::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM environments WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::environment::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Environment>> {
        let row = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        Ok(row.map(Environment::from))
    }

    #[tracing::instrument(name = "relational::environment::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<Environment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(Environment::from).collect())
    }
}

#[async_trait]
impl EnvironmentPersistence for EnvironmentRelationalPersistence {
    #[tracing::instrument(name = "relational::environment::list_by_workspace", skip_all)]
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Environment>> {
        let rows = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT * FROM environments WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Environment::from).collect())
    }

    #[tracing::instrument(name = "relational::environment::list_by_system", skip_all)]
    async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Environment>> {
        let rows =
            sqlx::query_as::<_, EnvironmentRow>("SELECT * FROM environments WHERE system_id = $1")
                .bind(system_id)
                .fetch_all(&*self.db)
                .await?;

        Ok(rows.into_iter().map(Environment::from).collect())
    }
}

#[derive(Debug)]
pub struct DeploymentRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    workspace_id: String,
    system_id: String,
    name: String,
    resource_selector: Option<Json<Condition>>,
    job_agent_id: Option<String>,
    job_agent_config: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            system_id: row.system_id,
            name: row.name,
            resource_selector: row.resource_selector.map(|selector| selector.0),
            job_agent_id: row.job_agent_id,
            job_agent_config: row.job_agent_config,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl Persistence<Deployment> for DeploymentRelationalPersistence {
    #[tracing::instrument(name = "relational::deployment::upsert", skip_all)]
    async fn upsert(&self, deployment: &Deployment) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO deployments
                    (id, workspace_id, system_id, name, resource_selector, job_agent_id,
                     job_agent_config, created_at)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    system_id = $3,
                    name = $4,
                    resource_selector = $5,
                    job_agent_id = $6,
                    job_agent_config = $7
            "#,
        )
        .bind(&deployment.id)
        .bind(&deployment.workspace_id)
        .bind(&deployment.system_id)
        .bind(&deployment.name)
        .bind(deployment.resource_selector.as_ref().map(Json))
        .bind(&deployment.job_agent_id)
        .bind(&deployment.job_agent_config)
        .bind(deployment.created_at)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::deployment::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::deployment::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        Ok(row.map(Deployment::from))
    }

    #[tracing::instrument(name = "relational::deployment::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(Deployment::from).collect())
    }
}

#[async_trait]
impl DeploymentPersistence for DeploymentRelationalPersistence {
    #[tracing::instrument(name = "relational::deployment::list_by_workspace", skip_all)]
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Deployment>> {
        let rows =
            sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_all(&*self.db)
                .await?;

        Ok(rows.into_iter().map(Deployment::from).collect())
    }

    #[tracing::instrument(name = "relational::deployment::list_by_system", skip_all)]
    async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Deployment>> {
        let rows =
            sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE system_id = $1")
                .bind(system_id)
                .fetch_all(&*self.db)
                .await?;

        Ok(rows.into_iter().map(Deployment::from).collect())
    }
}

#[derive(Debug)]
pub struct VersionRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: String,
    deployment_id: String,
    tag: String,
    name: String,
    config: serde_json::Value,
    metadata: Json<BTreeMap<String, String>>,
    status: String,
    dependencies: Json<Vec<VersionDependency>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<VersionRow> for DeploymentVersion {
    type Error = anyhow::Error;

    fn try_from(row: VersionRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.id,
            deployment_id: row.deployment_id,
            tag: row.tag,
            name: row.name,
            config: row.config,
            metadata: row.metadata.0,
            status: row.status.parse()?,
            dependencies: row.dependencies.0,
            created_at: row.created_at,
        })
    }
}

fn versions_from_rows(rows: Vec<VersionRow>) -> anyhow::Result<Vec<DeploymentVersion>> {
    rows.into_iter().map(DeploymentVersion::try_from).collect()
}

#[async_trait]
impl Persistence<DeploymentVersion> for VersionRelationalPersistence {
    #[tracing::instrument(name = "relational::version::upsert", skip_all)]
    async fn upsert(&self, version: &DeploymentVersion) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO deployment_versions
                    (id, deployment_id, tag, name, config, metadata, status, dependencies,
                     created_at)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE SET
                    name = $4,
                    config = $5,
                    metadata = $6,
                    status = $7,
                    dependencies = $8
            "#,
        )
        .bind(&version.id)
        .bind(&version.deployment_id)
        .bind(&version.tag)
        .bind(&version.name)
        .bind(&version.config)
        .bind(Json(&version.metadata))
        .bind(version.status.as_str())
        .bind(Json(&version.dependencies))
        .bind(version.created_at)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::version::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM deployment_versions WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::version::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<DeploymentVersion>> {
        let row =
            sqlx::query_as::<_, VersionRow>("SELECT * FROM deployment_versions WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?;

        row.map(DeploymentVersion::try_from).transpose()
    }

    #[tracing::instrument(name = "relational::version::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<DeploymentVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>("SELECT * FROM deployment_versions")
            .fetch_all(&*self.db)
            .await?;

        versions_from_rows(rows)
    }
}

#[async_trait]
impl VersionPersistence for VersionRelationalPersistence {
    #[tracing::instrument(name = "relational::version::list_ready_by_deployment", skip_all)]
    async fn list_ready_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            r#"
                SELECT * FROM deployment_versions
                WHERE deployment_id = $1 AND status = 'ready'
                ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&*self.db)
        .await?;

        versions_from_rows(rows)
    }

    #[tracing::instrument(name = "relational::version::get_by_tag", skip_all)]
    async fn get_by_tag(
        &self,
        deployment_id: &str,
        tag: &str,
    ) -> anyhow::Result<Option<DeploymentVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM deployment_versions WHERE deployment_id = $1 AND tag = $2",
        )
        .bind(deployment_id)
        .bind(tag)
        .fetch_optional(&*self.db)
        .await?;

        row.map(DeploymentVersion::try_from).transpose()
    }

    #[tracing::instrument(name = "relational::version::list_depending_on", skip_all)]
    async fn list_depending_on(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(
            r#"
                SELECT * FROM deployment_versions
                WHERE dependencies @> jsonb_build_array(jsonb_build_object('deployment_id', $1::text))
            "#,
        )
        .bind(deployment_id)
        .fetch_all(&*self.db)
        .await?;

        versions_from_rows(rows)
    }
}

#[derive(Debug)]
pub struct VariableRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct VariableRow {
    id: String,
    deployment_id: String,
    key: String,
    default_value: Option<serde_json::Value>,
    values: Json<Vec<VariableValue>>,
}

impl From<VariableRow> for DeploymentVariable {
    fn from(row: VariableRow) -> Self {
        Self {
            id: row.id,
            deployment_id: row.deployment_id,
            key: row.key,
            default_value: row.default_value,
            values: row.values.0,
        }
    }
}

#[async_trait]
impl Persistence<DeploymentVariable> for VariableRelationalPersistence {
    #[tracing::instrument(name = "relational::variable::upsert", skip_all)]
    async fn upsert(&self, variable: &DeploymentVariable) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO deployment_variables
                    (id, deployment_id, key, default_value, "values")
                VALUES
                    ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    key = $3,
                    default_value = $4,
                    "values" = $5
            "#,
        )
        .bind(&variable.id)
        .bind(&variable.deployment_id)
        .bind(&variable.key)
        .bind(&variable.default_value)
        .bind(Json(&variable.values))
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::variable::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM deployment_variables WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::variable::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<DeploymentVariable>> {
        let row =
            sqlx::query_as::<_, VariableRow>("SELECT * FROM deployment_variables WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.db)
                .await?;

        Ok(row.map(DeploymentVariable::from))
    }

    #[tracing::instrument(name = "relational::variable::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<DeploymentVariable>> {
        let rows = sqlx::query_as::<_, VariableRow>("SELECT * FROM deployment_variables")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(DeploymentVariable::from).collect())
    }
}

#[async_trait]
impl VariablePersistence for VariableRelationalPersistence {
    #[tracing::instrument(name = "relational::variable::list_by_deployment", skip_all)]
    async fn list_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVariable>> {
        let rows = sqlx::query_as::<_, VariableRow>(
            "SELECT * FROM deployment_variables WHERE deployment_id = $1 ORDER BY key",
        )
        .bind(deployment_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(DeploymentVariable::from).collect())
    }
}
