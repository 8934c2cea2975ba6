use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use std::{collections::BTreeMap, sync::Arc};

use shipyard_core::Persistence;

use crate::{
    models::{Resource, ResourceRelationship},
    persistence::{ResourcePersistence, ResourceRelationshipPersistence},
};

#[derive(Debug)]
pub struct ResourceRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: String,
    workspace_id: String,
    provider_id: Option<String>,
    name: String,
    kind: String,
    version: String,
    identifier: String,
    metadata: Json<BTreeMap<String, String>>,
    variables: Json<BTreeMap<String, serde_json::Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            provider_id: row.provider_id,
            name: row.name,
            kind: row.kind,
            version: row.version,
            identifier: row.identifier,
            metadata: row.metadata.0,
            variables: row.variables.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        }
    }
}

const UPSERT_RESOURCE: &str = r#"
    INSERT INTO resources
        (id, workspace_id, provider_id, name, kind, version, identifier, metadata, variables,
         created_at, updated_at, deleted_at)
    VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (id) DO UPDATE SET
        provider_id = $3,
        name = $4,
        kind = $5,
        version = $6,
        identifier = $7,
        metadata = $8,
        variables = $9,
        updated_at = $11,
        deleted_at = $12
"#;

fn bind_resource<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    resource: &'q Resource,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&resource.id)
        .bind(&resource.workspace_id)
        .bind(&resource.provider_id)
        .bind(&resource.name)
        .bind(&resource.kind)
        .bind(&resource.version)
        .bind(&resource.identifier)
        .bind(Json(&resource.metadata))
        .bind(Json(&resource.variables))
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .bind(resource.deleted_at)
}

#[async_trait]
impl Persistence<Resource> for ResourceRelationalPersistence {
    #[tracing::instrument(name = "relational::resource::upsert", skip_all)]
    async fn upsert(&self, resource: &Resource) -> anyhow::Result<u64> {
        let result = bind_resource(sqlx::query(UPSERT_RESOURCE), resource)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::resource::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::resource::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Resource>> {
        let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;

        Ok(row.map(Resource::from))
    }

    #[tracing::instrument(name = "relational::resource::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(Resource::from).collect())
    }
}

#[async_trait]
impl ResourcePersistence for ResourceRelationalPersistence {
    #[tracing::instrument(name = "relational::resource::upsert_many", skip_all)]
    async fn upsert_many(&self, resources: &[Resource]) -> anyhow::Result<u64> {
        let mut tx = self.db.begin().await?;

        let mut affected_count = 0;
        for resource in resources {
            let result = bind_resource(sqlx::query(UPSERT_RESOURCE), resource)
                .execute(&mut tx)
                .await?;
            affected_count += result.rows_affected();
        }

        tx.commit().await?;

        Ok(affected_count)
    }

    #[tracing::instrument(name = "relational::resource::get_by_identifier", skip_all)]
    async fn get_by_identifier(
        &self,
        workspace_id: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Resource>> {
        let row = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE workspace_id = $1 AND identifier = $2",
        )
        .bind(workspace_id)
        .bind(identifier)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(Resource::from))
    }

    #[tracing::instrument(name = "relational::resource::list_by_workspace", skip_all)]
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE workspace_id = $1 AND deleted_at IS NULL",
        )
        .bind(workspace_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Resource::from).collect())
    }

    #[tracing::instrument(name = "relational::resource::list_by_provider", skip_all)]
    async fn list_by_provider(
        &self,
        workspace_id: &str,
        provider_id: &str,
    ) -> anyhow::Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
                SELECT * FROM resources
                WHERE workspace_id = $1 AND provider_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(workspace_id)
        .bind(provider_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Resource::from).collect())
    }

    #[tracing::instrument(name = "relational::resource::soft_delete", skip_all)]
    async fn soft_delete(
        &self,
        resource_ids: &[String],
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                UPDATE resources SET deleted_at = $2, updated_at = $2
                WHERE id = ANY($1) AND deleted_at IS NULL
            "#,
        )
        .bind(resource_ids)
        .bind(now)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug)]
pub struct RelationshipRelationalPersistence {
    pub db: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct RelationshipRow {
    id: String,
    workspace_id: String,
    parent_id: String,
    child_id: String,
    relationship_type: String,
}

impl From<RelationshipRow> for ResourceRelationship {
    fn from(row: RelationshipRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            parent_id: row.parent_id,
            child_id: row.child_id,
            relationship_type: row.relationship_type,
        }
    }
}

#[async_trait]
impl Persistence<ResourceRelationship> for RelationshipRelationalPersistence {
    #[tracing::instrument(name = "relational::relationship::upsert", skip_all)]
    async fn upsert(&self, relationship: &ResourceRelationship) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
                INSERT INTO resource_relationships
                    (id, workspace_id, parent_id, child_id, relationship_type)
                VALUES
                    ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&relationship.id)
        .bind(&relationship.workspace_id)
        .bind(&relationship.parent_id)
        .bind(&relationship.child_id)
        .bind(&relationship.relationship_type)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::relationship::delete", skip_all)]
    async fn delete(&self, id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM resource_relationships WHERE id = $1")
            .bind(id)
            .execute(&*self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(name = "relational::relationship::get_by_id", skip_all)]
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<ResourceRelationship>> {
        let row = sqlx::query_as::<_, RelationshipRow>(
            "SELECT * FROM resource_relationships WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(ResourceRelationship::from))
    }

    #[tracing::instrument(name = "relational::relationship::list", skip_all)]
    async fn list(&self) -> anyhow::Result<Vec<ResourceRelationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>("SELECT * FROM resource_relationships")
            .fetch_all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(ResourceRelationship::from).collect())
    }
}

#[async_trait]
impl ResourceRelationshipPersistence for RelationshipRelationalPersistence {
    #[tracing::instrument(name = "relational::relationship::get_children", skip_all)]
    async fn get_children(&self, parent_id: &str) -> anyhow::Result<Vec<ResourceRelationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(
            "SELECT * FROM resource_relationships WHERE parent_id = $1",
        )
        .bind(parent_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(ResourceRelationship::from).collect())
    }

    #[tracing::instrument(name = "relational::relationship::get_parents", skip_all)]
    async fn get_parents(&self, child_id: &str) -> anyhow::Result<Vec<ResourceRelationship>> {
        let rows = sqlx::query_as::<_, RelationshipRow>(
            "SELECT * FROM resource_relationships WHERE child_id = $1",
        )
        .bind(child_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(ResourceRelationship::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{persistence::relational::tests::ensure_fixtures, test::get_resource_fixture};

    #[tokio::test]
    #[ignore]
    async fn test_upsert_soft_delete() {
        let db = ensure_fixtures().await;
        let resource_persistence = ResourceRelationalPersistence { db };

        let resource = get_resource_fixture(Some("relational-resource-fixture"));

        resource_persistence.delete(&resource.id).await.unwrap();
        let created_count = resource_persistence.upsert(&resource).await.unwrap();
        assert_eq!(created_count, 1);

        let fetched_resource = resource_persistence
            .get_by_identifier(&resource.workspace_id, &resource.identifier)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched_resource.metadata, resource.metadata);

        let deleted_count = resource_persistence
            .soft_delete(&[resource.id.clone()], Utc::now())
            .await
            .unwrap();
        assert_eq!(deleted_count, 1);

        let live_resources = resource_persistence
            .list_by_workspace(&resource.workspace_id)
            .await
            .unwrap();
        assert!(live_resources.iter().all(|r| r.id != resource.id));

        resource_persistence.delete(&resource.id).await.unwrap();
    }
}
