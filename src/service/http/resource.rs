use axum::{extract::Path, Extension, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::{context::ServiceContext, errors::ServiceError, models::ResourceToInsert};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpsertResourcesResponse {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Scanner ingress: the body is the full set of resources the provider currently sees.
#[tracing::instrument(name = "http::resource::upsert", skip_all)]
pub async fn upsert(
    Path((workspace_id, provider_id)): Path<(String, String)>,
    Json(resources): Json<Vec<ResourceToInsert>>,
    Extension(context): Extension<Arc<ServiceContext>>,
) -> Result<Json<UpsertResourcesResponse>, ServiceError> {
    let result = context
        .resource_service
        .upsert_resources(&workspace_id, &provider_id, &resources, &None)
        .await?;

    Ok(Json(UpsertResourcesResponse {
        inserted: result.inserted.len(),
        updated: result.updated.len(),
        deleted: result.deleted.len(),
    }))
}
