use axum::{extract::Path, Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::principal::Principal;
use crate::{
    context::ServiceContext,
    errors::ServiceError,
    models::{ReleaseTarget, ReleaseTargetLock},
    reconciliation::EvaluationPreview,
    services::PinVersion,
};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub expires_at: Option<DateTime<Utc>>,
}

#[tracing::instrument(name = "http::release_target::pin", skip_all)]
pub async fn pin(
    Path(release_target_id): Path<String>,
    Json(pin): Json<PinVersion>,
    Extension(context): Extension<Arc<ServiceContext>>,
    principal: Principal,
) -> Result<Json<ReleaseTarget>, ServiceError> {
    tracing::info!(
        "{} pinning release target {}",
        principal.id,
        release_target_id
    );

    let release_target = context
        .release_target_service
        .pin(&release_target_id, &pin, &None)
        .await?;

    Ok(Json(release_target))
}

#[tracing::instrument(name = "http::release_target::unpin", skip_all)]
pub async fn unpin(
    Path(release_target_id): Path<String>,
    Extension(context): Extension<Arc<ServiceContext>>,
    principal: Principal,
) -> Result<Json<ReleaseTarget>, ServiceError> {
    tracing::info!(
        "{} unpinning release target {}",
        principal.id,
        release_target_id
    );

    let release_target = context
        .release_target_service
        .unpin(&release_target_id, &None)
        .await?;

    Ok(Json(release_target))
}

#[tracing::instrument(name = "http::release_target::lock", skip_all)]
pub async fn lock(
    Path(release_target_id): Path<String>,
    request: Option<Json<LockRequest>>,
    Extension(context): Extension<Arc<ServiceContext>>,
    principal: Principal,
) -> Result<Json<ReleaseTargetLock>, ServiceError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();

    let lock = context
        .release_target_service
        .lock(&release_target_id, &principal.id, request.expires_at)
        .await?;

    Ok(Json(lock))
}

#[tracing::instrument(name = "http::release_target::unlock", skip_all)]
pub async fn unlock(
    Path(release_target_id): Path<String>,
    Extension(context): Extension<Arc<ServiceContext>>,
    principal: Principal,
) -> Result<Json<ReleaseTargetLock>, ServiceError> {
    let lock = context
        .release_target_service
        .unlock(&release_target_id, &principal.id, &None)
        .await?;

    Ok(Json(lock))
}

#[tracing::instrument(name = "http::release_target::evaluation", skip_all)]
pub async fn evaluation(
    Path(release_target_id): Path<String>,
    Extension(context): Extension<Arc<ServiceContext>>,
) -> Result<Json<EvaluationPreview>, ServiceError> {
    match context.release_manager.preview(&release_target_id).await? {
        Some(preview) => Ok(Json(preview)),
        None => Err(ServiceError::NotFound(format!(
            "release target {} not found",
            release_target_id
        ))),
    }
}
