use axum::{extract::Path, Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

use super::principal::Principal;
use crate::{
    context::ServiceContext,
    errors::ServiceError,
    models::{ApprovalRecord, ApprovalStatus},
    services::ApprovalDecision,
};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApprovalRequest {
    pub reason: Option<String>,
}

async fn record(
    context: &ServiceContext,
    principal: Principal,
    deployment_version_id: &str,
    environment_id: &str,
    status: ApprovalStatus,
    request: Option<Json<ApprovalRequest>>,
) -> Result<Json<ApprovalRecord>, ServiceError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();

    let decision = ApprovalDecision {
        user_id: principal.id,
        role_ids: principal.role_ids,
        status,
        reason: request.reason,
    };

    let record = context
        .approval_service
        .record(deployment_version_id, environment_id, &decision, &None)
        .await?;

    Ok(Json(record))
}

#[tracing::instrument(name = "http::approval::approve", skip_all)]
pub async fn approve(
    Path((deployment_version_id, environment_id)): Path<(String, String)>,
    request: Option<Json<ApprovalRequest>>,
    Extension(context): Extension<Arc<ServiceContext>>,
    principal: Principal,
) -> Result<Json<ApprovalRecord>, ServiceError> {
    record(
        &context,
        principal,
        &deployment_version_id,
        &environment_id,
        ApprovalStatus::Approved,
        request,
    )
    .await
}

#[tracing::instrument(name = "http::approval::reject", skip_all)]
pub async fn reject(
    Path((deployment_version_id, environment_id)): Path<(String, String)>,
    request: Option<Json<ApprovalRequest>>,
    Extension(context): Extension<Arc<ServiceContext>>,
    principal: Principal,
) -> Result<Json<ApprovalRecord>, ServiceError> {
    record(
        &context,
        principal,
        &deployment_version_id,
        &environment_id,
        ApprovalStatus::Rejected,
        request,
    )
    .await
}
