use axum::{extract::Path, http::StatusCode, Extension, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    context::ServiceContext,
    errors::ServiceError,
    models::{JobStatus, JobStatusUpdate},
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusRequest {
    pub status: JobStatus,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusAccepted {
    pub operation_id: String,
}

/// Job agent ingress. The update is applied asynchronously by the reconciler.
#[tracing::instrument(name = "http::job::update_status", skip_all)]
pub async fn update_status(
    Path(job_id): Path<String>,
    Json(request): Json<JobStatusRequest>,
    Extension(context): Extension<Arc<ServiceContext>>,
) -> Result<(StatusCode, Json<JobStatusAccepted>), ServiceError> {
    let job = match context.job_service.get_by_id(&job_id).await? {
        Some(job) => job,
        None => return Err(ServiceError::NotFound(format!("job {} not found", job_id))),
    };

    let release_target = match context
        .release_target_service
        .get_by_id(&job.release_target_id)
        .await?
    {
        Some(release_target) => release_target,
        None => {
            return Err(ServiceError::NotFound(format!(
                "release target {} of job {} not found",
                job.release_target_id, job_id
            )))
        }
    };

    let update = JobStatusUpdate {
        job_id,
        status: request.status,
        external_id: request.external_id,
        message: request.message,
    };

    let operation_id = context
        .job_service
        .enqueue_update(&release_target.workspace_id, &update, &None)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobStatusAccepted {
            operation_id: operation_id.id,
        }),
    ))
}
