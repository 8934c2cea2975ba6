use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::context::ServiceContext;

pub mod approval;
pub mod health;
pub mod job;
pub mod principal;
pub mod release_target;
pub mod resource;

pub use principal::Principal;

pub fn http_router(context: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/release-targets/:id/pin", post(release_target::pin))
        .route("/release-targets/:id/unpin", post(release_target::unpin))
        .route("/release-targets/:id/lock", post(release_target::lock))
        .route("/release-targets/:id/unlock", post(release_target::unlock))
        .route(
            "/release-targets/:id/evaluation",
            get(release_target::evaluation),
        )
        .route(
            "/deployment-versions/:id/approve/environment/:environment_id",
            post(approval::approve),
        )
        .route(
            "/deployment-versions/:id/reject/environment/:environment_id",
            post(approval::reject),
        )
        .route(
            "/workspaces/:id/providers/:provider_id/resources",
            post(resource::upsert),
        )
        .route("/jobs/:id/status", post(job::update_status))
        .layer(Extension(context))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::ReleaseTarget,
        test::{
            get_deployment_fixture, get_environment_fixture, get_resource_fixture,
            get_version_fixture, WORKSPACE_FIXTURE_ID,
        },
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use shipyard_core::LockOutcome;
    use tower::ServiceExt;

    async fn seed(context: &ServiceContext) -> ReleaseTarget {
        context
            .resource_service
            .persistence
            .upsert_many(&[get_resource_fixture(None)])
            .await
            .unwrap();
        context
            .environment_service
            .upsert(&get_environment_fixture(None), &None)
            .await
            .unwrap();
        context
            .deployment_service
            .upsert(&get_deployment_fixture(None), &None)
            .await
            .unwrap();
        context
            .version_service
            .create(&get_version_fixture(None), &None)
            .await
            .unwrap();

        match context
            .release_target_service
            .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
            .await
            .unwrap()
        {
            LockOutcome::Acquired(result) => result.created[0].clone(),
            LockOutcome::Contended => panic!("unexpected contention"),
        }
    }

    fn post(uri: &str, principal_id: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");

        if let Some(principal_id) = principal_id {
            builder = builder.header(principal::PRINCIPAL_ID_HEADER, principal_id);
        }

        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let context = Arc::new(ServiceContext::memory());

        let response = http_router(context)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pin_by_tag_and_unknown_tag() {
        let context = Arc::new(ServiceContext::memory());
        let release_target = seed(&context).await;
        let uri = format!("/release-targets/{}/pin", release_target.id);

        let response = http_router(Arc::clone(&context))
            .oneshot(post(&uri, Some("user-1"), json!({ "versionTag": "1.0.0" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["desired_version_id"], "version-1.0.0");

        let response = http_router(Arc::clone(&context))
            .oneshot(post(&uri, Some("user-1"), json!({ "versionTag": "9.9.9" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = http_router(context)
            .oneshot(post(&uri, Some("user-1"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lock_and_unlock_by_other_principal() {
        let context = Arc::new(ServiceContext::memory());
        let release_target = seed(&context).await;

        let response = http_router(Arc::clone(&context))
            .oneshot(post(
                &format!("/release-targets/{}/lock", release_target.id),
                Some("user-1"),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let unlock_uri = format!("/release-targets/{}/unlock", release_target.id);

        let response = http_router(Arc::clone(&context))
            .oneshot(post(&unlock_uri, Some("user-2"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = http_router(Arc::clone(&context))
            .oneshot(post(&unlock_uri, None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = http_router(context)
            .oneshot(post(&unlock_uri, Some("user-1"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["unlocked_by"], "user-1");
    }

    #[tokio::test]
    async fn test_approve_unknown_version() {
        let context = Arc::new(ServiceContext::memory());
        seed(&context).await;

        let response = http_router(context)
            .oneshot(post(
                "/deployment-versions/missing/approve/environment/environment-fixture",
                Some("user-1"),
                json!({ "reason": "looks good" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resource_ingress_and_evaluation_preview() {
        let context = Arc::new(ServiceContext::memory());
        let release_target = seed(&context).await;

        let response = http_router(Arc::clone(&context))
            .oneshot(post(
                "/workspaces/workspace-fixture/providers/scanner-1/resources",
                None,
                json!([{
                    "name": "edge",
                    "kind": "Kubernetes",
                    "version": "v1",
                    "identifier": "cluster/edge"
                }]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["inserted"], 1);

        let response = http_router(Arc::clone(&context))
            .oneshot(
                Request::builder()
                    .uri(format!("/release-targets/{}/evaluation", release_target.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["selectedVersionId"], "version-1.0.0");

        let response = http_router(context)
            .oneshot(
                Request::builder()
                    .uri("/release-targets/missing/evaluation")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_job_status_is_accepted() {
        let context = Arc::new(ServiceContext::memory());

        let response = http_router(Arc::clone(&context))
            .oneshot(post(
                "/jobs/missing/status",
                None,
                json!({ "status": "successful" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let release_target = seed(&context).await;
        let (_, result) = context
            .release_manager
            .evaluate(&release_target.id, &None)
            .await
            .unwrap()
            .unwrap();
        let release = match result {
            crate::reconciliation::EvaluationResult::Released { release, .. } => release,
            other => panic!("unexpected evaluation result: {:?}", other),
        };
        let job = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();

        let response = http_router(context)
            .oneshot(post(
                &format!("/jobs/{}/status", job.id),
                None,
                json!({ "status": "in_progress", "externalId": "run-42" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
