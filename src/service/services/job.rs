use chrono::{DateTime, Duration, Utc};
use shipyard_core::{
    create_event, EventStream, EventType, LockOutcome, ModelType, OperationId,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    models::{Deployment, Job, JobStatus, JobStatusUpdate, JobTransition, Release},
    persistence::JobPersistence,
};

#[derive(Debug)]
pub struct JobService {
    pub persistence: Box<dyn JobPersistence>,
    pub event_stream: Arc<dyn EventStream>,
}

impl JobService {
    /// Creates the job executing `release` with the deployment's job agent. A deployment
    /// without an agent yields a job that is already `invalid_job_agent`.
    #[tracing::instrument(name = "service::job::create_for_release", skip_all)]
    pub async fn create_for_release(
        &self,
        workspace_id: &str,
        release: &Release,
        deployment: &Deployment,
        retry_count: i32,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<Job> {
        let latest = self
            .persistence
            .list_by_release_target(&release.release_target_id)
            .await?
            .into_iter()
            .next();

        let mut now = Utc::now();
        if let Some(latest) = latest {
            if now <= latest.created_at {
                now = latest.created_at + Duration::microseconds(1);
            }
        }

        let (status, message, completed_at) = match deployment.job_agent_id {
            Some(_) => (JobStatus::Pending, None, None),
            None => (
                JobStatus::InvalidJobAgent,
                Some(format!("deployment {} has no job agent", deployment.id)),
                Some(now),
            ),
        };

        let job = Job {
            id: Uuid::new_v4().to_string(),
            release_id: release.id.clone(),
            release_target_id: release.release_target_id.clone(),

            job_agent_id: deployment.job_agent_id.clone(),
            job_agent_config: deployment.job_agent_config.clone(),

            status,
            external_id: None,
            message,
            retry_count,

            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at,
        };

        self.persistence.create_for_release(&job).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &None,
            &Some(job.clone()),
            EventType::Created,
            ModelType::Job,
            workspace_id,
            &operation_id,
        )?;
        self.event_stream.send(&event).await?;

        tracing::info!(
            "job {} created for release {} with status {}",
            job.id,
            release.id,
            job.status
        );

        Ok(job)
    }

    /// Applies a status report under the job's no-wait row lock.
    #[tracing::instrument(name = "service::job::update_status", skip_all)]
    pub async fn update_status(
        &self,
        workspace_id: &str,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<LockOutcome<Option<JobTransition>>> {
        let outcome = self.persistence.update_status(update, now).await?;

        if let LockOutcome::Acquired(Some(transition)) = &outcome {
            let operation_id = OperationId::unwrap_or_create(operation_id);
            let event = create_event(
                &Some(transition.previous.clone()),
                &Some(transition.current.clone()),
                EventType::Updated,
                ModelType::Job,
                workspace_id,
                &operation_id,
            )?;
            self.event_stream.send(&event).await?;

            tracing::info!(
                "job {} moved from {} to {}",
                transition.current.id,
                transition.previous.status,
                transition.current.status
            );
        }

        Ok(outcome)
    }

    /// Queues a status report from a job agent for the reconciler.
    #[tracing::instrument(name = "service::job::enqueue_update", skip_all)]
    pub async fn enqueue_update(
        &self,
        workspace_id: &str,
        update: &JobStatusUpdate,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<OperationId> {
        let operation_id = OperationId::unwrap_or_create(operation_id);
        let event = create_event(
            &None,
            &Some(update.clone()),
            EventType::Requested,
            ModelType::JobUpdate,
            workspace_id,
            &operation_id,
        )?;

        self.event_stream.send(&event).await?;

        Ok(operation_id)
    }

    #[tracing::instrument(name = "service::job::get_by_id", skip_all)]
    pub async fn get_by_id(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        self.persistence.get_by_id(job_id).await
    }

    pub async fn list_by_release(&self, release_id: &str) -> anyhow::Result<Vec<Job>> {
        self.persistence.list_by_release(release_id).await
    }

    /// Jobs of a release target, newest first.
    pub async fn list_by_release_target(&self, release_target_id: &str) -> anyhow::Result<Vec<Job>> {
        self.persistence
            .list_by_release_target(release_target_id)
            .await
    }

    pub async fn list_active_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Job>> {
        self.persistence
            .list_active_by_release_target(release_target_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::Deployment,
        persistence::memory::JobMemoryPersistence,
        test::{get_deployment_fixture, get_release_fixture, WORKSPACE_FIXTURE_ID},
    };
    use shipyard_memory_stream::MemoryEventStream;

    fn job_service() -> JobService {
        JobService {
            persistence: Box::new(JobMemoryPersistence::default()),
            event_stream: Arc::new(MemoryEventStream::new().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let job_service = job_service();
        let release = get_release_fixture(None);

        let job = job_service
            .create_for_release(
                WORKSPACE_FIXTURE_ID,
                &release,
                &get_deployment_fixture(None),
                0,
                &None,
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let active = job_service
            .list_active_by_release_target(&release.release_target_id)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);

        let update = JobStatusUpdate {
            job_id: job.id.clone(),
            status: JobStatus::Successful,
            external_id: None,
            message: Some("done".to_owned()),
        };
        let outcome = job_service
            .update_status(WORKSPACE_FIXTURE_ID, &update, Utc::now(), &None)
            .await
            .unwrap();

        match outcome {
            LockOutcome::Acquired(Some(transition)) => {
                assert!(transition.just_completed());
                assert_eq!(transition.current.message.as_deref(), Some("done"));
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }

        assert!(job_service
            .list_active_by_release_target(&release.release_target_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_deployment_without_agent_yields_invalid_job() {
        let job_service = job_service();
        let deployment = Deployment {
            job_agent_id: None,
            ..get_deployment_fixture(None)
        };

        let job = job_service
            .create_for_release(
                WORKSPACE_FIXTURE_ID,
                &get_release_fixture(None),
                &deployment,
                0,
                &None,
            )
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::InvalidJobAgent);
        assert!(job.completed_at.is_some());
    }
}
