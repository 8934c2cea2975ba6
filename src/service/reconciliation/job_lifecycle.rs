use chrono::Utc;
use shipyard_core::{Event, EventStream, LockOutcome, OperationId};
use std::{collections::HashSet, sync::Arc};

use crate::{
    models::{Job, JobStatus, JobStatusUpdate, Release, ReleaseSequencing, ReleaseTarget},
    policy::{release_sequencing, PolicyEngine},
    services::{
        DeploymentService, JobService, ReleaseService, ReleaseTargetService, ResourceService,
        VersionService,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum JobUpdateOutcome {
    Updated { job: Job, retried: Option<Job> },
    NotFound,
    /// The job row was locked by another worker; the update went back on the stream.
    Requeued,
}

/// Creates jobs for new releases and reacts to job status reports.
#[derive(Debug)]
pub struct JobLifecycle {
    pub event_stream: Arc<dyn EventStream>,
    pub policy_engine: Arc<PolicyEngine>,

    pub deployment_service: Arc<DeploymentService>,
    pub job_service: Arc<JobService>,
    pub release_service: Arc<ReleaseService>,
    pub release_target_service: Arc<ReleaseTargetService>,
    pub resource_service: Arc<ResourceService>,
    pub version_service: Arc<VersionService>,
}

impl JobLifecycle {
    /// Creates the first job of `release`. Releases that already have a job are left alone.
    #[tracing::instrument(name = "reconciliation::job_lifecycle::dispatch", skip_all)]
    pub async fn dispatch(
        &self,
        release_target: &ReleaseTarget,
        release: &Release,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<Option<Job>> {
        if !self.job_service.list_by_release(&release.id).await?.is_empty() {
            tracing::debug!("release {} already has a job", release.id);
            return Ok(None);
        }

        let deployment = match self
            .deployment_service
            .get_by_id(&release_target.deployment_id)
            .await?
        {
            Some(deployment) => deployment,
            None => {
                tracing::warn!(
                    "deployment {} of release target {} not found",
                    release_target.deployment_id,
                    release_target.id
                );
                return Ok(None);
            }
        };

        let policies = self
            .policy_engine
            .applicable_policies(&release_target.id)
            .await?;

        if release_sequencing(&policies) == Some(ReleaseSequencing::Cancel) {
            self.cancel_superseded(release_target, release, operation_id)
                .await?;
        }

        let job = self
            .job_service
            .create_for_release(
                &release_target.workspace_id,
                release,
                &deployment,
                0,
                operation_id,
            )
            .await?;

        Ok(Some(job))
    }

    async fn cancel_superseded(
        &self,
        release_target: &ReleaseTarget,
        release: &Release,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<()> {
        let active_jobs = self
            .job_service
            .list_active_by_release_target(&release_target.id)
            .await?;

        for job in active_jobs
            .iter()
            .filter(|job| job.release_id != release.id)
        {
            let update = JobStatusUpdate {
                job_id: job.id.clone(),
                status: JobStatus::Cancelled,
                external_id: None,
                message: Some(format!("superseded by release {}", release.id)),
            };

            let outcome = self
                .job_service
                .update_status(
                    &release_target.workspace_id,
                    &update,
                    Utc::now(),
                    operation_id,
                )
                .await?;

            if let LockOutcome::Contended = outcome {
                tracing::info!("job {} is locked, queueing its cancellation", job.id);
                self.job_service
                    .enqueue_update(&release_target.workspace_id, &update, operation_id)
                    .await?;
            }
        }

        Ok(())
    }

    /// Applies a queued job status report. On completion the target is either retried or
    /// re-evaluated, and a success wakes up targets whose dependencies it satisfies.
    #[tracing::instrument(name = "reconciliation::job_lifecycle::update_job", skip_all)]
    pub async fn update_job(&self, event: &Event) -> anyhow::Result<JobUpdateOutcome> {
        let update: JobStatusUpdate = event.current_or_previous_model()?;
        let operation_id = Some(event.operation_id.clone());

        let transition = match self
            .job_service
            .update_status(&event.workspace_id, &update, Utc::now(), &operation_id)
            .await?
        {
            LockOutcome::Contended => {
                tracing::info!("job {} is locked, requeueing update", update.job_id);
                self.event_stream.send(&event.requeued()).await?;
                return Ok(JobUpdateOutcome::Requeued);
            }
            LockOutcome::Acquired(None) => {
                tracing::warn!("job {} not found", update.job_id);
                return Ok(JobUpdateOutcome::NotFound);
            }
            LockOutcome::Acquired(Some(transition)) => transition,
        };

        let job = transition.current.clone();
        if !transition.just_completed() {
            return Ok(JobUpdateOutcome::Updated { job, retried: None });
        }

        let release_target = match self
            .release_target_service
            .get_by_id(&job.release_target_id)
            .await?
        {
            Some(release_target) => release_target,
            None => return Ok(JobUpdateOutcome::Updated { job, retried: None }),
        };

        if job.status == JobStatus::Failed {
            if let Some(retried) = self.retry(&release_target, &job, &operation_id).await? {
                return Ok(JobUpdateOutcome::Updated {
                    job,
                    retried: Some(retried),
                });
            }
        }

        self.release_target_service
            .enqueue_evaluations(&[release_target.clone()], &operation_id)
            .await?;

        if job.status == JobStatus::Successful {
            if let Err(err) = self
                .propagate_success(&release_target, &job, &operation_id)
                .await
            {
                tracing::error!(
                    "propagating success of job {} failed: {:?}",
                    job.id,
                    err
                );
            }
        }

        Ok(JobUpdateOutcome::Updated { job, retried: None })
    }

    /// Creates another job for the failed job's release while the retry budget of the
    /// first policy with a retry rule allows it.
    async fn retry(
        &self,
        release_target: &ReleaseTarget,
        failed: &Job,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<Option<Job>> {
        let policies = self
            .policy_engine
            .applicable_policies(&release_target.id)
            .await?;

        let retry = match policies.iter().find_map(|policy| policy.retry.clone()) {
            Some(retry) => retry,
            None => return Ok(None),
        };

        let failures = failed.retry_count + 1;
        if failures >= retry.max_retries {
            tracing::info!(
                "job {} failed {} times, retry budget of {} exhausted",
                failed.id,
                failures,
                retry.max_retries
            );
            return Ok(None);
        }

        let release = match self.release_service.get_by_id(&failed.release_id).await? {
            Some(release) => release,
            None => return Ok(None),
        };

        let deployment = match self
            .deployment_service
            .get_by_id(&release_target.deployment_id)
            .await?
        {
            Some(deployment) => deployment,
            None => return Ok(None),
        };

        let job = self
            .job_service
            .create_for_release(
                &release_target.workspace_id,
                &release,
                &deployment,
                failures,
                operation_id,
            )
            .await?;

        tracing::info!("retrying release {} as job {}", release.id, job.id);

        Ok(Some(job))
    }

    /// Re-evaluates targets on the same resource, or its children, whose versions depend
    /// on the version that just succeeded.
    async fn propagate_success(
        &self,
        release_target: &ReleaseTarget,
        job: &Job,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<usize> {
        let release = match self.release_service.get_by_id(&job.release_id).await? {
            Some(release) => release,
            None => return Ok(0),
        };

        let version = match self.version_service.get_by_id(&release.version_id).await? {
            Some(version) => version,
            None => return Ok(0),
        };

        let dependent_deployment_ids: HashSet<String> = self
            .version_service
            .list_depending_on(&release_target.deployment_id)
            .await?
            .into_iter()
            .filter(|dependent| {
                dependent.dependencies.iter().any(|dependency| {
                    dependency.deployment_id == release_target.deployment_id
                        && dependency.version_selector.matches(&version)
                })
            })
            .map(|dependent| dependent.deployment_id)
            .collect();

        if dependent_deployment_ids.is_empty() {
            return Ok(0);
        }

        let mut resource_ids = vec![release_target.resource_id.clone()];
        resource_ids.extend(
            self.resource_service
                .get_child_ids(&release_target.resource_id)
                .await?,
        );

        let dependents: Vec<ReleaseTarget> = self
            .release_target_service
            .list_by_resource_ids(&resource_ids)
            .await?
            .into_iter()
            .filter(|candidate| dependent_deployment_ids.contains(&candidate.deployment_id))
            .collect();

        let enqueued = self
            .release_target_service
            .enqueue_evaluations(&dependents, operation_id)
            .await?;

        tracing::info!(
            "version {} succeeded on {}, re-evaluating {} dependent targets",
            version.tag,
            release_target.resource_id,
            enqueued
        );

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ServiceContext,
        models::{Deployment, Policy, RetryRule, VersionDependency},
        persistence::{memory::JobMemoryPersistence, PersistenceSet},
        reconciliation::EvaluationResult,
        test::{
            get_deployment_fixture, get_environment_fixture, get_policy_fixture,
            get_resource_fixture, get_version_fixture, WORKSPACE_FIXTURE_ID,
        },
    };
    use shipyard_core::{create_event, Condition, EventType, ModelType, StringOperator};
    use shipyard_memory_stream::MemoryEventStream;

    async fn seed(context: &ServiceContext, policy: Option<Policy>) -> ReleaseTarget {
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

        let release_target = match context
            .release_target_service
            .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
            .await
            .unwrap()
        {
            LockOutcome::Acquired(result) => result.created[0].clone(),
            LockOutcome::Contended => panic!("unexpected contention"),
        };

        if let Some(policy) = policy {
            context.policy_service.upsert(&policy, &None).await.unwrap();
            context
                .membership_service
                .refresh_policy(&policy)
                .await
                .unwrap();
        }

        release_target
    }

    async fn release_for(context: &ServiceContext, release_target: &ReleaseTarget) -> Release {
        match context
            .release_manager
            .evaluate(&release_target.id, &None)
            .await
            .unwrap()
        {
            Some((_, EvaluationResult::Released { release, .. })) => release,
            other => panic!("unexpected evaluation result: {:?}", other),
        }
    }

    fn job_update_event(job_id: &str, status: JobStatus) -> Event {
        let update = JobStatusUpdate {
            job_id: job_id.to_owned(),
            status,
            external_id: None,
            message: None,
        };

        create_event(
            &None,
            &Some(update),
            EventType::Requested,
            ModelType::JobUpdate,
            WORKSPACE_FIXTURE_ID,
            &OperationId::create(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_creates_one_job_per_release() {
        let context = ServiceContext::memory();
        let release_target = seed(&context, None).await;
        let release = release_for(&context, &release_target).await;

        let job = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.release_id, release.id);

        assert!(context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_deployment_without_agent_gets_invalid_job() {
        let context = ServiceContext::memory();
        let release_target = seed(&context, None).await;
        context
            .deployment_service
            .upsert(
                &Deployment {
                    job_agent_id: None,
                    ..get_deployment_fixture(None)
                },
                &None,
            )
            .await
            .unwrap();

        let release = release_for(&context, &release_target).await;
        let job = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.status, JobStatus::InvalidJobAgent);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_job_retries_within_budget() {
        let context = ServiceContext::memory();
        let policy = Policy {
            retry: Some(RetryRule { max_retries: 2 }),
            ..get_policy_fixture(None)
        };
        let release_target = seed(&context, Some(policy)).await;
        let release = release_for(&context, &release_target).await;

        let first = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();

        let retried = match context
            .job_lifecycle
            .update_job(&job_update_event(&first.id, JobStatus::Failed))
            .await
            .unwrap()
        {
            JobUpdateOutcome::Updated {
                retried: Some(retried),
                ..
            } => retried,
            other => panic!("expected a retry, got {:?}", other),
        };
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.release_id, release.id);

        let outcome = context
            .job_lifecycle
            .update_job(&job_update_event(&retried.id, JobStatus::Failed))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            JobUpdateOutcome::Updated { retried: None, .. }
        ));
        assert_eq!(
            context
                .job_service
                .list_by_release(&release.id)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let context = ServiceContext::memory();

        let outcome = context
            .job_lifecycle
            .update_job(&job_update_event("missing", JobStatus::Successful))
            .await
            .unwrap();

        assert_eq!(outcome, JobUpdateOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_sequencing_cancels_superseded_jobs() {
        let context = ServiceContext::memory();
        let policy = Policy {
            sequencing: Some(ReleaseSequencing::Cancel),
            ..get_policy_fixture(None)
        };
        let release_target = seed(&context, Some(policy)).await;
        let release = release_for(&context, &release_target).await;

        let first = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();

        context
            .version_service
            .create(&get_version_fixture(Some("2.0.0")), &None)
            .await
            .unwrap();
        let newer = release_for(&context, &release_target).await;
        assert_ne!(newer.id, release.id);

        context
            .job_lifecycle
            .dispatch(&release_target, &newer, &None)
            .await
            .unwrap()
            .unwrap();

        let cancelled = context
            .job_service
            .get_by_id(&first.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_of_locked_job_is_queued() {
        let jobs = JobMemoryPersistence::default();
        let event_stream: Arc<dyn EventStream> = Arc::new(MemoryEventStream::new().unwrap());
        let context = ServiceContext::new(
            PersistenceSet {
                jobs: Box::new(jobs.clone()),
                ..PersistenceSet::memory()
            },
            event_stream,
        );

        let policy = Policy {
            sequencing: Some(ReleaseSequencing::Cancel),
            ..get_policy_fixture(None)
        };
        let release_target = seed(&context, Some(policy)).await;
        let release = release_for(&context, &release_target).await;

        let first = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();

        context
            .version_service
            .create(&get_version_fixture(Some("2.0.0")), &None)
            .await
            .unwrap();
        let newer = release_for(&context, &release_target).await;

        for event in context.event_stream.receive("").await.unwrap() {
            context.event_stream.delete(&event, "").await.unwrap();
        }

        let guard = jobs.lock_row(&first.id).await.unwrap();
        context
            .job_lifecycle
            .dispatch(&release_target, &newer, &None)
            .await
            .unwrap()
            .unwrap();
        drop(guard);

        let still_pending = context
            .job_service
            .get_by_id(&first.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_pending.status, JobStatus::Pending);

        let queued: Vec<JobStatusUpdate> = context
            .event_stream
            .receive("")
            .await
            .unwrap()
            .iter()
            .filter(|event| event.model_type == ModelType::JobUpdate)
            .filter_map(|event| event.current_model::<JobStatusUpdate>().unwrap())
            .collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_id, first.id);
        assert_eq!(queued[0].status, JobStatus::Cancelled);

        let outcome = context
            .job_lifecycle
            .update_job(&job_update_event(&first.id, JobStatus::Cancelled))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            JobUpdateOutcome::Updated { ref job, .. } if job.status == JobStatus::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_success_reevaluates_dependent_targets() {
        let context = ServiceContext::memory();
        let release_target = seed(&context, None).await;

        let database = Deployment {
            id: "database".to_owned(),
            name: "database".to_owned(),
            ..get_deployment_fixture(None)
        };
        context
            .deployment_service
            .upsert(&database, &None)
            .await
            .unwrap();
        context
            .version_service
            .create(
                &crate::models::DeploymentVersion {
                    id: "database-1".to_owned(),
                    deployment_id: database.id.clone(),
                    dependencies: vec![VersionDependency {
                        deployment_id: release_target.deployment_id.clone(),
                        version_selector: Condition::Version {
                            operator: StringOperator::StartsWith,
                            value: "1.".to_owned(),
                        },
                    }],
                    ..get_version_fixture(Some("1.0.0"))
                },
                &None,
            )
            .await
            .unwrap();
        context
            .release_target_service
            .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
            .await
            .unwrap();

        let release = release_for(&context, &release_target).await;
        let job = context
            .job_lifecycle
            .dispatch(&release_target, &release, &None)
            .await
            .unwrap()
            .unwrap();

        // drop everything queued so far
        for event in context.event_stream.receive("").await.unwrap() {
            context.event_stream.delete(&event, "").await.unwrap();
        }

        context
            .job_lifecycle
            .update_job(&job_update_event(&job.id, JobStatus::Successful))
            .await
            .unwrap();

        let evaluated: Vec<String> = context
            .event_stream
            .receive("")
            .await
            .unwrap()
            .iter()
            .filter(|event| event.model_type == ModelType::Evaluation)
            .filter_map(|event| event.current_model::<crate::models::EvaluationRequest>().unwrap())
            .map(|request| request.release_target_id)
            .collect();

        let database_target = context
            .release_target_service
            .list_by_deployment(&database.id)
            .await
            .unwrap()
            .remove(0);

        assert!(evaluated.contains(&release_target.id));
        assert!(evaluated.contains(&database_target.id));
    }
}
