// The reconciler consumes the event stream and keeps derived state converged: membership,
// release targets, releases and jobs. Every handler recomputes from current state, so
// redelivered or reordered events are harmless. Work that hits a held lock is put back on
// the stream instead of waiting.

use shipyard_core::{Event, EventStream, EventType, LockOutcome, ModelType};
use std::{collections::BTreeSet, sync::Arc};

use super::{EvaluationResult, JobLifecycle, JobUpdateOutcome, ReleaseManager};
use crate::{
    models::{
        Deployment, DeploymentVariable, DeploymentVersion, Environment, EvaluationRequest,
        MembershipScope, Policy, ReleaseTarget, Resource,
    },
    services::{MembershipService, ReleaseTargetService},
};

#[derive(Debug)]
pub struct Reconciler {
    pub event_stream: Arc<dyn EventStream>,

    pub job_lifecycle: Arc<JobLifecycle>,
    pub membership_service: Arc<MembershipService>,
    pub release_manager: Arc<ReleaseManager>,
    pub release_target_service: Arc<ReleaseTargetService>,
}

impl Reconciler {
    #[tracing::instrument(name = "reconciliation::reconciler::process", skip_all, fields(event_id = %event.id, model_type = %event.model_type))]
    pub async fn process(&self, event: &Event) -> anyhow::Result<()> {
        match event.model_type {
            ModelType::Resource => self.process_resource_event(event).await,
            ModelType::Environment => self.process_environment_event(event).await,
            ModelType::Deployment => self.process_deployment_event(event).await,
            ModelType::DeploymentVersion => self.process_version_event(event).await,
            ModelType::DeploymentVariable => self.process_variable_event(event).await,
            ModelType::Policy => self.process_policy_event(event).await,
            ModelType::Selector => self.process_selector_event(event).await,
            ModelType::Evaluation => self.process_evaluation_event(event).await,
            ModelType::JobUpdate => self.process_job_update_event(event).await,
            model_type => {
                tracing::debug!("no reconciliation for model type {}", model_type);
                Ok(())
            }
        }
    }

    async fn requeue(&self, event: &Event) -> anyhow::Result<()> {
        tracing::info!("event {} hit a held lock, requeueing", event.id);
        self.event_stream.send(&event.requeued()).await
    }

    async fn resync_workspace(&self, event: &Event) -> anyhow::Result<()> {
        let operation_id = Some(event.operation_id.clone());

        match self
            .release_target_service
            .resync_workspace(&event.workspace_id, &operation_id)
            .await?
        {
            LockOutcome::Contended => self.requeue(event).await,
            LockOutcome::Acquired(result) => {
                tracing::info!(
                    "workspace {} resynced: {} release targets created, {} deleted",
                    event.workspace_id,
                    result.created.len(),
                    result.deleted.len()
                );
                Ok(())
            }
        }
    }

    async fn clear_scope(&self, event: &Event, scope: &MembershipScope) -> anyhow::Result<bool> {
        if self.membership_service.clear(scope).await?.is_contended() {
            self.requeue(event).await?;
            return Ok(false);
        }

        Ok(true)
    }

    #[tracing::instrument(skip_all)]
    async fn process_resource_event(&self, event: &Event) -> anyhow::Result<()> {
        let resource: Resource = event.current_or_previous_model()?;
        let operation_id = Some(event.operation_id.clone());

        match self
            .release_target_service
            .resync(&event.workspace_id, &[resource.id.clone()], &operation_id)
            .await?
        {
            LockOutcome::Contended => self.requeue(event).await,
            LockOutcome::Acquired(_) => Ok(()),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn process_environment_event(&self, event: &Event) -> anyhow::Result<()> {
        if event.event_type == EventType::Deleted {
            let environment: Environment = event.current_or_previous_model()?;
            if !self
                .clear_scope(event, &MembershipScope::environment(&environment.id))
                .await?
            {
                return Ok(());
            }
        }

        self.resync_workspace(event).await
    }

    #[tracing::instrument(skip_all)]
    async fn process_deployment_event(&self, event: &Event) -> anyhow::Result<()> {
        if event.event_type == EventType::Deleted {
            let deployment: Deployment = event.current_or_previous_model()?;
            if !self
                .clear_scope(event, &MembershipScope::deployment(&deployment.id))
                .await?
            {
                return Ok(());
            }
        }

        self.resync_workspace(event).await
    }

    #[tracing::instrument(skip_all)]
    async fn process_selector_event(&self, event: &Event) -> anyhow::Result<()> {
        self.resync_workspace(event).await
    }

    async fn evaluate_deployment(&self, event: &Event, deployment_id: &str) -> anyhow::Result<()> {
        let release_targets = self
            .release_target_service
            .list_by_deployment(deployment_id)
            .await?;

        let enqueued = self
            .release_target_service
            .enqueue_evaluations(&release_targets, &Some(event.operation_id.clone()))
            .await?;

        tracing::debug!(
            "{} evaluations enqueued for deployment {}",
            enqueued,
            deployment_id
        );

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn process_version_event(&self, event: &Event) -> anyhow::Result<()> {
        let version: DeploymentVersion = event.current_or_previous_model()?;
        self.evaluate_deployment(event, &version.deployment_id).await
    }

    #[tracing::instrument(skip_all)]
    async fn process_variable_event(&self, event: &Event) -> anyhow::Result<()> {
        let variable: DeploymentVariable = event.current_or_previous_model()?;
        self.evaluate_deployment(event, &variable.deployment_id).await
    }

    /// Recomputes the targets of a policy and re-evaluates every release target that was
    /// or is now covered by it.
    #[tracing::instrument(skip_all)]
    async fn process_policy_event(&self, event: &Event) -> anyhow::Result<()> {
        let previous: Option<Policy> = event.previous_model()?;
        let current: Option<Policy> = match event.event_type {
            EventType::Deleted => None,
            _ => event.current_model()?,
        };

        let current_target_ids: BTreeSet<String> = current
            .iter()
            .flat_map(|policy| policy.targets.iter().map(|target| target.id.clone()))
            .collect();

        let mut affected_ids = BTreeSet::new();

        if let Some(previous) = &previous {
            for target in previous.targets.iter() {
                let scope = MembershipScope::policy_target(&target.id);
                affected_ids.extend(self.membership_service.list_members(&scope).await?);

                if !current_target_ids.contains(&target.id) && !self.clear_scope(event, &scope).await? {
                    return Ok(());
                }
            }
        }

        if let Some(current) = &current {
            match self.membership_service.refresh_policy(current).await? {
                LockOutcome::Contended => return self.requeue(event).await,
                LockOutcome::Acquired(release_target_ids) => affected_ids.extend(release_target_ids),
            }
        }

        let mut release_targets: Vec<ReleaseTarget> = Vec::new();
        for release_target_id in affected_ids.iter() {
            if let Some(release_target) = self
                .release_target_service
                .get_by_id(release_target_id)
                .await?
            {
                release_targets.push(release_target);
            }
        }

        self.release_target_service
            .enqueue_evaluations(&release_targets, &Some(event.operation_id.clone()))
            .await?;

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn process_evaluation_event(&self, event: &Event) -> anyhow::Result<()> {
        let request: EvaluationRequest = event.current_or_previous_model()?;
        let operation_id = Some(event.operation_id.clone());

        let (release_target, result) = match self
            .release_manager
            .evaluate(&request.release_target_id, &operation_id)
            .await?
        {
            Some(evaluated) => evaluated,
            None => {
                tracing::debug!(
                    "release target {} is gone, nothing to evaluate",
                    request.release_target_id
                );
                return Ok(());
            }
        };

        match result {
            EvaluationResult::Released { release, created } => {
                if created {
                    tracing::info!(
                        "release {} of version {} created for target {}",
                        release.id,
                        release.version_id,
                        release_target.id
                    );
                }

                self.job_lifecycle
                    .dispatch(&release_target, &release, &operation_id)
                    .await?;
            }
            EvaluationResult::Blocked { reason } => {
                tracing::info!("release target {} blocked: {}", release_target.id, reason);
            }
            EvaluationResult::Locked { lock } => {
                tracing::info!(
                    "release target {} is locked by {}",
                    release_target.id,
                    lock.locked_by
                );
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn process_job_update_event(&self, event: &Event) -> anyhow::Result<()> {
        match self.job_lifecycle.update_job(event).await? {
            JobUpdateOutcome::Updated {
                job,
                retried: Some(retried),
            } => {
                tracing::info!("job {} failed, retried as {}", job.id, retried.id);
            }
            JobUpdateOutcome::Updated { job, retried: None } => {
                tracing::debug!("job {} is {}", job.id, job.status);
            }
            JobUpdateOutcome::NotFound | JobUpdateOutcome::Requeued => {}
        }

        Ok(())
    }
}
