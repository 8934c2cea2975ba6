use chrono::Utc;
use serde::Serialize;
use shipyard_core::OperationId;
use std::sync::Arc;

use crate::{
    models::{Release, ReleaseTarget, ReleaseTargetLock},
    policy::{PolicyEngine, RuleContext},
    services::{
        ReleaseService, ReleaseTargetService, ReleaseUpsert, VariableService, VersionService,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum EvaluationResult {
    /// The target should run `release`; `created` is false when it already was the latest.
    Released { release: Release, created: bool },
    Blocked { reason: String },
    Locked { lock: ReleaseTargetLock },
}

/// What evaluating a release target would decide right now, without writing anything.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationPreview {
    pub release_target_id: String,
    pub locked_by: Option<String>,
    pub pinned_version_id: Option<String>,
    pub policy_ids: Vec<String>,
    pub allowed_version_ids: Vec<String>,
    pub selected_version_id: Option<String>,
    pub reason: Option<String>,
}

/// Decides which release each release target should run.
#[derive(Debug)]
pub struct ReleaseManager {
    pub policy_engine: Arc<PolicyEngine>,

    pub release_service: Arc<ReleaseService>,
    pub release_target_service: Arc<ReleaseTargetService>,
    pub variable_service: Arc<VariableService>,
    pub version_service: Arc<VersionService>,
}

impl ReleaseManager {
    /// Finds or creates the release of `version_id` with the variables resolved for the
    /// target's resource.
    #[tracing::instrument(name = "reconciliation::release_manager::upsert_release", skip_all)]
    pub async fn upsert_release(
        &self,
        context: &RuleContext,
        version_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<ReleaseUpsert> {
        let variables = self
            .variable_service
            .resolve(&context.deployment.id, &context.resource)
            .await?;

        self.release_service
            .upsert_release(&context.release_target, version_id, &variables, operation_id)
            .await
    }

    /// Evaluates a release target: an active lock blocks it, a pinned version bypasses the
    /// policy rules, otherwise the newest version the rules allow is released.
    ///
    /// Returns `None` when the target, or anything it refers to, no longer exists.
    #[tracing::instrument(name = "reconciliation::release_manager::evaluate", skip_all)]
    pub async fn evaluate(
        &self,
        release_target_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<Option<(ReleaseTarget, EvaluationResult)>> {
        let release_target = match self
            .release_target_service
            .get_by_id(release_target_id)
            .await?
        {
            Some(release_target) => release_target,
            None => return Ok(None),
        };

        let now = Utc::now();

        if let Some(lock) = self
            .release_target_service
            .get_active_lock(&release_target.id, now)
            .await?
        {
            return Ok(Some((release_target, EvaluationResult::Locked { lock })));
        }

        let context = match self.policy_engine.load_context(&release_target, now).await? {
            Some(context) => context,
            None => return Ok(None),
        };

        let version_id = match release_target.desired_version_id.clone() {
            Some(pinned_version_id) => {
                match self.version_service.get_by_id(&pinned_version_id).await? {
                    Some(version) => version.id,
                    None => {
                        return Ok(Some((
                            release_target,
                            EvaluationResult::Blocked {
                                reason: format!("pinned version {} not found", pinned_version_id),
                            },
                        )))
                    }
                }
            }
            None => {
                let evaluation = self.policy_engine.evaluate(&context).await?;

                match evaluation.selected() {
                    Some(version) => version.id.clone(),
                    None => {
                        let reason = evaluation
                            .reason
                            .unwrap_or_else(|| "no eligible release".to_owned());

                        return Ok(Some((release_target, EvaluationResult::Blocked { reason })));
                    }
                }
            }
        };

        let ReleaseUpsert { created, release } = self
            .upsert_release(&context, &version_id, operation_id)
            .await?;

        Ok(Some((
            release_target,
            EvaluationResult::Released { release, created },
        )))
    }

    #[tracing::instrument(name = "reconciliation::release_manager::preview", skip_all)]
    pub async fn preview(&self, release_target_id: &str) -> anyhow::Result<Option<EvaluationPreview>> {
        let release_target = match self
            .release_target_service
            .get_by_id(release_target_id)
            .await?
        {
            Some(release_target) => release_target,
            None => return Ok(None),
        };

        let now = Utc::now();
        let lock = self
            .release_target_service
            .get_active_lock(&release_target.id, now)
            .await?;

        let context = match self.policy_engine.load_context(&release_target, now).await? {
            Some(context) => context,
            None => return Ok(None),
        };

        let evaluation = self.policy_engine.evaluate(&context).await?;

        let selected_version_id = match (&lock, &release_target.desired_version_id) {
            (Some(_), _) => None,
            (None, Some(pinned_version_id)) => Some(pinned_version_id.clone()),
            (None, None) => evaluation.selected().map(|version| version.id.clone()),
        };

        Ok(Some(EvaluationPreview {
            release_target_id: release_target.id.clone(),
            locked_by: lock.map(|lock| lock.locked_by),
            pinned_version_id: release_target.desired_version_id.clone(),
            policy_ids: evaluation.policy_ids,
            allowed_version_ids: evaluation
                .allowed
                .iter()
                .map(|version| version.id.clone())
                .collect(),
            selected_version_id,
            reason: evaluation.reason,
        }))
    }
}
