use chrono::{DateTime, Utc};
use shipyard_core::{
    create_event, Event, EventStream, EventType, LockOutcome, ModelType, OperationId,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use uuid::Uuid;

use super::{
    DeploymentService, EnvironmentService, MembershipService, ResourceService, VersionService,
};
use crate::{
    errors::ServiceError,
    models::{
        EvaluationRequest, ExitHook, MembershipScope, ReleaseTarget, ReleaseTargetLock,
    },
    persistence::{LockPersistence, ReleaseTargetPersistence},
};

/// Release targets added and removed by one resync.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResyncResult {
    pub created: Vec<ReleaseTarget>,
    pub deleted: Vec<ReleaseTarget>,
}

/// Version to pin a release target to, by id or by tag.
#[derive(Clone, Debug, Default, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PinVersion {
    pub version_id: Option<String>,
    pub version_tag: Option<String>,
}

pub fn make_evaluation_dedup_key(release_target_id: &str) -> String {
    format!("evaluate:{}", release_target_id)
}

/// Unit of work asking for a release target to be evaluated.
pub fn make_evaluation_event(
    release_target: &ReleaseTarget,
    operation_id: &OperationId,
) -> anyhow::Result<Event> {
    let request = EvaluationRequest {
        release_target_id: release_target.id.clone(),
    };

    Ok(create_event(
        &None,
        &Some(request),
        EventType::Requested,
        ModelType::Evaluation,
        &release_target.workspace_id,
        operation_id,
    )?
    .with_dedup_key(make_evaluation_dedup_key(&release_target.id)))
}

#[derive(Debug)]
pub struct ReleaseTargetService {
    pub persistence: Arc<dyn ReleaseTargetPersistence>,
    pub lock_persistence: Box<dyn LockPersistence>,
    pub event_stream: Arc<dyn EventStream>,

    pub deployment_service: Arc<DeploymentService>,
    pub environment_service: Arc<EnvironmentService>,
    pub membership_service: Arc<MembershipService>,
    pub resource_service: Arc<ResourceService>,
    pub version_service: Arc<VersionService>,
}

impl ReleaseTargetService {
    /// Brings the release targets of `resource_ids` in line with current membership.
    ///
    /// A target exists for (resource, environment, deployment) when the environment and
    /// deployment share a system and the resource is a member of both.
    #[tracing::instrument(name = "service::release_target::resync", skip_all)]
    pub async fn resync(
        &self,
        workspace_id: &str,
        resource_ids: &[String],
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<LockOutcome<ResyncResult>> {
        if self
            .membership_service
            .refresh_catalog(workspace_id)
            .await?
            .is_contended()
        {
            return Ok(LockOutcome::Contended);
        }

        let in_scope: HashSet<&String> = resource_ids.iter().collect();
        let live_resource_ids: HashSet<String> = self
            .resource_service
            .list_by_workspace(workspace_id)
            .await?
            .into_iter()
            .map(|resource| resource.id)
            .filter(|resource_id| in_scope.contains(resource_id))
            .collect();

        let environments = self
            .environment_service
            .list_by_workspace(workspace_id)
            .await?;
        let deployments = self
            .deployment_service
            .list_by_workspace(workspace_id)
            .await?;

        let mut deployment_members = HashMap::new();
        for deployment in deployments.iter() {
            let members: HashSet<String> = self
                .membership_service
                .list_members(&MembershipScope::deployment(&deployment.id))
                .await?
                .into_iter()
                .collect();
            deployment_members.insert(deployment.id.clone(), members);
        }

        let mut desired = HashSet::new();
        for environment in environments.iter() {
            let environment_members = self
                .membership_service
                .list_members(&MembershipScope::environment(&environment.id))
                .await?;

            for resource_id in environment_members
                .iter()
                .filter(|resource_id| live_resource_ids.contains(*resource_id))
            {
                for deployment in deployments
                    .iter()
                    .filter(|deployment| deployment.system_id == environment.system_id)
                {
                    let is_member = deployment_members
                        .get(&deployment.id)
                        .map(|members| members.contains(resource_id))
                        .unwrap_or(false);

                    if is_member {
                        desired.insert((
                            resource_id.clone(),
                            environment.id.clone(),
                            deployment.id.clone(),
                        ));
                    }
                }
            }
        }

        let existing: Vec<ReleaseTarget> = self
            .persistence
            .list_by_resource_ids(resource_ids)
            .await?
            .into_iter()
            .filter(|release_target| release_target.workspace_id == workspace_id)
            .collect();
        let existing_triples: HashSet<(String, String, String)> =
            existing.iter().map(|release_target| release_target.triple()).collect();

        let now = Utc::now();
        let mut created: Vec<ReleaseTarget> = desired
            .difference(&existing_triples)
            .map(|(resource_id, environment_id, deployment_id)| ReleaseTarget {
                id: Uuid::new_v4().to_string(),
                workspace_id: workspace_id.to_string(),
                resource_id: resource_id.clone(),
                environment_id: environment_id.clone(),
                deployment_id: deployment_id.clone(),
                desired_version_id: None,
                created_at: now,
            })
            .collect();
        created.sort_by(|a, b| a.triple().cmp(&b.triple()));

        let (deleted, surviving): (Vec<ReleaseTarget>, Vec<ReleaseTarget>) = existing
            .into_iter()
            .partition(|release_target| !desired.contains(&release_target.triple()));

        let deleted_ids: Vec<String> = deleted.iter().map(|rt| rt.id.clone()).collect();
        if !created.is_empty() || !deleted.is_empty() {
            self.persistence.apply_changes(&created, &deleted_ids).await?;
        }

        for release_target_id in deleted_ids.iter() {
            self.lock_persistence
                .delete_by_release_target(release_target_id)
                .await?;
            self.membership_service
                .detach_release_target(release_target_id)
                .await?;
        }

        // resources and selectors may have moved targets in or out of policy targets
        let policies_outcome = self.membership_service.refresh_policies(workspace_id).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let mut events = Vec::new();

        for release_target in created.iter() {
            events.push(create_event(
                &None,
                &Some(release_target.clone()),
                EventType::Created,
                ModelType::ReleaseTarget,
                workspace_id,
                &operation_id,
            )?);
        }

        for release_target in deleted.iter() {
            events.push(create_event(
                &Some(release_target.clone()),
                &None,
                EventType::Deleted,
                ModelType::ReleaseTarget,
                workspace_id,
                &operation_id,
            )?);
        }

        // surviving targets are re-evaluated too: their policies or variables may differ now
        for release_target in created.iter().chain(surviving.iter()) {
            events.push(make_evaluation_event(release_target, &operation_id)?);
        }

        if events.is_empty() {
            return Ok(policies_outcome.map(|_| ResyncResult::default()));
        }

        self.event_stream.send_many(&events).await?;

        if let Err(err) = self
            .send_exit_hooks(workspace_id, &deleted, &operation_id)
            .await
        {
            tracing::error!("failed to send exit hooks: {:?}", err);
        }

        tracing::info!(
            "release targets resynced for {} resources: {} created, {} deleted, {} kept",
            resource_ids.len(),
            created.len(),
            deleted.len(),
            surviving.len()
        );

        Ok(policies_outcome.map(|_| ResyncResult { created, deleted }))
    }

    async fn send_exit_hooks(
        &self,
        workspace_id: &str,
        deleted: &[ReleaseTarget],
        operation_id: &OperationId,
    ) -> anyhow::Result<()> {
        let mut exits: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for release_target in deleted {
            exits
                .entry((
                    release_target.deployment_id.clone(),
                    release_target.resource_id.clone(),
                ))
                .or_default()
                .push(release_target.id.clone());
        }

        let mut events = Vec::new();
        for ((deployment_id, resource_id), release_target_ids) in exits {
            let dedup_key = format!("exit-hook:{}:{}", deployment_id, resource_id);
            let exit_hook = ExitHook {
                deployment_id,
                resource_id,
                release_target_ids,
            };

            events.push(
                create_event(
                    &None,
                    &Some(exit_hook),
                    EventType::Requested,
                    ModelType::ExitHook,
                    workspace_id,
                    operation_id,
                )?
                .with_dedup_key(dedup_key),
            );
        }

        if !events.is_empty() {
            self.event_stream.send_many(&events).await?;
        }

        Ok(())
    }

    /// Resyncs every live resource of a workspace plus the resources of its existing targets.
    #[tracing::instrument(name = "service::release_target::resync_workspace", skip_all)]
    pub async fn resync_workspace(
        &self,
        workspace_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<LockOutcome<ResyncResult>> {
        let mut resource_ids: Vec<String> = self
            .resource_service
            .list_by_workspace(workspace_id)
            .await?
            .into_iter()
            .map(|resource| resource.id)
            .collect();

        resource_ids.extend(
            self.persistence
                .list_by_workspace(workspace_id)
                .await?
                .into_iter()
                .map(|release_target| release_target.resource_id),
        );
        resource_ids.sort();
        resource_ids.dedup();

        self.resync(workspace_id, &resource_ids, operation_id).await
    }

    #[tracing::instrument(name = "service::release_target::enqueue_evaluations", skip_all)]
    pub async fn enqueue_evaluations(
        &self,
        release_targets: &[ReleaseTarget],
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<usize> {
        if release_targets.is_empty() {
            return Ok(0);
        }

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let events = release_targets
            .iter()
            .map(|release_target| make_evaluation_event(release_target, &operation_id))
            .collect::<anyhow::Result<Vec<Event>>>()?;

        self.event_stream.send_many(&events).await?;

        Ok(events.len())
    }

    async fn get_existing(&self, release_target_id: &str) -> anyhow::Result<ReleaseTarget> {
        match self.persistence.get_by_id(release_target_id).await? {
            Some(release_target) => Ok(release_target),
            None => Err(ServiceError::NotFound(format!(
                "release target {} not found",
                release_target_id
            ))
            .into()),
        }
    }

    async fn save_and_reevaluate(
        &self,
        previous: ReleaseTarget,
        release_target: &ReleaseTarget,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<()> {
        self.persistence.upsert(release_target).await?;

        let operation_id = OperationId::unwrap_or_create(operation_id);
        let events = vec![
            create_event(
                &Some(previous),
                &Some(release_target.clone()),
                EventType::Updated,
                ModelType::ReleaseTarget,
                &release_target.workspace_id,
                &operation_id,
            )?,
            make_evaluation_event(release_target, &operation_id)?,
        ];

        self.event_stream.send_many(&events).await
    }

    /// Forces the version a release target runs, bypassing policy evaluation.
    #[tracing::instrument(name = "service::release_target::pin", skip_all)]
    pub async fn pin(
        &self,
        release_target_id: &str,
        pin: &PinVersion,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<ReleaseTarget> {
        let previous = self.get_existing(release_target_id).await?;

        let version = match (&pin.version_id, &pin.version_tag) {
            (Some(version_id), None) => self.version_service.get_by_id(version_id).await?,
            (None, Some(version_tag)) => {
                self.version_service
                    .get_by_tag(&previous.deployment_id, version_tag)
                    .await?
            }
            _ => {
                return Err(ServiceError::Validation(
                    "exactly one of versionId or versionTag is required".to_owned(),
                )
                .into())
            }
        };

        let version = match version {
            Some(version) if version.deployment_id == previous.deployment_id => version,
            _ => {
                return Err(ServiceError::NotFound(format!(
                    "version not found for deployment {}",
                    previous.deployment_id
                ))
                .into())
            }
        };

        let release_target = ReleaseTarget {
            desired_version_id: Some(version.id.clone()),
            ..previous.clone()
        };
        self.save_and_reevaluate(previous, &release_target, operation_id)
            .await?;

        tracing::info!(
            "release target {} pinned to version {}",
            release_target_id,
            version.tag
        );

        Ok(release_target)
    }

    #[tracing::instrument(name = "service::release_target::unpin", skip_all)]
    pub async fn unpin(
        &self,
        release_target_id: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<ReleaseTarget> {
        let previous = self.get_existing(release_target_id).await?;

        let release_target = ReleaseTarget {
            desired_version_id: None,
            ..previous.clone()
        };
        self.save_and_reevaluate(previous, &release_target, operation_id)
            .await?;

        Ok(release_target)
    }

    /// Stops new releases reaching a target until it is unlocked or the lock expires.
    #[tracing::instrument(name = "service::release_target::lock", skip_all)]
    pub async fn lock(
        &self,
        release_target_id: &str,
        locked_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<ReleaseTargetLock> {
        let release_target = self.get_existing(release_target_id).await?;
        let now = Utc::now();

        if let Some(expires_at) = expires_at {
            if expires_at <= now {
                return Err(
                    ServiceError::Validation("lock expiry must be in the future".to_owned())
                        .into(),
                );
            }
        }

        if let Some(active) = self
            .lock_persistence
            .get_active(&release_target.id, now)
            .await?
        {
            return Err(ServiceError::Conflict(format!(
                "release target {} is already locked by {}",
                release_target.id, active.locked_by
            ))
            .into());
        }

        let lock = ReleaseTargetLock {
            id: Uuid::new_v4().to_string(),
            release_target_id: release_target.id.clone(),
            locked_by: locked_by.to_string(),
            locked_at: now,
            expires_at,
            unlocked_at: None,
            unlocked_by: None,
        };
        self.lock_persistence.upsert(&lock).await?;

        tracing::info!("release target {} locked by {}", release_target.id, locked_by);

        Ok(lock)
    }

    /// Clears the active lock of a target. Only the principal holding it may do so.
    #[tracing::instrument(name = "service::release_target::unlock", skip_all)]
    pub async fn unlock(
        &self,
        release_target_id: &str,
        unlocked_by: &str,
        operation_id: &Option<OperationId>,
    ) -> anyhow::Result<ReleaseTargetLock> {
        let release_target = self.get_existing(release_target_id).await?;
        let now = Utc::now();

        let lock = match self
            .lock_persistence
            .get_active(&release_target.id, now)
            .await?
        {
            Some(lock) => lock,
            None => {
                return Err(ServiceError::NotFound(format!(
                    "release target {} has no active lock",
                    release_target.id
                ))
                .into())
            }
        };

        if lock.locked_by != unlocked_by {
            return Err(ServiceError::Forbidden(format!(
                "release target {} is locked by another principal",
                release_target.id
            ))
            .into());
        }

        let lock = ReleaseTargetLock {
            unlocked_at: Some(now),
            unlocked_by: Some(unlocked_by.to_string()),
            ..lock
        };
        self.lock_persistence.upsert(&lock).await?;

        self.enqueue_evaluations(&[release_target], operation_id)
            .await?;

        tracing::info!("release target {} unlocked by {}", release_target_id, unlocked_by);

        Ok(lock)
    }

    pub async fn get_active_lock(
        &self,
        release_target_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ReleaseTargetLock>> {
        self.lock_persistence
            .get_active(release_target_id, now)
            .await
    }

    #[tracing::instrument(name = "service::release_target::get_by_id", skip_all)]
    pub async fn get_by_id(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Option<ReleaseTarget>> {
        self.persistence.get_by_id(release_target_id).await
    }

    pub async fn list_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.persistence.list_by_deployment(deployment_id).await
    }

    pub async fn list_by_environment(
        &self,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.persistence.list_by_environment(environment_id).await
    }

    pub async fn list_by_resource_ids(
        &self,
        resource_ids: &[String],
    ) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.persistence.list_by_resource_ids(resource_ids).await
    }

    pub async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<ReleaseTarget>> {
        self.persistence.list_by_workspace(workspace_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ServiceContext,
        models::{Deployment, Environment, Resource},
        test::{
            get_deployment_fixture, get_environment_fixture, get_resource_fixture,
            get_version_fixture, WORKSPACE_FIXTURE_ID,
        },
    };
    use shipyard_core::Condition;

    async fn seed(context: &ServiceContext, resources: &[Resource]) {
        context
            .resource_service
            .persistence
            .upsert_many(resources)
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
    }

    fn acquired(outcome: LockOutcome<ResyncResult>) -> ResyncResult {
        match outcome {
            LockOutcome::Acquired(result) => result,
            LockOutcome::Contended => panic!("unexpected contention"),
        }
    }

    #[tokio::test]
    async fn test_resync_creates_targets_for_matching_resources() {
        let context = ServiceContext::memory();

        let cluster = get_resource_fixture(Some("cluster-a"));
        let vm = Resource {
            kind: "vm".to_owned(),
            ..get_resource_fixture(Some("vm-b"))
        };
        seed(&context, &[cluster.clone(), vm]).await;

        let result = acquired(
            context
                .release_target_service
                .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
                .await
                .unwrap(),
        );
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.created[0].resource_id, cluster.id);

        let again = acquired(
            context
                .release_target_service
                .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
                .await
                .unwrap(),
        );
        assert_eq!(again, ResyncResult::default());
    }

    #[tokio::test]
    async fn test_resync_deletes_targets_when_selector_stops_matching() {
        let context = ServiceContext::memory();
        let cluster = get_resource_fixture(Some("cluster-a"));
        seed(&context, &[cluster.clone()]).await;

        let created = acquired(
            context
                .release_target_service
                .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
                .await
                .unwrap(),
        )
        .created;
        assert_eq!(created.len(), 1);

        context
            .release_target_service
            .lock(&created[0].id, "user-1", None)
            .await
            .unwrap();

        let narrowed = Deployment {
            resource_selector: Some(Condition::Kind {
                value: "vm".to_owned(),
            }),
            ..get_deployment_fixture(None)
        };
        context
            .deployment_service
            .upsert(&narrowed, &None)
            .await
            .unwrap();

        let result = acquired(
            context
                .release_target_service
                .resync(WORKSPACE_FIXTURE_ID, &[cluster.id.clone()], &None)
                .await
                .unwrap(),
        );
        assert_eq!(result.deleted.len(), 1);
        assert!(context
            .release_target_service
            .get_active_lock(&created[0].id, Utc::now())
            .await
            .unwrap()
            .is_none());

        let events = context.event_stream.receive("").await.unwrap();
        assert!(events
            .iter()
            .any(|event| event.model_type == ModelType::ExitHook));
    }

    #[tokio::test]
    async fn test_resync_pairs_within_system_only() {
        let context = ServiceContext::memory();
        let cluster = get_resource_fixture(Some("cluster-a"));
        seed(&context, &[cluster]).await;

        let elsewhere = Environment {
            id: "other-system-environment".to_owned(),
            system_id: "other-system".to_owned(),
            ..get_environment_fixture(None)
        };
        context
            .environment_service
            .upsert(&elsewhere, &None)
            .await
            .unwrap();

        let result = acquired(
            context
                .release_target_service
                .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
                .await
                .unwrap(),
        );
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.created[0].environment_id, "environment-fixture");
    }

    #[tokio::test]
    async fn test_pin_lock_unlock() {
        let context = ServiceContext::memory();
        seed(&context, &[get_resource_fixture(None)]).await;

        let version = get_version_fixture(None);
        context
            .version_service
            .create(&version, &None)
            .await
            .unwrap();

        let release_target = acquired(
            context
                .release_target_service
                .resync_workspace(WORKSPACE_FIXTURE_ID, &None)
                .await
                .unwrap(),
        )
        .created
        .remove(0);

        let pinned = context
            .release_target_service
            .pin(
                &release_target.id,
                &PinVersion {
                    version_id: None,
                    version_tag: Some(version.tag.clone()),
                },
                &None,
            )
            .await
            .unwrap();
        assert_eq!(pinned.desired_version_id, Some(version.id.clone()));

        let err = context
            .release_target_service
            .pin(&release_target.id, &PinVersion::default(), &None)
            .await
            .unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::Validation(_)));

        context
            .release_target_service
            .lock(&release_target.id, "user-1", None)
            .await
            .unwrap();

        let err = context
            .release_target_service
            .unlock(&release_target.id, "user-2", &None)
            .await
            .unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::Forbidden(_)));

        let lock = context
            .release_target_service
            .unlock(&release_target.id, "user-1", &None)
            .await
            .unwrap();
        assert_eq!(lock.unlocked_by.as_deref(), Some("user-1"));

        let err = context
            .release_target_service
            .unlock(&release_target.id, "user-1", &None)
            .await
            .unwrap_err();
        assert!(matches!(ServiceError::from(err), ServiceError::NotFound(_)));
    }
}
