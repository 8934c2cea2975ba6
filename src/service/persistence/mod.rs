use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;

use shipyard_core::{LockOutcome, Persistence};

use crate::models::{
    ApprovalRecord, Deployment, DeploymentVariable, DeploymentVersion, Environment, Job,
    JobStatusUpdate, JobTransition, MembershipKind, MembershipScope, Policy, Release,
    ReleaseTarget, ReleaseTargetLock, Resource, ResourceRelationship,
};

pub mod memory;
pub mod relational;

#[async_trait]
pub trait ResourcePersistence: Debug + Persistence<Resource> {
    async fn upsert_many(&self, resources: &[Resource]) -> anyhow::Result<u64>;
    async fn get_by_identifier(
        &self,
        workspace_id: &str,
        identifier: &str,
    ) -> anyhow::Result<Option<Resource>>;
    /// Live (not soft-deleted) resources of a workspace.
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Resource>>;
    async fn list_by_provider(
        &self,
        workspace_id: &str,
        provider_id: &str,
    ) -> anyhow::Result<Vec<Resource>>;
    async fn soft_delete(&self, resource_ids: &[String], now: DateTime<Utc>)
        -> anyhow::Result<u64>;
}

#[async_trait]
pub trait ResourceRelationshipPersistence: Debug + Persistence<ResourceRelationship> {
    async fn get_children(&self, parent_id: &str) -> anyhow::Result<Vec<ResourceRelationship>>;
    async fn get_parents(&self, child_id: &str) -> anyhow::Result<Vec<ResourceRelationship>>;
}

#[async_trait]
pub trait EnvironmentPersistence: Debug + Persistence<Environment> {
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Environment>>;
    async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Environment>>;
}

#[async_trait]
pub trait DeploymentPersistence: Debug + Persistence<Deployment> {
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Deployment>>;
    async fn list_by_system(&self, system_id: &str) -> anyhow::Result<Vec<Deployment>>;
}

#[async_trait]
pub trait VersionPersistence: Debug + Persistence<DeploymentVersion> {
    /// Ready versions of a deployment, newest first.
    async fn list_ready_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>>;
    async fn get_by_tag(
        &self,
        deployment_id: &str,
        tag: &str,
    ) -> anyhow::Result<Option<DeploymentVersion>>;
    /// Versions declaring a dependency on `deployment_id`.
    async fn list_depending_on(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVersion>>;
}

#[async_trait]
pub trait VariablePersistence: Debug + Persistence<DeploymentVariable> {
    async fn list_by_deployment(
        &self,
        deployment_id: &str,
    ) -> anyhow::Result<Vec<DeploymentVariable>>;
}

#[async_trait]
pub trait PolicyPersistence: Debug + Persistence<Policy> {
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<Policy>>;
    async fn list_by_target_ids(&self, policy_target_ids: &[String])
        -> anyhow::Result<Vec<Policy>>;
}

/// Computed selector membership rows of (owner, entity).
#[async_trait]
pub trait MembershipPersistence: Debug + Send + Sync {
    /// Replaces every row of `scope` under a no-wait lock on the scope.
    async fn replace(
        &self,
        scope: &MembershipScope,
        entity_ids: &[String],
    ) -> anyhow::Result<LockOutcome<u64>>;
    async fn list_entities(&self, scope: &MembershipScope) -> anyhow::Result<Vec<String>>;
    async fn list_owners(&self, kind: MembershipKind, entity_id: &str)
        -> anyhow::Result<Vec<String>>;
    async fn delete_entity(&self, kind: MembershipKind, entity_id: &str) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait ReleaseTargetPersistence: Debug + Persistence<ReleaseTarget> {
    async fn list_by_resource_ids(
        &self,
        resource_ids: &[String],
    ) -> anyhow::Result<Vec<ReleaseTarget>>;
    async fn list_by_deployment(&self, deployment_id: &str) -> anyhow::Result<Vec<ReleaseTarget>>;
    async fn list_by_environment(
        &self,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ReleaseTarget>>;
    async fn list_by_workspace(&self, workspace_id: &str) -> anyhow::Result<Vec<ReleaseTarget>>;
    async fn get_by_triple(
        &self,
        resource_id: &str,
        environment_id: &str,
        deployment_id: &str,
    ) -> anyhow::Result<Option<ReleaseTarget>>;
    /// Inserts and deletes release targets in a single transaction.
    async fn apply_changes(
        &self,
        created: &[ReleaseTarget],
        deleted_ids: &[String],
    ) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait ReleasePersistence: Debug + Persistence<Release> {
    async fn get_latest(&self, release_target_id: &str) -> anyhow::Result<Option<Release>>;
    async fn list_by_release_target(&self, release_target_id: &str)
        -> anyhow::Result<Vec<Release>>;
}

#[async_trait]
pub trait JobPersistence: Debug + Persistence<Job> {
    /// Stores a job and links it to its release.
    async fn create_for_release(&self, job: &Job) -> anyhow::Result<u64>;
    /// Applies a status report under a no-wait row lock on the job.
    ///
    /// Returns `Acquired(None)` when the job does not exist.
    async fn update_status(
        &self,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
    ) -> anyhow::Result<LockOutcome<Option<JobTransition>>>;
    async fn list_by_release(&self, release_id: &str) -> anyhow::Result<Vec<Job>>;
    /// Jobs of a release target, newest first.
    async fn list_by_release_target(&self, release_target_id: &str) -> anyhow::Result<Vec<Job>>;
    async fn list_active_by_release_target(
        &self,
        release_target_id: &str,
    ) -> anyhow::Result<Vec<Job>>;
}

#[async_trait]
pub trait ApprovalPersistence: Debug + Persistence<ApprovalRecord> {
    async fn list_by_version_and_environment(
        &self,
        deployment_version_id: &str,
        environment_id: &str,
    ) -> anyhow::Result<Vec<ApprovalRecord>>;
}

#[async_trait]
pub trait LockPersistence: Debug + Persistence<ReleaseTargetLock> {
    async fn get_active(
        &self,
        release_target_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ReleaseTargetLock>>;
    async fn delete_by_release_target(&self, release_target_id: &str) -> anyhow::Result<u64>;
}

/// One persistence backend for every model.
#[derive(Debug)]
pub struct PersistenceSet {
    pub approvals: Box<dyn ApprovalPersistence>,
    pub deployments: Box<dyn DeploymentPersistence>,
    pub environments: Box<dyn EnvironmentPersistence>,
    pub jobs: Box<dyn JobPersistence>,
    pub locks: Box<dyn LockPersistence>,
    pub memberships: Box<dyn MembershipPersistence>,
    pub policies: Box<dyn PolicyPersistence>,
    pub relationships: Box<dyn ResourceRelationshipPersistence>,
    pub releases: Box<dyn ReleasePersistence>,
    pub release_targets: Arc<dyn ReleaseTargetPersistence>,
    pub resources: Box<dyn ResourcePersistence>,
    pub variables: Box<dyn VariablePersistence>,
    pub versions: Box<dyn VersionPersistence>,
}

impl PersistenceSet {
    pub fn memory() -> Self {
        use memory::{JobMemoryPersistence, MembershipMemoryPersistence, MemoryPersistence};

        Self {
            approvals: Box::new(MemoryPersistence::<ApprovalRecord>::default()),
            deployments: Box::new(MemoryPersistence::<Deployment>::default()),
            environments: Box::new(MemoryPersistence::<Environment>::default()),
            jobs: Box::new(JobMemoryPersistence::default()),
            locks: Box::new(MemoryPersistence::<ReleaseTargetLock>::default()),
            memberships: Box::new(MembershipMemoryPersistence::default()),
            policies: Box::new(MemoryPersistence::<Policy>::default()),
            relationships: Box::new(MemoryPersistence::<ResourceRelationship>::default()),
            releases: Box::new(MemoryPersistence::<Release>::default()),
            release_targets: Arc::new(MemoryPersistence::<ReleaseTarget>::default()),
            resources: Box::new(MemoryPersistence::<Resource>::default()),
            variables: Box::new(MemoryPersistence::<DeploymentVariable>::default()),
            versions: Box::new(MemoryPersistence::<DeploymentVersion>::default()),
        }
    }

    pub fn relational(db: Arc<sqlx::PgPool>) -> Self {
        use relational::*;

        Self {
            approvals: Box::new(ApprovalRelationalPersistence { db: Arc::clone(&db) }),
            deployments: Box::new(DeploymentRelationalPersistence { db: Arc::clone(&db) }),
            environments: Box::new(EnvironmentRelationalPersistence { db: Arc::clone(&db) }),
            jobs: Box::new(JobRelationalPersistence { db: Arc::clone(&db) }),
            locks: Box::new(LockRelationalPersistence { db: Arc::clone(&db) }),
            memberships: Box::new(MembershipRelationalPersistence { db: Arc::clone(&db) }),
            policies: Box::new(PolicyRelationalPersistence { db: Arc::clone(&db) }),
            relationships: Box::new(RelationshipRelationalPersistence { db: Arc::clone(&db) }),
            releases: Box::new(ReleaseRelationalPersistence { db: Arc::clone(&db) }),
            release_targets: Arc::new(ReleaseTargetRelationalPersistence { db: Arc::clone(&db) }),
            resources: Box::new(ResourceRelationalPersistence { db: Arc::clone(&db) }),
            variables: Box::new(VariableRelationalPersistence { db: Arc::clone(&db) }),
            versions: Box::new(VersionRelationalPersistence { db }),
        }
    }
}
