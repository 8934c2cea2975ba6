mod catalog;
mod generic;
mod job;
mod membership;
mod release;
mod resource;

pub use generic::MemoryPersistence;
pub use job::JobMemoryPersistence;
pub use membership::MembershipMemoryPersistence;

use crate::models::{
    ApprovalRecord, Deployment, DeploymentVariable, DeploymentVersion, Environment, Policy,
    Release, ReleaseTarget, ReleaseTargetLock, Resource, ResourceRelationship,
};

pub type ApprovalMemoryPersistence = MemoryPersistence<ApprovalRecord>;
pub type DeploymentMemoryPersistence = MemoryPersistence<Deployment>;
pub type EnvironmentMemoryPersistence = MemoryPersistence<Environment>;
pub type LockMemoryPersistence = MemoryPersistence<ReleaseTargetLock>;
pub type PolicyMemoryPersistence = MemoryPersistence<Policy>;
pub type RelationshipMemoryPersistence = MemoryPersistence<ResourceRelationship>;
pub type ReleaseMemoryPersistence = MemoryPersistence<Release>;
pub type ReleaseTargetMemoryPersistence = MemoryPersistence<ReleaseTarget>;
pub type ResourceMemoryPersistence = MemoryPersistence<Resource>;
pub type VariableMemoryPersistence = MemoryPersistence<DeploymentVariable>;
pub type VersionMemoryPersistence = MemoryPersistence<DeploymentVersion>;
