mod approval;
mod deployment;
mod environment;
mod job;
mod lock;
mod membership;
mod policy;
mod release;
mod release_target;
mod resource;
mod variable;
mod version;

pub use approval::{ApprovalRecord, ApprovalStatus};
pub use deployment::Deployment;
pub use environment::Environment;
pub use job::{Job, JobStatus, JobStatusUpdate, JobTransition};
pub use lock::ReleaseTargetLock;
pub use membership::{MembershipKind, MembershipScope};
pub use policy::{
    AnyApproval, ApprovalRequirements, DenyWindow, Policy, PolicyTarget, Recurrence,
    RecurrenceFrequency, ReleaseSequencing, RetryRule, RoleApproval, RolloutRule, UserApproval,
};
pub use release::{EvaluationRequest, ExitHook, Release};
pub use release_target::ReleaseTarget;
pub use resource::{Resource, ResourceRelationship, ResourceToInsert};
pub use variable::{DeploymentVariable, VariableValue};
pub use version::{DeploymentVersion, VersionDependency, VersionStatus};
