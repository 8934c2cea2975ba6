mod approval;
mod deployment;
mod environment;
mod job;
mod membership;
mod policy;
mod release;
mod release_target;
mod resource;
mod variable;
mod version;

pub use approval::{ApprovalDecision, ApprovalService};
pub use deployment::DeploymentService;
pub use environment::EnvironmentService;
pub use job::JobService;
pub use membership::MembershipService;
pub use policy::PolicyService;
pub use release::{ReleaseService, ReleaseUpsert};
pub use release_target::{
    make_evaluation_dedup_key, make_evaluation_event, PinVersion, ReleaseTargetService,
    ResyncResult,
};
pub use resource::{ResourceService, UpsertResourcesResult};
pub use variable::VariableService;
pub use version::VersionService;
