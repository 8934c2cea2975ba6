mod approval;
mod dependency;
mod deny_window;
mod engine;
mod rollout;
mod rule;
mod sequencing;

pub use approval::{check_approvals, ApprovalRule};
pub use dependency::DependencyRule;
pub use deny_window::DenyWindowRule;
pub use engine::{PolicyEngine, PolicyEvaluation};
pub use rollout::{fnv1a32, is_rolled_out, rollout_key, rollout_percentage, RolloutRule};
pub use rule::{Rule, RuleContext, RuleResult};
pub use sequencing::{release_sequencing, SequencingRule};
