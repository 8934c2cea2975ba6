mod job_lifecycle;
mod reconciler;
mod release_manager;

pub use job_lifecycle::{JobLifecycle, JobUpdateOutcome};
pub use reconciler::Reconciler;
pub use release_manager::{EvaluationPreview, EvaluationResult, ReleaseManager};
