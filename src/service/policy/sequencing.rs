use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};

use super::{Rule, RuleContext, RuleResult};
use crate::{
    models::{DeploymentVersion, Policy, ReleaseSequencing},
    services::{JobService, ReleaseService},
};

/// Sequencing of the highest priority policy that sets one.
pub fn release_sequencing(policies: &[Policy]) -> Option<ReleaseSequencing> {
    policies.iter().find_map(|policy| policy.sequencing)
}

/// Under `wait` sequencing, holds back every version but the in-flight one while a job
/// of the target is still active.
#[derive(Debug)]
pub struct SequencingRule {
    pub job_service: Arc<JobService>,
    pub release_service: Arc<ReleaseService>,
}

#[async_trait]
impl Rule for SequencingRule {
    fn name(&self) -> &'static str {
        "sequencing"
    }

    async fn filter(
        &self,
        context: &RuleContext,
        candidates: Vec<DeploymentVersion>,
    ) -> anyhow::Result<RuleResult> {
        if release_sequencing(&context.policies) != Some(ReleaseSequencing::Wait) {
            return Ok(RuleResult::allow(candidates));
        }

        let active_jobs = self
            .job_service
            .list_active_by_release_target(&context.release_target.id)
            .await?;

        let in_flight_job = match active_jobs.first() {
            Some(job) => job.clone(),
            None => return Ok(RuleResult::allow(candidates)),
        };

        let mut in_flight_versions = HashSet::new();
        for job in active_jobs.iter() {
            if let Some(release) = self.release_service.get_by_id(&job.release_id).await? {
                in_flight_versions.insert(release.version_id);
            }
        }

        let allowed: Vec<DeploymentVersion> = candidates
            .into_iter()
            .filter(|candidate| in_flight_versions.contains(&candidate.id))
            .collect();

        let reason = match allowed.is_empty() {
            true => Some(format!(
                "waiting for in-flight job {} to finish",
                in_flight_job.id
            )),
            false => None,
        };

        Ok(RuleResult { allowed, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ServiceContext,
        policy::tests::rule_context,
        test::{get_job_fixture, get_policy_fixture, get_release_fixture, get_version_fixture},
    };

    #[test]
    fn test_first_policy_with_sequencing_wins() {
        let policies = vec![
            get_policy_fixture(Some("unset")),
            Policy {
                sequencing: Some(ReleaseSequencing::Cancel),
                ..get_policy_fixture(Some("cancel"))
            },
            Policy {
                sequencing: Some(ReleaseSequencing::Wait),
                ..get_policy_fixture(Some("wait"))
            },
        ];

        assert_eq!(
            release_sequencing(&policies),
            Some(ReleaseSequencing::Cancel)
        );
        assert_eq!(release_sequencing(&[]), None);
    }

    #[tokio::test]
    async fn test_wait_holds_back_newer_versions() {
        let context = ServiceContext::memory();
        let rule = SequencingRule {
            job_service: Arc::clone(&context.job_service),
            release_service: Arc::clone(&context.release_service),
        };

        let mut rule_context = rule_context();
        rule_context.policies = vec![Policy {
            sequencing: Some(ReleaseSequencing::Wait),
            ..get_policy_fixture(None)
        }];

        let candidates = vec![get_version_fixture(Some("2.0.0")), get_version_fixture(None)];

        let result = rule
            .filter(&rule_context, candidates.clone())
            .await
            .unwrap();
        assert_eq!(result, RuleResult::allow(candidates.clone()));

        context
            .release_service
            .persistence
            .upsert(&get_release_fixture(None))
            .await
            .unwrap();
        context
            .job_service
            .persistence
            .upsert(&get_job_fixture(None))
            .await
            .unwrap();

        let result = rule
            .filter(&rule_context, candidates.clone())
            .await
            .unwrap();
        assert_eq!(result.allowed, vec![get_version_fixture(None)]);

        let result = rule
            .filter(&rule_context, vec![get_version_fixture(Some("2.0.0"))])
            .await
            .unwrap();
        assert_eq!(
            result.reason.as_deref(),
            Some("waiting for in-flight job job-fixture to finish")
        );
    }
}
