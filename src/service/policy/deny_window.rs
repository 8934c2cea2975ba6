use async_trait::async_trait;

use super::{Rule, RuleContext, RuleResult};
use crate::models::DeploymentVersion;

/// Blocks every candidate while any deny window of a covering policy is open.
#[derive(Debug, Default)]
pub struct DenyWindowRule;

#[async_trait]
impl Rule for DenyWindowRule {
    fn name(&self) -> &'static str {
        "deny_window"
    }

    async fn filter(
        &self,
        context: &RuleContext,
        candidates: Vec<DeploymentVersion>,
    ) -> anyhow::Result<RuleResult> {
        for policy in context.policies.iter() {
            for deny_window in policy.deny_windows.iter() {
                if let Some(until) = deny_window.active_until(context.now) {
                    return Ok(RuleResult::block(format!(
                        "deny window '{}' of policy '{}' is active until {}",
                        deny_window.name,
                        policy.name,
                        until.to_rfc3339()
                    )));
                }
            }
        }

        Ok(RuleResult::allow(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::DenyWindow,
        policy::tests::rule_context,
        test::{get_policy_fixture, get_version_fixture},
    };
    use chrono::Duration;

    #[tokio::test]
    async fn test_open_window_blocks_everything() {
        let mut context = rule_context();
        let mut policy = get_policy_fixture(None);
        policy.deny_windows.push(DenyWindow {
            name: "freeze".to_owned(),
            starts_at: context.now,
            ends_at: context.now + Duration::hours(1),
            recurrence: None,
        });
        context.policies = vec![policy];

        let result = DenyWindowRule
            .filter(&context, vec![get_version_fixture(None)])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());
        assert!(result.reason.unwrap().contains("freeze"));

        context.now = context.now + Duration::hours(2);
        let result = DenyWindowRule
            .filter(&context, vec![get_version_fixture(None)])
            .await
            .unwrap();
        assert_eq!(result.allowed.len(), 1);
        assert!(result.reason.is_none());
    }
}
