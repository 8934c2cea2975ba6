use async_trait::async_trait;
use std::sync::Arc;

use super::{Rule, RuleContext, RuleResult};
use crate::{
    models::{ApprovalRecord, ApprovalRequirements, DeploymentVersion},
    services::ApprovalService,
};

/// Checks recorded decisions against one policy's approval requirements.
pub fn check_approvals(
    requirements: &ApprovalRequirements,
    records: &[ApprovalRecord],
) -> Result<(), String> {
    if let Some(rejected) = records.iter().find(|record| !record.is_approved()) {
        return Err(format!("rejected by {}", rejected.user_id));
    }

    let approvals: Vec<&ApprovalRecord> =
        records.iter().filter(|record| record.is_approved()).collect();

    if let Some(any) = &requirements.any {
        if (approvals.len() as u32) < any.min_approvals {
            return Err(format!(
                "{} of {} approvals",
                approvals.len(),
                any.min_approvals
            ));
        }
    }

    for user in requirements.users.iter() {
        if !approvals.iter().any(|record| record.user_id == user.user_id) {
            return Err(format!("approval from {} missing", user.user_id));
        }
    }

    for role in requirements.roles.iter() {
        let count = approvals
            .iter()
            .filter(|record| record.role_ids.contains(&role.role_id))
            .count() as u32;

        if count < role.min_approvals {
            return Err(format!(
                "{} of {} approvals from role {}",
                count, role.min_approvals, role.role_id
            ));
        }
    }

    Ok(())
}

/// Keeps candidates that satisfy the approval requirements of every covering policy for
/// the target's environment.
#[derive(Debug)]
pub struct ApprovalRule {
    pub approval_service: Arc<ApprovalService>,
}

#[async_trait]
impl Rule for ApprovalRule {
    fn name(&self) -> &'static str {
        "approval"
    }

    async fn filter(
        &self,
        context: &RuleContext,
        candidates: Vec<DeploymentVersion>,
    ) -> anyhow::Result<RuleResult> {
        let requirements: Vec<&ApprovalRequirements> = context
            .policies
            .iter()
            .filter_map(|policy| policy.approvals.as_ref())
            .filter(|requirements| !requirements.is_empty())
            .collect();

        if requirements.is_empty() {
            return Ok(RuleResult::allow(candidates));
        }

        let mut allowed = Vec::new();
        let mut first_reason = None;

        for candidate in candidates {
            let records = self
                .approval_service
                .list_by_version_and_environment(&candidate.id, &context.environment.id)
                .await?;

            let verdict = requirements
                .iter()
                .try_for_each(|requirements| check_approvals(requirements, &records));

            match verdict {
                Ok(()) => allowed.push(candidate),
                Err(reason) => {
                    if first_reason.is_none() {
                        first_reason = Some(format!(
                            "version {} is awaiting approval: {}",
                            candidate.tag, reason
                        ));
                    }
                }
            }
        }

        Ok(RuleResult {
            allowed,
            reason: first_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ServiceContext,
        models::{AnyApproval, ApprovalStatus, Policy, RoleApproval, UserApproval},
        policy::tests::rule_context,
        services::ApprovalDecision,
        test::{
            get_deployment_fixture, get_environment_fixture, get_policy_fixture,
            get_version_fixture,
        },
    };
    use chrono::Utc;

    fn record(user_id: &str, roles: &[&str], status: ApprovalStatus) -> ApprovalRecord {
        ApprovalRecord {
            id: ApprovalRecord::make_id("version-1", "environment-1", user_id),
            deployment_version_id: "version-1".to_owned(),
            environment_id: "environment-1".to_owned(),
            user_id: user_id.to_owned(),
            role_ids: roles.iter().map(|role| role.to_string()).collect(),
            status,
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_any_user_and_role_requirements() {
        let requirements = ApprovalRequirements {
            any: Some(AnyApproval { min_approvals: 2 }),
            users: vec![UserApproval {
                user_id: "alice".to_owned(),
            }],
            roles: vec![RoleApproval {
                role_id: "sre".to_owned(),
                min_approvals: 1,
            }],
        };

        let one = vec![record("alice", &[], ApprovalStatus::Approved)];
        assert!(check_approvals(&requirements, &one).is_err());

        let without_role = vec![
            record("alice", &[], ApprovalStatus::Approved),
            record("bob", &[], ApprovalStatus::Approved),
        ];
        let err = check_approvals(&requirements, &without_role).unwrap_err();
        assert!(err.contains("sre"));

        let satisfied = vec![
            record("alice", &[], ApprovalStatus::Approved),
            record("bob", &["sre"], ApprovalStatus::Approved),
        ];
        assert!(check_approvals(&requirements, &satisfied).is_ok());

        let mut vetoed = satisfied;
        vetoed.push(record("carol", &["sre"], ApprovalStatus::Rejected));
        assert_eq!(
            check_approvals(&requirements, &vetoed).unwrap_err(),
            "rejected by carol"
        );
    }

    #[tokio::test]
    async fn test_missing_approval_holds_version_until_recorded() {
        let context = ServiceContext::memory();
        let environment = get_environment_fixture(None);
        let version = get_version_fixture(None);

        context
            .environment_service
            .upsert(&environment, &None)
            .await
            .unwrap();
        context
            .deployment_service
            .upsert(&get_deployment_fixture(None), &None)
            .await
            .unwrap();
        context
            .version_service
            .create(&version, &None)
            .await
            .unwrap();

        let rule = ApprovalRule {
            approval_service: Arc::clone(&context.approval_service),
        };
        let mut rule_context = rule_context();
        rule_context.policies = vec![Policy {
            approvals: Some(ApprovalRequirements {
                users: vec![UserApproval {
                    user_id: "alice".to_owned(),
                }],
                ..ApprovalRequirements::default()
            }),
            ..get_policy_fixture(None)
        }];

        let result = rule
            .filter(&rule_context, vec![version.clone()])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());
        assert_eq!(
            result.reason.as_deref(),
            Some("version 1.0.0 is awaiting approval: approval from alice missing")
        );

        let decision = ApprovalDecision {
            user_id: "bob".to_owned(),
            role_ids: vec![],
            status: ApprovalStatus::Approved,
            reason: None,
        };
        context
            .approval_service
            .record(&version.id, &environment.id, &decision, &None)
            .await
            .unwrap();
        let result = rule
            .filter(&rule_context, vec![version.clone()])
            .await
            .unwrap();
        assert!(result.allowed.is_empty());

        let decision = ApprovalDecision {
            user_id: "alice".to_owned(),
            ..decision
        };
        context
            .approval_service
            .record(&version.id, &environment.id, &decision, &None)
            .await
            .unwrap();
        let result = rule
            .filter(&rule_context, vec![version.clone()])
            .await
            .unwrap();
        assert_eq!(result.allowed, vec![version]);
        assert!(result.reason.is_none());
    }
}
